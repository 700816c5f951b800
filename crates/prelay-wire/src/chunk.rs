//! Downstream (client-facing) response format.
//!
//! The gateway relays provider responses to clients as OpenAI-style
//! `chat.completion` objects: streaming responses as `chat.completion.chunk`
//! SSE frames terminated by `data: [DONE]`, non-streaming responses as a
//! single `chat.completion` body.

use serde::{Deserialize, Serialize};

/// Terminal SSE frame for a downstream stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Wraps a JSON payload into a downstream SSE frame.
pub fn sse_frame(json: &str) -> String {
    format!("data: {json}\n\n")
}

/// Translates an upstream stop reason into the downstream finish reason.
pub fn map_stop_reason(upstream: &str) -> String {
    match upstream {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One downstream streaming frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChunkUsage>,
}

impl ChatCompletionChunk {
    /// A chunk with a single choice at index 0 and no finish reason.
    pub fn delta(id: &str, created: i64, model: &str, delta: ChunkDelta) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// The terminal chunk carrying the finish reason and final usage.
    pub fn finish(
        id: &str,
        created: i64,
        model: &str,
        finish_reason: String,
        usage: ChunkUsage,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(finish_reason),
            }],
            usage: Some(usage),
        }
    }

    /// Serializes the chunk into a `data:` SSE frame.
    pub fn to_frame(&self) -> String {
        // serde_json cannot fail on these value types
        sse_frame(&serde_json::to_string(self).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: Option<String>,
}

/// Non-streaming downstream response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: ChunkUsage,
}

impl ChatCompletion {
    pub fn new(
        id: &str,
        created: i64,
        model: &str,
        message: CompletionMessage,
        finish_reason: Option<String>,
        usage: ChunkUsage,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion".to_string(),
            created,
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message,
                finish_reason,
            }],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_translation() {
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("stop_sequence"), "stop");
        assert_eq!(map_stop_reason("max_tokens"), "length");
        assert_eq!(map_stop_reason("tool_use"), "tool_calls");
        assert_eq!(map_stop_reason("pause_turn"), "pause_turn");
    }

    #[test]
    fn delta_chunk_serializes_minimal_shape() {
        let chunk = ChatCompletionChunk::delta(
            "chatcmpl-1",
            1_700_000_000,
            "claude-3-5-sonnet-20241022",
            ChunkDelta {
                content: Some("hi".to_string()),
                ..ChunkDelta::default()
            },
        );
        let value = serde_json::to_value(&chunk).unwrap();

        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "hi");
        assert!(value["choices"][0]["delta"].get("tool_calls").is_none());
        assert!(value.get("usage").is_none());
    }

    #[test]
    fn frame_format() {
        let chunk = ChatCompletionChunk::finish(
            "chatcmpl-2",
            1,
            "m",
            "stop".to_string(),
            ChunkUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            },
        );
        let frame = chunk.to_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
    }
}
