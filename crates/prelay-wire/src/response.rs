//! Non-streaming Messages response body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WireError, WireResult};
use crate::message::ContentBlock;

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// A complete (non-streaming) Messages response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessagesResponse {
    /// Parses a raw response body.
    ///
    /// # Errors
    /// Returns a parse error if the body is not a Messages response.
    pub fn from_slice(body: &[u8]) -> WireResult<Self> {
        serde_json::from_slice(body)
            .map_err(|err| WireError::parse(format!("invalid messages response: {err}")))
    }

    /// Concatenated text content of the response.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let Some(text) = block.as_text() {
                out.push_str(text);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_response_with_cache_usage() {
        let body = json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 100,
                "output_tokens": 20,
                "cache_read_input_tokens": 80,
                "cache_creation_input_tokens": 0,
                "server_tool_use": {"web_search_requests": 0}
            }
        });
        let parsed = MessagesResponse::from_slice(body.to_string().as_bytes()).unwrap();

        assert_eq!(parsed.usage.input_tokens, 100);
        assert_eq!(parsed.usage.cache_read_input_tokens, 80);
        assert_eq!(parsed.text(), "hello");
        assert_eq!(parsed.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn missing_usage_defaults_to_zero() {
        let body = json!({
            "id": "msg_02",
            "model": "claude-3-5-haiku-20241022",
            "content": []
        });
        let parsed = MessagesResponse::from_slice(body.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.usage, Usage::default());
    }
}
