//! Pure event-to-frame translation.
//!
//! Workers in the translate pool run [`translate`] concurrently; everything
//! stateful (tool ordinals, accumulators, usage) stays with the scanner, so
//! a translation job is self-contained data in, one SSE frame out.

use prelay_wire::chunk::{
    ChatCompletion, ChatCompletionChunk, ChunkDelta, ChunkUsage, CompletionMessage, FunctionCall,
    FunctionDelta, ToolCall, ToolCallDelta, map_stop_reason, sse_frame,
};
use prelay_wire::{ContentBlock, MessagesResponse};

/// Per-request constants stamped on every downstream frame.
#[derive(Debug, Clone)]
pub(crate) struct FrameMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
}

/// One translation job: everything needed to render a downstream frame.
#[derive(Debug, Clone)]
pub(crate) enum TranslateInput {
    /// Opening chunk announcing the assistant role.
    Role,
    Text {
        text: String,
    },
    ToolStart {
        ordinal: u32,
        id: String,
        name: String,
    },
    ToolArgs {
        ordinal: u32,
        partial_json: String,
    },
    Reasoning {
        text: String,
    },
    Finish {
        finish_reason: String,
        usage: ChunkUsage,
    },
    ErrorFrame {
        error_type: String,
        message: String,
    },
    Done,
}

/// Renders one frame. Pure: same input, same output.
pub(crate) fn translate(meta: &FrameMeta, input: TranslateInput) -> String {
    match input {
        TranslateInput::Role => ChatCompletionChunk::delta(
            &meta.id,
            meta.created,
            &meta.model,
            ChunkDelta {
                role: Some("assistant".to_string()),
                ..ChunkDelta::default()
            },
        )
        .to_frame(),
        TranslateInput::Text { text } => ChatCompletionChunk::delta(
            &meta.id,
            meta.created,
            &meta.model,
            ChunkDelta {
                content: Some(text),
                ..ChunkDelta::default()
            },
        )
        .to_frame(),
        TranslateInput::ToolStart { ordinal, id, name } => ChatCompletionChunk::delta(
            &meta.id,
            meta.created,
            &meta.model,
            ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: ordinal,
                    id: Some(id),
                    kind: Some("function".to_string()),
                    function: FunctionDelta {
                        name: Some(name),
                        arguments: None,
                    },
                }]),
                ..ChunkDelta::default()
            },
        )
        .to_frame(),
        TranslateInput::ToolArgs {
            ordinal,
            partial_json,
        } => ChatCompletionChunk::delta(
            &meta.id,
            meta.created,
            &meta.model,
            ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: ordinal,
                    id: None,
                    kind: None,
                    function: FunctionDelta {
                        name: None,
                        arguments: Some(partial_json),
                    },
                }]),
                ..ChunkDelta::default()
            },
        )
        .to_frame(),
        TranslateInput::Reasoning { text } => ChatCompletionChunk::delta(
            &meta.id,
            meta.created,
            &meta.model,
            ChunkDelta {
                reasoning_content: Some(text),
                ..ChunkDelta::default()
            },
        )
        .to_frame(),
        TranslateInput::Finish {
            finish_reason,
            usage,
        } => {
            ChatCompletionChunk::finish(&meta.id, meta.created, &meta.model, finish_reason, usage)
                .to_frame()
        }
        TranslateInput::ErrorFrame {
            error_type,
            message,
        } => sse_frame(
            &serde_json::json!({
                "error": {"type": error_type, "message": message}
            })
            .to_string(),
        ),
        TranslateInput::Done => prelay_wire::DONE_FRAME.to_string(),
    }
}

/// Translates a complete non-streaming response body.
pub(crate) fn completion_from_response(
    meta: &FrameMeta,
    response: &MessagesResponse,
    usage: ChunkUsage,
) -> ChatCompletion {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in &response.content {
        match block {
            ContentBlock::Text { text, .. } => content.push_str(text),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(thinking),
            ContentBlock::ToolUse {
                id, name, input, ..
            } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    let message = CompletionMessage {
        role: "assistant".to_string(),
        content: Some(content),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    };
    let finish_reason = response.stop_reason.as_deref().map(map_stop_reason);
    ChatCompletion::new(
        &meta.id,
        meta.created,
        &meta.model,
        message,
        finish_reason,
        usage,
    )
}
