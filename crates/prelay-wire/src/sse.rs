//! Upstream SSE event parser.
//!
//! The provider's stream is line-oriented: each event is a `data:` line whose
//! JSON payload carries a `type` field, terminated by a literal
//! `data: [DONE]`. Dispatch happens on the payload's `type`, so the parser
//! works whether or not the upstream also sets the SSE `event:` field.

use std::pin::Pin;

use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use serde::Deserialize;

use crate::error::{WireError, WireResult};
use crate::response::Usage;

/// Partial usage payload on `message_delta`. Fields are optional: present
/// input counts replace the accumulated value, output counts add to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct DeltaUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
}

/// The content block announced by `content_block_start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartedBlock {
    Text { text: String },
    ToolUse { id: String, name: String },
    Thinking,
    Other,
}

/// Decoded upstream stream events.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        id: String,
        model: String,
        usage: Usage,
    },
    ContentBlockStart {
        index: usize,
        block: StartedBlock,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    InputJsonDelta {
        index: usize,
        partial_json: String,
    },
    ThinkingDelta {
        index: usize,
        thinking: String,
    },
    /// Opaque cryptographic blob; consumers must never forward the payload.
    SignatureDelta {
        index: usize,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<String>,
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Ping,
    /// Terminal `data: [DONE]` marker.
    Done,
    Error {
        error_type: String,
        message: String,
    },
    /// Event type this gateway does not know; skipped silently downstream.
    Unknown,
}

/// SSE parser converting an upstream byte stream into [`StreamEvent`]s.
pub struct SseParser<S> {
    inner: EventStream<S>,
}

impl<S> SseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
        }
    }
}

impl<S, E> Stream for SseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = WireResult<StreamEvent>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(parse_data_payload(&event.data))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(WireError::parse(format!(
                "SSE stream error: {e}"
            ))))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Parses one `data:` payload into a [`StreamEvent`].
///
/// # Errors
/// Returns a parse error for malformed JSON or payloads missing required
/// fields for their declared type.
pub fn parse_data_payload(data: &str) -> WireResult<StreamEvent> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(StreamEvent::Unknown);
    }
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }

    let envelope: Envelope = serde_json::from_str(data)
        .map_err(|err| WireError::parse(format!("malformed stream line: {err}")))?;

    match envelope.kind.as_str() {
        "ping" => Ok(StreamEvent::Ping),
        "message_start" => {
            let parsed: MessageStartPayload = from_payload(data, "message_start")?;
            Ok(StreamEvent::MessageStart {
                id: parsed.message.id,
                model: parsed.message.model,
                usage: parsed.message.usage,
            })
        }
        "content_block_start" => {
            let parsed: ContentBlockStartPayload = from_payload(data, "content_block_start")?;
            let block = match parsed.content_block.kind.as_str() {
                "text" => StartedBlock::Text {
                    text: parsed.content_block.text.unwrap_or_default(),
                },
                "tool_use" => StartedBlock::ToolUse {
                    id: parsed.content_block.id.unwrap_or_default(),
                    name: parsed.content_block.name.unwrap_or_default(),
                },
                "thinking" => StartedBlock::Thinking,
                _ => StartedBlock::Other,
            };
            Ok(StreamEvent::ContentBlockStart {
                index: parsed.index,
                block,
            })
        }
        "content_block_delta" => {
            let parsed: ContentBlockDeltaPayload = from_payload(data, "content_block_delta")?;
            match parsed.delta.kind.as_str() {
                "text_delta" => Ok(StreamEvent::TextDelta {
                    index: parsed.index,
                    text: parsed.delta.text.unwrap_or_default(),
                }),
                "input_json_delta" => Ok(StreamEvent::InputJsonDelta {
                    index: parsed.index,
                    partial_json: parsed.delta.partial_json.unwrap_or_default(),
                }),
                "thinking_delta" => Ok(StreamEvent::ThinkingDelta {
                    index: parsed.index,
                    thinking: parsed.delta.thinking.unwrap_or_default(),
                }),
                "signature_delta" => Ok(StreamEvent::SignatureDelta {
                    index: parsed.index,
                }),
                _ => Ok(StreamEvent::Unknown),
            }
        }
        "content_block_stop" => {
            let parsed: ContentBlockStopPayload = from_payload(data, "content_block_stop")?;
            Ok(StreamEvent::ContentBlockStop {
                index: parsed.index,
            })
        }
        "message_delta" => {
            let parsed: MessageDeltaPayload = from_payload(data, "message_delta")?;
            Ok(StreamEvent::MessageDelta {
                stop_reason: parsed.delta.stop_reason,
                usage: parsed.usage,
            })
        }
        "message_stop" => Ok(StreamEvent::MessageStop),
        "error" => {
            let parsed: ErrorPayload = from_payload(data, "error")?;
            Ok(StreamEvent::Error {
                error_type: parsed.error.kind,
                message: parsed.error.message,
            })
        }
        _ => Ok(StreamEvent::Unknown),
    }
}

fn from_payload<'a, T: Deserialize<'a>>(data: &'a str, event: &str) -> WireResult<T> {
    serde_json::from_str(data).map_err(|err| WireError::parse(format!("bad {event}: {err}")))
}

// === payload structures ===

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct MessageStartPayload {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    id: String,
    model: String,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartPayload {
    index: usize,
    content_block: ContentBlockInfo,
}

#[derive(Debug, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaPayload {
    index: usize,
    delta: DeltaInfo,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStopPayload {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaPayload {
    delta: MessageDeltaInner,
    #[serde(default)]
    usage: Option<DeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaInner {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}
