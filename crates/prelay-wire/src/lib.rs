//! Claude Messages wire protocol for the prelay gateway.
//!
//! Request bodies ([`MessageRequest`]), non-streaming responses
//! ([`MessagesResponse`]), the upstream SSE event parser ([`SseParser`]),
//! and the OpenAI-style chunk types the gateway emits downstream.

pub mod chunk;
pub mod error;
pub mod message;
pub mod response;
pub mod sse;

pub use chunk::{ChatCompletion, ChatCompletionChunk, ChunkUsage, DONE_FRAME, map_stop_reason};
pub use error::{WireError, WireErrorKind, WireResult};
pub use message::{
    CacheControl, CacheTtl, ContentBlock, Message, MessageContent, MessageRequest, SystemContent,
};
pub use response::{MessagesResponse, Usage};
pub use sse::{DeltaUsage, SseParser, StartedBlock, StreamEvent};
