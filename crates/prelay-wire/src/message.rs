//! Claude Messages request body.
//!
//! These types round-trip: fields the gateway does not model are captured in
//! flattened passthrough maps so a parse → mutate → serialize cycle preserves
//! them. The injector rewrites `system` and sets `cache_control` markers; it
//! must never lose parts of the body it does not understand.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WireError, WireResult};

/// Upstream cache entry lifetime carried on `cache_control.ttl`.
///
/// The short tier is the provider default and is expressed by omitting the
/// `ttl` field entirely; only the long tier is spelled out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTtl {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

/// Cache breakpoint marker: `{"type": "ephemeral", "ttl": "5m" | "1h"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: CacheControlKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<CacheTtl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheControlKind {
    Ephemeral,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: CacheControlKind::Ephemeral,
            ttl: None,
        }
    }

    pub fn ephemeral_with_ttl(ttl: Option<CacheTtl>) -> Self {
        Self {
            kind: CacheControlKind::Ephemeral,
            ttl,
        }
    }
}

/// Base64-inlined image payload. URL-referenced images are inlined by the
/// fetch layer before a body reaches this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A typed content block. Every variant may carry a `cache_control` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Image {
        source: ImageSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ContentBlock {
    /// Plain text block without a marker.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
            extra: Map::new(),
        }
    }

    /// Text block carrying a cache breakpoint.
    pub fn cached_text(text: impl Into<String>, cache_control: CacheControl) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: Some(cache_control),
            extra: Map::new(),
        }
    }

    pub fn cache_control(&self) -> Option<&CacheControl> {
        match self {
            Self::Text { cache_control, .. }
            | Self::Image { cache_control, .. }
            | Self::ToolUse { cache_control, .. }
            | Self::ToolResult { cache_control, .. }
            | Self::Thinking { cache_control, .. } => cache_control.as_ref(),
        }
    }

    pub fn set_cache_control(&mut self, marker: CacheControl) {
        match self {
            Self::Text { cache_control, .. }
            | Self::Image { cache_control, .. }
            | Self::ToolUse { cache_control, .. }
            | Self::ToolResult { cache_control, .. }
            | Self::Thinking { cache_control, .. } => *cache_control = Some(marker),
        }
    }

    /// Text payload, if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Message content: a bare string or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Converts bare-string content into a one-element block list in place.
    pub fn ensure_blocks(&mut self) -> &mut Vec<ContentBlock> {
        if let MessageContent::Text(text) = self {
            let text = std::mem::take(text);
            *self = MessageContent::Blocks(vec![ContentBlock::text(text)]);
        }
        match self {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => unreachable!("converted above"),
        }
    }

    fn marker_count(&self) -> usize {
        match self {
            MessageContent::Text(_) => 0,
            MessageContent::Blocks(blocks) => {
                blocks.iter().filter(|b| b.cache_control().is_some()).count()
            }
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(content.into()),
            extra: Map::new(),
        }
    }
}

/// The `system` field: a bare string pre-injection, an ordered block list
/// post-injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemContent {
    fn marker_count(&self) -> usize {
        match self {
            SystemContent::Text(_) => 0,
            SystemContent::Blocks(blocks) => {
                blocks.iter().filter(|b| b.cache_control().is_some()).count()
            }
        }
    }
}

/// A Claude Messages API request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemContent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageRequest {
    /// Parses a raw request body.
    ///
    /// # Errors
    /// Returns a parse error if the body is not valid JSON or does not fit
    /// the Messages shape.
    pub fn from_slice(body: &[u8]) -> WireResult<Self> {
        serde_json::from_slice(body)
            .map_err(|err| WireError::parse(format!("invalid messages body: {err}")))
    }

    /// Serializes the request back into a JSON body.
    ///
    /// # Errors
    /// Returns a parse error if serialization fails.
    pub fn to_vec(&self) -> WireResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| WireError::parse(format!("serialize messages body: {err}")))
    }

    /// Total number of `cache_control` markers across system and messages.
    ///
    /// The provider rejects bodies with more than four; the injector budgets
    /// against this count.
    pub fn cache_marker_count(&self) -> usize {
        let system = self.system.as_ref().map_or(0, SystemContent::marker_count);
        let messages: usize = self.messages.iter().map(|m| m.content.marker_count()).sum();
        system + messages
    }

    /// Concatenated text of all user-visible message content, used for
    /// fallback token estimation.
    pub fn visible_text(&self) -> String {
        let mut out = String::new();
        if let Some(SystemContent::Text(text)) = &self.system {
            out.push_str(text);
        } else if let Some(SystemContent::Blocks(blocks)) = &self.system {
            for block in blocks {
                if let Some(text) = block.as_text() {
                    out.push_str(text);
                }
            }
        }
        for message in &self.messages {
            match &message.content {
                MessageContent::Text(text) => out.push_str(text),
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        if let Some(text) = block.as_text() {
                            out.push_str(text);
                        }
                    }
                }
            }
        }
        out
    }
}
