//! Gateway error types.
//!
//! The core never panics out of the pipeline: per-request optimization
//! failures degrade to "unoptimized but correct", warmup failures are logged
//! and retried on the next tick, and only upstream-caused errors reach the
//! client.

use std::fmt;

use prelay_wire::{WireError, WireErrorKind};
use serde_json::Value;

/// Categories of gateway errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    /// Invalid channel or gateway configuration (bundle below the token
    /// minimum, out-of-range threshold). Surfaced at load, never per request.
    ConfigInvalid,
    /// Request body is not valid JSON or does not fit the Messages shape.
    /// Recovered locally: the original body is forwarded.
    RequestParseFailed,
    /// Internal injection invariant violation (marker budget unreducible).
    /// Recovered locally, same policy.
    InjectionFailed,
    /// Network failure talking to the provider.
    UpstreamTransport,
    /// Unparseable stream line, missing field, or explicit upstream error.
    UpstreamProtocol,
    /// Warmup dispatch failed; logged at warn, retried next tick.
    WarmupFailed,
    /// Usage record write failed; logged, never affects the served request.
    PersistenceFailed,
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayErrorKind::ConfigInvalid => "config_invalid",
            GatewayErrorKind::RequestParseFailed => "request_parse_failed",
            GatewayErrorKind::InjectionFailed => "injection_failed",
            GatewayErrorKind::UpstreamTransport => "upstream_transport",
            GatewayErrorKind::UpstreamProtocol => "upstream_protocol",
            GatewayErrorKind::WarmupFailed => "warmup_failed",
            GatewayErrorKind::PersistenceFailed => "persistence_failed",
        };
        write!(f, "{name}")
    }
}

/// Structured gateway error with kind, summary, and optional detail.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
    pub details: Option<String>,
    /// Upstream HTTP status, when the error carries one.
    pub status: Option<u16>,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            status: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::ConfigInvalid, message)
    }

    pub fn injection(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::InjectionFailed, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::UpstreamTransport, message)
    }

    pub fn warmup(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::WarmupFailed, message)
    }

    /// Builds an upstream-protocol error from an HTTP status and body,
    /// extracting the provider's error message when the body carries one.
    pub fn http_status(status: u16, body: &str) -> Self {
        let mut message = format!("HTTP {status}");
        let details = if body.is_empty() {
            None
        } else {
            if let Ok(json) = serde_json::from_str::<Value>(body)
                && let Some(error_obj) = json.get("error")
                && let Some(msg) = error_obj.get("message").and_then(|v| v.as_str())
            {
                message = format!("HTTP {status}: {msg}");
            }
            Some(body.to_string())
        };
        Self {
            kind: GatewayErrorKind::UpstreamProtocol,
            message,
            details,
            status: Some(status),
        }
    }

    /// Builds an upstream-protocol error from a mid-stream error event.
    pub fn upstream_event(error_type: &str, message: &str) -> Self {
        Self {
            kind: GatewayErrorKind::UpstreamProtocol,
            message: format!("{error_type}: {message}"),
            details: None,
            status: None,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GatewayError {}

impl From<WireError> for GatewayError {
    fn from(err: WireError) -> Self {
        let kind = match err.kind {
            WireErrorKind::Parse => GatewayErrorKind::RequestParseFailed,
            WireErrorKind::Protocol => GatewayErrorKind::UpstreamProtocol,
        };
        Self::new(kind, err.message)
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
