use std::fmt;

use serde::{Deserialize, Serialize};

/// Categories of wire-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    /// Body or event payload is not valid JSON / does not fit the schema.
    Parse,
    /// The payload parsed but violates the protocol (missing required field,
    /// explicit upstream error object).
    Protocol,
}

impl fmt::Display for WireErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireErrorKind::Parse => write!(f, "parse"),
            WireErrorKind::Protocol => write!(f, "protocol"),
        }
    }
}

/// Structured wire error with kind and a one-line summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
}

impl WireError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Parse,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Protocol,
            message: message.into(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WireError {}

/// Result type for wire operations.
pub type WireResult<T> = std::result::Result<T, WireError>;
