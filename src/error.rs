//! Error types for SCHC operations

use thiserror::Error;

use crate::field_id::Layer;

#[derive(Error, Debug)]
pub enum SchcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A header could not be flattened (bad version, malformed CoAP, ...).
    /// Compression recovers from this by sending the layer verbatim.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Compressed packet needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("No {layer} rule with ID {rule_id}")]
    RuleNotFound { layer: Layer, rule_id: u32 },

    #[error("No matching rule ID found")]
    UnknownRuleId,

    #[error("Unknown device {0}")]
    UnknownDevice(u32),

    #[error("Compressed data exhausted: need {needed} bits at position {position}, {remaining} left")]
    CursorOverrun {
        needed: usize,
        position: usize,
        remaining: usize,
    },

    #[error("Bit range {start}..{end} outside buffer of {len} bits")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("Cannot read {0} bits into a 32-bit word")]
    WordTooWide(usize),

    #[error("Bit arrays differ in length: {0} vs {1}")]
    LengthMismatch(usize, usize),

    #[error("Compression action {0} is not supported")]
    UnsupportedAction(&'static str),

    #[error("Rule validation error: {0}")]
    RuleValidation(String),
}

pub type Result<T> = std::result::Result<T, SchcError>;
