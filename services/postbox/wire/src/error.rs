//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Attribute frame structure is broken
    #[error("malformed frame at offset {offset}: {reason}")]
    Malformed {
        /// Byte offset of the frame start within the text
        offset: usize,
        /// What was missing or inconsistent
        reason: &'static str,
    },

    /// Length field is not a non-negative decimal integer
    #[error("invalid length field {field:?} at offset {offset}")]
    Length {
        /// Byte offset of the frame start within the text
        offset: usize,
        /// The offending field
        field: String,
    },

    /// Transport payload lacks the type separator
    #[error("missing type separator")]
    MissingSeparator,

    /// Payload bytes are not valid UTF-8
    #[error("payload is not valid utf-8")]
    Utf8,

    /// Message type is empty or contains the type separator
    #[error("invalid message type {0:?}")]
    InvalidType(String),
}
