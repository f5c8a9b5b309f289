//! The flat `(type, text)` message exchanged with the transport.

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Separator between the message type and the text in a transport payload
pub const TYPE_SEPARATOR: u8 = b'\t';

/// Atomic message unit; `msg_type` doubles as the topic group
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawMessage {
    /// Message type, also the group the message is published to
    pub msg_type: String,
    /// Free text payload
    pub text: String,
}

impl RawMessage {
    /// Create a new raw message
    pub fn new(msg_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            text: text.into(),
        }
    }

    /// Size of the transport payload in bytes (`type + "\t" + text`)
    pub fn encoded_len(&self) -> usize {
        self.msg_type.len() + 1 + self.text.len()
    }

    /// Check that the type can be used as a group name and split back off
    pub fn validate_type(msg_type: &str) -> Result<(), WireError> {
        if msg_type.is_empty() || msg_type.as_bytes().contains(&TYPE_SEPARATOR) {
            return Err(WireError::InvalidType(msg_type.to_string()));
        }
        Ok(())
    }

    /// Encode into the transport payload
    pub fn to_transport_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(self.msg_type.as_bytes());
        buf.put_u8(TYPE_SEPARATOR);
        buf.put_slice(self.text.as_bytes());
        buf.freeze()
    }

    /// Decode a transport payload, splitting at the first separator
    pub fn from_transport_bytes(payload: &[u8]) -> Result<Self, WireError> {
        let (msg_type, text) = split_type(payload)?;
        Ok(Self {
            msg_type: utf8(msg_type)?,
            text: utf8(text)?,
        })
    }
}

/// Split a transport payload into its type and text halves
pub(crate) fn split_type(payload: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    let tab = payload
        .iter()
        .position(|&b| b == TYPE_SEPARATOR)
        .ok_or(WireError::MissingSeparator)?;
    Ok((&payload[..tab], &payload[tab + 1..]))
}

pub(crate) fn utf8(bytes: &[u8]) -> Result<String, WireError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| WireError::Utf8)
}
