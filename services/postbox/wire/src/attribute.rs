//! Attribute messages: a type, a body and named string attributes.

use crate::codec::{WireCodec, BODY_ATTRIBUTE};
use crate::{RawMessage, WireError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Application-level message carried inside a [`RawMessage`]
///
/// The body travels as the reserved attribute [`BODY_ATTRIBUTE`], which is
/// therefore never stored in `attrs`. Values must not contain `[`, `]`, `(`,
/// `)` or newlines, and names must not contain spaces, for the message to
/// survive a trip over the wire unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMessage {
    /// Message type (topic)
    pub msg_type: String,
    /// Free text body
    pub body: String,
    /// Named attributes
    attrs: BTreeMap<String, String>,
}

impl AttributeMessage {
    /// Create an empty message of the given type
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            ..Self::default()
        }
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set an attribute
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Set an attribute; the reserved body name writes the body instead
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if name == BODY_ATTRIBUTE {
            self.body = value.into();
        } else {
            self.attrs.insert(name, value.into());
        }
    }

    /// Look up an attribute
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Remove an attribute, returning its value
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attrs.remove(name)
    }

    /// All attributes, excluding the body
    pub fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }

    /// Decode a raw message
    pub fn from_raw(raw: &RawMessage) -> Result<Self, WireError> {
        let mut msg = Self::new(raw.msg_type.clone());
        for (name, value) in WireCodec::decode(&raw.text)? {
            msg.set_attr(name, value);
        }
        Ok(msg)
    }

    /// Encode into a raw message, body first
    pub fn to_raw(&self) -> RawMessage {
        let pairs = std::iter::once((BODY_ATTRIBUTE, self.body.as_str())).chain(
            self.attrs
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );
        RawMessage::new(self.msg_type.clone(), WireCodec::encode(pairs))
    }
}

impl TryFrom<&RawMessage> for AttributeMessage {
    type Error = WireError;

    fn try_from(raw: &RawMessage) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<&AttributeMessage> for RawMessage {
    fn from(msg: &AttributeMessage) -> Self {
        msg.to_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_back_and_forth() {
        let msg = AttributeMessage::new("Foo")
            .with_attr("Bar", "Baz")
            .with_attr("Zup", "Zap");

        let raw = msg.to_raw();
        assert_eq!(raw.msg_type, "Foo");

        let back = AttributeMessage::from_raw(&raw).unwrap();
        assert_eq!(back.msg_type, "Foo");
        assert_eq!(back.attr("Bar"), Some("Baz"));
        assert_eq!(back, msg);
    }

    #[test]
    fn test_body_is_encoded_first() {
        let raw = AttributeMessage::new("Number")
            .with_body("1")
            .with_attr("id", "p0")
            .to_raw();
        assert_eq!(raw.text, "[11 (m_body 1)\n][8 (id p0)\n]");
    }

    #[test]
    fn test_body_attribute_is_routed_to_body() {
        let mut msg = AttributeMessage::new("T");
        msg.set_attr(BODY_ATTRIBUTE, "payload");
        assert_eq!(msg.body, "payload");
        assert!(msg.attrs().is_empty());

        let raw = RawMessage::new("T", "[17 (m_body payload)\n][6 (k v)\n]");
        let decoded = AttributeMessage::from_raw(&raw).unwrap();
        assert_eq!(decoded.body, "payload");
        assert_eq!(decoded.attr(BODY_ATTRIBUTE), None);
        assert_eq!(decoded.attr("k"), Some("v"));
    }

    #[test]
    fn test_empty_text_decodes_to_empty_message() {
        let decoded = AttributeMessage::from_raw(&RawMessage::new("Ping", "")).unwrap();
        assert_eq!(decoded, AttributeMessage::new("Ping"));
    }

    #[test]
    fn test_round_trip_with_spaces_and_unicode() {
        let msg = AttributeMessage::new("Status")
            .with_body("disk space low on /var")
            .with_attr("host", "kone-1")
            .with_attr("note", "ääkköset ovat ok")
            .with_attr("empty", "");
        let back = AttributeMessage::try_from(&RawMessage::from(&msg)).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_malformed_text_is_rejected() {
        let raw = RawMessage::new("T", "[99 (m_body x)\n]");
        assert!(matches!(
            AttributeMessage::from_raw(&raw),
            Err(WireError::Malformed { .. })
        ));
    }

    #[test]
    fn test_remove_attr() {
        let mut msg = AttributeMessage::new("T").with_attr("a", "1");
        assert_eq!(msg.remove_attr("a"), Some("1".to_string()));
        assert_eq!(msg.attr("a"), None);
    }
}
