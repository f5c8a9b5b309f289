//! Encoding and decoding of attribute frames.
//!
//! Each `(name, value)` pair becomes one self-delimiting frame; frames are
//! concatenated without separators to form the text of a [`RawMessage`].
//!
//! [`RawMessage`]: crate::RawMessage

use crate::message::utf8;
use crate::WireError;
use std::fmt::Write;

/// Attribute name reserved for the message body
pub const BODY_ATTRIBUTE: &str = "m_body";

/// Fixed amount added to `len(name) + len(value)` in the length field
pub const FRAME_OVERHEAD: usize = 4;

const FRAME_TRAILER: &[u8] = b")\n]";

/// Attribute frame codec
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl WireCodec {
    /// Encode pairs into one text blob, preserving their order
    pub fn encode<'a, I>(pairs: I) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut out = String::new();
        for (name, value) in pairs {
            Self::encode_pair(&mut out, name, value);
        }
        out
    }

    /// Append a single frame to `out`
    pub fn encode_pair(out: &mut String, name: &str, value: &str) {
        let len = name.len() + value.len() + FRAME_OVERHEAD;
        out.reserve(Self::frame_len(name, value));
        out.push('[');
        // Writing to a String cannot fail
        let _ = write!(out, "{}", len);
        out.push_str(" (");
        out.push_str(name);
        out.push(' ');
        out.push_str(value);
        out.push_str(")\n]");
    }

    /// Total encoded size of one frame in bytes
    pub fn frame_len(name: &str, value: &str) -> usize {
        let len = name.len() + value.len() + FRAME_OVERHEAD;
        // '[' + digits + " (" + name + ' ' + value + ")\n]"
        1 + decimal_digits(len) + 2 + name.len() + 1 + value.len() + FRAME_TRAILER.len()
    }

    /// Decode a text blob into its pairs, in wire order
    pub fn decode(text: &str) -> Result<Vec<(String, String)>, WireError> {
        let bytes = text.as_bytes();
        let mut pairs = Vec::new();
        let mut offset = 0;

        while offset < bytes.len() {
            let (name, value, consumed) = Self::decode_frame(&bytes[offset..], offset)?;
            pairs.push((name, value));
            offset += consumed;
        }

        Ok(pairs)
    }

    /// Decode the frame at the start of `frame`; returns `(name, value, consumed)`
    fn decode_frame(frame: &[u8], offset: usize) -> Result<(String, String, usize), WireError> {
        let malformed = |reason| WireError::Malformed { offset, reason };

        if frame[0] != b'[' {
            return Err(malformed("expected '['"));
        }

        let space = frame
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| malformed("missing length delimiter"))?;

        let field = &frame[1..space];
        let len = parse_length(field).ok_or_else(|| WireError::Length {
            offset,
            field: String::from_utf8_lossy(field).into_owned(),
        })?;

        if len < FRAME_OVERHEAD {
            return Err(malformed("declared length too short"));
        }

        let end = space
            .checked_add(2 + len)
            .filter(|&end| end <= frame.len())
            .ok_or_else(|| malformed("declared length exceeds input"))?;

        if frame[space + 1] != b'(' {
            return Err(malformed("expected '('"));
        }

        let name_start = space + 2;
        let value_end = end - FRAME_TRAILER.len();
        if &frame[value_end..end] != FRAME_TRAILER {
            return Err(malformed("declared length does not match frame trailer"));
        }

        let separator = frame[name_start..value_end]
            .iter()
            .position(|&b| b == b' ')
            .map(|pos| name_start + pos)
            .ok_or_else(|| malformed("missing name/value separator"))?;

        let name = utf8(&frame[name_start..separator])?;
        let value = utf8(&frame[separator + 1..value_end])?;

        Ok((name, value, end))
    }
}

fn parse_length(field: &[u8]) -> Option<usize> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_exact_bytes() {
        let text = WireCodec::encode([("m_body", "hello")]);
        assert_eq!(text, "[15 (m_body hello)\n]");
        assert_eq!(WireCodec::frame_len("m_body", "hello"), text.len());
    }

    #[test]
    fn test_encode_concatenates_in_order() {
        let text = WireCodec::encode([("m_body", ""), ("Bar", "Baz")]);
        assert_eq!(text, "[10 (m_body )\n][10 (Bar Baz)\n]");
    }

    #[test]
    fn test_decode_pairs() {
        let pairs = WireCodec::decode("[10 (m_body )\n][10 (Bar Baz)\n]").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("m_body".to_string(), String::new()),
                ("Bar".to_string(), "Baz".to_string())
            ]
        );
    }

    #[test]
    fn test_decode_empty() {
        assert!(WireCodec::decode("").unwrap().is_empty());
    }

    #[test]
    fn test_value_with_spaces_and_tabs() {
        let text = WireCodec::encode([("note", "hello big\tworld")]);
        let pairs = WireCodec::decode(&text).unwrap();
        assert_eq!(pairs[0].1, "hello big\tworld");
    }

    #[test]
    fn test_multibyte_lengths_are_bytes() {
        let text = WireCodec::encode([("name", "päivää")]);
        assert!(text.starts_with("[17 "));
        assert_eq!(WireCodec::decode(&text).unwrap()[0].1, "päivää");
    }

    #[test]
    fn test_decode_bad_length_field() {
        let err = WireCodec::decode("[x1 (a b)\n]").unwrap_err();
        assert!(matches!(err, WireError::Length { offset: 0, .. }));

        let err = WireCodec::decode("[-6 (a b)\n]").unwrap_err();
        assert!(matches!(err, WireError::Length { .. }));
    }

    #[test]
    fn test_decode_length_mismatch() {
        // declared one byte too long
        let err = WireCodec::decode("[7 (a b)\n]").unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));

        // declared one byte too short
        let err = WireCodec::decode("[5 (a b)\n]").unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));
    }

    #[test]
    fn test_decode_truncated_input() {
        let err = WireCodec::decode("[6 (a b)").unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));
        let err = WireCodec::decode("[6").unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));
    }

    #[test]
    fn test_decode_error_reports_frame_offset() {
        let err = WireCodec::decode("[6 (a b)\n]garbage").unwrap_err();
        assert_eq!(
            err,
            WireError::Malformed {
                offset: 10,
                reason: "expected '['"
            }
        );
    }

    #[test]
    fn test_decode_missing_separator() {
        let err = WireCodec::decode("[6 (abc)\n]").unwrap_err();
        assert_eq!(
            err,
            WireError::Malformed {
                offset: 0,
                reason: "missing name/value separator"
            }
        );
    }
}
