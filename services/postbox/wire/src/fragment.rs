//! Message-kind flags carried next to every transport payload.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Group that keep-alive messages are multicast to
pub const KEEP_ALIVE_GROUP: &str = "keep_alive";

/// Payload of a keep-alive message
pub const KEEP_ALIVE_PAYLOAD: &[u8] = b"keep_alive";

bitflags! {
    /// Transport message-kind field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct KindFlags: u16 {
        /// Complete message in a single payload
        const NORMAL = 1 << 0;
        /// Continuation piece of a multi-part message
        const MULTI = 1 << 1;
        /// Opening piece of a multi-part message
        const MULTI_START = 1 << 2;
        /// Closing piece of a multi-part message (set together with MULTI)
        const MULTI_END = 1 << 3;
    }
}

/// How an arriving payload takes part in reassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentKind {
    /// Complete message
    Single,
    /// Opens a multi-part message; carries the type
    First,
    /// Continues a multi-part message
    Middle,
    /// Completes a multi-part message
    Last,
}

impl FragmentKind {
    /// Classify a kind field; `None` for keep-alives and unknown kinds
    pub fn classify(flags: KindFlags) -> Option<Self> {
        if flags.contains(KindFlags::NORMAL) {
            Some(FragmentKind::Single)
        } else if flags.contains(KindFlags::MULTI_START) {
            Some(FragmentKind::First)
        } else if flags.contains(KindFlags::MULTI) {
            if flags.contains(KindFlags::MULTI_END) {
                Some(FragmentKind::Last)
            } else {
                Some(FragmentKind::Middle)
            }
        } else {
            None
        }
    }

    /// Kind field a sender uses for this fragment
    pub fn flags(self) -> KindFlags {
        match self {
            FragmentKind::Single => KindFlags::NORMAL,
            FragmentKind::First => KindFlags::MULTI_START,
            FragmentKind::Middle => KindFlags::MULTI,
            FragmentKind::Last => KindFlags::MULTI | KindFlags::MULTI_END,
        }
    }

    /// Whether payloads of this kind start with `type "\t"`
    pub fn carries_type(self) -> bool {
        matches!(self, FragmentKind::Single | FragmentKind::First)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_wire_values() {
        assert_eq!(
            FragmentKind::classify(KindFlags::from_bits_truncate(1)),
            Some(FragmentKind::Single)
        );
        assert_eq!(
            FragmentKind::classify(KindFlags::from_bits_truncate(2)),
            Some(FragmentKind::Middle)
        );
        assert_eq!(
            FragmentKind::classify(KindFlags::from_bits_truncate(4)),
            Some(FragmentKind::First)
        );
        assert_eq!(
            FragmentKind::classify(KindFlags::from_bits_truncate(10)),
            Some(FragmentKind::Last)
        );
    }

    #[test]
    fn test_keep_alive_and_lone_end_are_not_fragments() {
        assert_eq!(FragmentKind::classify(KindFlags::empty()), None);
        assert_eq!(FragmentKind::classify(KindFlags::MULTI_END), None);
    }

    #[test]
    fn test_flags_classify_back() {
        for kind in [
            FragmentKind::Single,
            FragmentKind::First,
            FragmentKind::Middle,
            FragmentKind::Last,
        ] {
            assert_eq!(FragmentKind::classify(kind.flags()), Some(kind));
        }
    }
}
