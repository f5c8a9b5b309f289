//! Raw messages, attribute framing and fragment reassembly for postbox.
//!
//! This crate holds everything that touches the bytes exchanged with the
//! group-communication transport: the flat `(type, text)` message, the
//! bracketed attribute encoding packed into its text, and the per-sender
//! reassembly of messages that the transport delivered in several pieces.
//!
//! ## Wire Format
//!
//! ```text
//! transport payload   := msg_type "\t" text
//! text (attributes)   := frame*
//! frame               := "[" len " (" name " " value ")\n]"
//! len                 := decimal(len(name) + len(value) + 4)
//! ```
//!
//! The body of an [`AttributeMessage`] travels as the attribute named
//! [`BODY_ATTRIBUTE`] and is always encoded first.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
pub mod codec;
pub mod error;
pub mod fragment;
pub mod message;
pub mod reassembler;

// Re-export main types
pub use attribute::AttributeMessage;
pub use codec::{WireCodec, BODY_ATTRIBUTE, FRAME_OVERHEAD};
pub use error::WireError;
pub use fragment::{FragmentKind, KindFlags, KEEP_ALIVE_GROUP, KEEP_ALIVE_PAYLOAD};
pub use message::{RawMessage, TYPE_SEPARATOR};
pub use reassembler::{Arrival, ReassemblyError, Reassembler};
