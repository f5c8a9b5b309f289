//! Per-sender reassembly of multi-part messages.
//!
//! The transport delivers pieces of one logical message in FIFO order per
//! sender, so an assembly is keyed by the sender's private address and grown
//! by plain concatenation. The text is kept as bytes until the final piece
//! arrives because a piece boundary may split a UTF-8 sequence.

use crate::fragment::FragmentKind;
use crate::message::{split_type, utf8};
use crate::{RawMessage, WireError};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// One payload as it arrived from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    /// Private address of the sending client
    pub sender: String,
    /// Role of the payload in reassembly
    pub kind: FragmentKind,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Arrival {
    /// Create a new arrival
    pub fn new(sender: impl Into<String>, kind: FragmentKind, payload: impl Into<Bytes>) -> Self {
        Self {
            sender: sender.into(),
            kind,
            payload: payload.into(),
        }
    }
}

/// Fragment sequence errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Continuation piece without an opening piece
    #[error("fragment from {sender} without a preceding start")]
    Orphan {
        /// Sender address
        sender: String,
    },

    /// Opening piece while another message from the same sender was open
    #[error("new start from {sender} discarded {discarded} buffered bytes")]
    Restarted {
        /// Sender address
        sender: String,
        /// Size of the abandoned partial text
        discarded: usize,
    },

    /// Payload could not be turned into a message
    #[error("undecodable fragment from {sender}: {source}")]
    Wire {
        /// Sender address
        sender: String,
        /// Underlying wire error
        #[source]
        source: WireError,
    },
}

#[derive(Debug)]
struct PartialAssembly {
    msg_type: String,
    text: BytesMut,
}

/// Collects pieces into complete messages, one open assembly per sender
#[derive(Debug, Default)]
pub struct Reassembler {
    partials: HashMap<String, PartialAssembly>,
}

impl Reassembler {
    /// Create a new reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one arrival; returns a message once one is complete
    pub fn push(&mut self, arrival: Arrival) -> Result<Option<RawMessage>, ReassemblyError> {
        let Arrival {
            sender,
            kind,
            payload,
        } = arrival;

        match kind {
            FragmentKind::Single => RawMessage::from_transport_bytes(&payload)
                .map(Some)
                .map_err(|source| ReassemblyError::Wire { sender, source }),

            FragmentKind::First => {
                let parts = split_type(&payload).and_then(|(t, text)| Ok((utf8(t)?, text)));
                let (msg_type, text) = match parts {
                    Ok(parts) => parts,
                    Err(source) => {
                        self.partials.remove(&sender);
                        return Err(ReassemblyError::Wire { sender, source });
                    }
                };

                let partial = PartialAssembly {
                    msg_type,
                    text: BytesMut::from(text),
                };

                debug!("Opened assembly of {} from {}", partial.msg_type, sender);
                match self.partials.insert(sender.clone(), partial) {
                    Some(stale) => Err(ReassemblyError::Restarted {
                        sender,
                        discarded: stale.text.len(),
                    }),
                    None => Ok(None),
                }
            }

            FragmentKind::Middle => match self.partials.get_mut(&sender) {
                Some(partial) => {
                    partial.text.extend_from_slice(&payload);
                    Ok(None)
                }
                None => Err(ReassemblyError::Orphan { sender }),
            },

            FragmentKind::Last => {
                let Some(mut partial) = self.partials.remove(&sender) else {
                    return Err(ReassemblyError::Orphan { sender });
                };
                partial.text.extend_from_slice(&payload);

                let text = utf8(&partial.text)
                    .map_err(|source| ReassemblyError::Wire {
                        sender: sender.clone(),
                        source,
                    })?;

                debug!(
                    "Completed assembly of {} from {} ({} bytes)",
                    partial.msg_type,
                    sender,
                    text.len()
                );
                Ok(Some(RawMessage::new(partial.msg_type, text)))
            }
        }
    }

    /// Number of senders with an open assembly
    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Drop the open assembly of one sender
    pub fn discard(&mut self, sender: &str) -> bool {
        self.partials.remove(sender).is_some()
    }

    /// Drop every open assembly
    pub fn clear(&mut self) {
        self.partials.clear();
    }
}
