//! Relay and transport error types.

use postbox_wire::WireError;
use thiserror::Error;

/// Errors reported by a transport connection
#[derive(Error, Debug)]
pub enum TransportError {
    /// Daemon could not be reached
    #[error("could not connect to {0}")]
    CouldNotConnect(String),

    /// Another client already uses the requested name
    #[error("client name {0:?} is not unique")]
    NotUnique(String),

    /// Client or group name rejected by the daemon
    #[error("illegal name {0:?}")]
    IllegalName(String),

    /// The session was closed by the daemon
    #[error("connection closed")]
    ConnectionClosed,

    /// Payload larger than the daemon accepts
    #[error("message too long: {len} > {max}")]
    MessageTooLong {
        /// Payload size
        len: usize,
        /// Accepted maximum
        max: usize,
    },

    /// Fewer bytes accepted than were offered
    #[error("only {sent} of {len} bytes sent")]
    ShortWrite {
        /// Bytes accepted
        sent: usize,
        /// Bytes offered
        len: usize,
    },

    /// `receive` called with nothing pending
    #[error("nothing to receive")]
    NothingToReceive,

    /// Socket level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the session is unusable after this error
    pub fn closes_session(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed | TransportError::Io(_))
    }
}

/// Errors surfaced to callers of the post office and the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Lazy connect failed
    #[error("connection to {connect_string} failed: {source}")]
    Connection {
        /// Connect string used
        connect_string: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// Transport refused or failed to transmit a message
    #[error("sending to {group} failed: {source}")]
    Send {
        /// Destination group
        group: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// Encoded message exceeds the single-message limit
    #[error("message size {len} exceeds maximum {max}")]
    SizeExceeded {
        /// Encoded size
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Message type unusable as a group name
    #[error("invalid message type: {0}")]
    InvalidType(#[source] WireError),

    /// Other transport operation failed
    #[error("{operation} failed: {source}")]
    Transport {
        /// Operation name
        operation: &'static str,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// Received message could not be decoded
    #[error("decode error: {0}")]
    Wire(#[from] WireError),

    /// The relay worker has stopped
    #[error("relay stopped")]
    Stopped,

    /// Relay worker task failed
    #[error("relay worker failed: {0}")]
    Worker(String),
}
