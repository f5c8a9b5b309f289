//! Boundary to the blocking group-communication transport.
//!
//! A [`Transport`] produces [`Connection`]s; every call on either may block.
//! Nothing here is required to be thread-safe beyond `Send`: the post office
//! that owns a connection only ever touches it from one thread at a time.

use crate::error::TransportError;
use bytes::Bytes;
use postbox_wire::KindFlags;

/// Longest client name the daemon accepts
pub const MAX_PRIVATE_NAME: usize = 10;

/// Longest group name the daemon accepts
pub const MAX_GROUP_NAME: usize = 32;

/// Largest payload the daemon accepts in a single message
pub const MAX_MESSAGE_LEN: usize = 100 * 1024;

/// Delivery guarantee requested for a multicast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLevel {
    /// Best effort
    Unreliable,
    /// Reliable, unordered
    Reliable,
    /// Reliable, FIFO per sender
    Fifo,
}

/// One message as received from the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Private group of the sender
    pub sender: String,
    /// Group the message was multicast to
    pub group: String,
    /// Message-kind field
    pub flags: KindFlags,
    /// Payload bytes
    pub payload: Bytes,
}

/// Factory for connections to a daemon
pub trait Transport: Send {
    /// Human readable backend name
    fn name(&self) -> &str;

    /// Connect as `client_id`; blocks until accepted or rejected
    fn connect(
        &mut self,
        connect_string: &str,
        client_id: &str,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// Established session with a daemon
pub trait Connection: Send {
    /// Private group assigned to this client
    fn private_group(&self) -> &str;

    /// Join a group
    fn join(&mut self, group: &str) -> Result<(), TransportError>;

    /// Leave a group
    fn leave(&mut self, group: &str) -> Result<(), TransportError>;

    /// Multicast a payload to a group; returns the number of bytes sent
    fn multicast(
        &mut self,
        group: &str,
        service: ServiceLevel,
        flags: KindFlags,
        payload: &[u8],
    ) -> Result<usize, TransportError>;

    /// Whether a message is ready; never blocks
    fn poll(&mut self) -> Result<bool, TransportError>;

    /// Take the next message
    fn receive(&mut self) -> Result<Delivery, TransportError>;

    /// Close the session
    fn disconnect(&mut self);
}
