//! Non-blocking messaging over a blocking group-communication transport.
//!
//! The [`PostOffice`] owns the transport connection and hides its lifecycle:
//! it connects on first use, re-joins remembered topics after a reconnect and
//! keeps the session alive. A [`MessageRelay`] drives a post office from one
//! background worker so that any number of tasks can publish and consume
//! through a [`RelayHandle`] without ever blocking on the transport.
//!
//! ```no_run
//! use postbox_relay::{LoopbackHub, MessageRelay, PostOffice, PostOfficeConfig, RelayConfig};
//! use postbox_wire::RawMessage;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), postbox_relay::RelayError> {
//! let hub = LoopbackHub::new("demo");
//! let post_office = PostOffice::new(hub.transport(), PostOfficeConfig::default());
//! let relay = MessageRelay::start(post_office, RelayConfig::default());
//!
//! let handle = relay.handle();
//! handle.subscribe("News").await?;
//! handle.send(RawMessage::new("News", "hello")).await?;
//! let received = handle.receive(Duration::from_secs(1)).await;
//! relay.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod loopback;
pub mod post_office;
pub mod relay;
pub mod stats;
pub mod transport;

// Re-export main types
pub use error::{RelayError, TransportError};
pub use loopback::{LoopbackConnection, LoopbackHub, LoopbackTransport};
pub use post_office::{unique_client_id, PostOffice, PostOfficeConfig, MAX_NAME_ATTEMPTS};
pub use relay::{MessageRelay, RelayConfig, RelayHandle, SubscriptionCommand};
pub use stats::{RelayStats, Throughput, ThroughputStatistics, DEFAULT_WINDOW};
pub use transport::{
    Connection, Delivery, ServiceLevel, Transport, MAX_GROUP_NAME, MAX_MESSAGE_LEN,
    MAX_PRIVATE_NAME,
};
