//! Synchronous owner of the transport connection.
//!
//! The [`PostOffice`] connects lazily on first use, remembers subscriptions so
//! they survive a reconnect, picks a unique client name when the daemon
//! reports a clash, and keeps the session alive with periodic keep-alive
//! multicasts. Every method may block on the transport; the relay worker is
//! the only caller on the hot path.

use crate::error::{RelayError, TransportError};
use crate::transport::{
    Connection, Delivery, ServiceLevel, Transport, MAX_GROUP_NAME, MAX_MESSAGE_LEN,
    MAX_PRIVATE_NAME,
};
use once_cell::sync::Lazy;
use postbox_wire::{KindFlags, RawMessage, WireError, KEEP_ALIVE_GROUP, KEEP_ALIVE_PAYLOAD};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Name suffixes tried before giving up on a unique client name
pub const MAX_NAME_ATTEMPTS: u32 = 1000;

static VERSION: Lazy<String> =
    Lazy::new(|| format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")));

/// Connection settings for a [`PostOffice`]
#[derive(Debug, Clone)]
pub struct PostOfficeConfig {
    /// Daemon address, e.g. `4803@localhost`
    pub connect_string: String,
    /// Preferred client name; suffixed with `-N` when taken
    pub client_identifier: String,
    /// Largest accepted `type + "\t" + text` in bytes
    pub max_message_len: usize,
    /// Interval between keep-alive multicasts; `None` disables them
    pub keep_alive_interval: Option<Duration>,
}

impl Default for PostOfficeConfig {
    fn default() -> Self {
        Self {
            connect_string: "4803@localhost".to_string(),
            client_identifier: "unknown".to_string(),
            max_message_len: MAX_MESSAGE_LEN,
            keep_alive_interval: Some(Duration::from_secs(2)),
        }
    }
}

/// Lazily connected, self-healing transport client
pub struct PostOffice {
    transport: Box<dyn Transport>,
    config: PostOfficeConfig,
    connection: Option<Box<dyn Connection>>,
    subscriptions: BTreeSet<String>,
    last_keep_alive: Instant,
    connection_failure: bool,
}

impl std::fmt::Debug for PostOffice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostOffice")
            .field("transport", &self.transport.name())
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl PostOffice {
    /// Create a post office; nothing is connected until first use
    pub fn new<T: Transport + 'static>(transport: T, config: PostOfficeConfig) -> Self {
        Self {
            transport: Box::new(transport),
            config,
            connection: None,
            subscriptions: BTreeSet::new(),
            last_keep_alive: Instant::now(),
            connection_failure: false,
        }
    }

    /// Current settings
    pub fn config(&self) -> &PostOfficeConfig {
        &self.config
    }

    /// Whether a session is currently open
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Topics re-joined on every reconnect
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    /// Join `topic`; remembered even if the join itself fails
    pub fn subscribe(&mut self, topic: &str) -> Result<(), RelayError> {
        self.subscriptions.insert(topic.to_string());
        let result = self.ensure_connected()?.join(topic);
        result.map_err(|source| RelayError::Transport {
            operation: "join",
            source: self.transport_failed(source),
        })
    }

    /// Leave `topic`
    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), RelayError> {
        self.subscriptions.remove(topic);
        let result = self.ensure_connected()?.leave(topic);
        result.map_err(|source| RelayError::Transport {
            operation: "leave",
            source: self.transport_failed(source),
        })
    }

    /// Reject messages the transport could not carry, without connecting
    pub fn check_outbound(&self, message: &RawMessage) -> Result<(), RelayError> {
        check_message(message, self.config.max_message_len)
    }

    /// Multicast `message` to the group named by its type
    pub fn send(&mut self, message: &RawMessage) -> Result<(), RelayError> {
        self.check_outbound(message)?;

        let payload = message.to_transport_bytes();
        let result = self.ensure_connected()?.multicast(
            &message.msg_type,
            ServiceLevel::Fifo,
            KindFlags::NORMAL,
            &payload,
        );

        let source = match result {
            Ok(sent) if sent == payload.len() => return Ok(()),
            Ok(sent) => TransportError::ShortWrite {
                sent,
                len: payload.len(),
            },
            Err(source) => self.transport_failed(source),
        };
        Err(RelayError::Send {
            group: message.msg_type.clone(),
            source,
        })
    }

    /// Take one pending delivery, if any; never waits for one
    pub fn poll_delivery(&mut self) -> Result<Option<Delivery>, RelayError> {
        let connection = self.ensure_connected()?;
        let polled = match connection.poll() {
            Ok(true) => connection.receive().map(Some),
            Ok(false) => Ok(None),
            Err(source) => Err(source),
        };

        let delivery = polled.map_err(|source| RelayError::Transport {
            operation: "receive",
            source: self.transport_failed(source),
        })?;

        self.keep_alive();
        Ok(delivery)
    }

    /// Change the daemon address; an open session is dropped
    pub fn set_connect_info(&mut self, connect_string: &str) {
        if connect_string != self.config.connect_string {
            self.config.connect_string = connect_string.to_string();
            self.disconnect();
        }
    }

    /// Change the client name; an open session is dropped so the private
    /// group is re-established under the new name
    pub fn set_client_identifier(&mut self, client_identifier: &str) {
        if client_identifier != self.config.client_identifier {
            self.config.client_identifier = client_identifier.to_string();
            self.disconnect();
        }
    }

    /// Private group of this client, connecting if needed
    pub fn client_address(&mut self) -> Result<String, RelayError> {
        Ok(self.ensure_connected()?.private_group().to_string())
    }

    /// Version of this crate and the transport backend
    pub fn version(&self) -> String {
        format!("{} ({})", VERSION.as_str(), self.transport.name())
    }

    /// Close the session; the next operation reconnects
    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            debug!("Disconnecting {}", connection.private_group());
            connection.disconnect();
        }
    }

    fn ensure_connected(&mut self) -> Result<&mut dyn Connection, RelayError> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.open_connection()?,
        };
        Ok(&mut **self.connection.insert(connection))
    }

    fn open_connection(&mut self) -> Result<Box<dyn Connection>, RelayError> {
        let base = self.config.client_identifier.clone();

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let client_id = unique_client_id(&base, attempt);
            match self.transport.connect(&self.config.connect_string, &client_id) {
                Ok(mut connection) => {
                    for topic in &self.subscriptions {
                        if let Err(e) = connection.join(topic) {
                            warn!("Failed to re-join {} after connect: {}", topic, e);
                        }
                    }

                    if self.connection_failure {
                        info!(
                            "Connection to {} restored as {}",
                            self.config.connect_string,
                            connection.private_group()
                        );
                        self.connection_failure = false;
                    } else {
                        info!(
                            "Connected to {} as {}",
                            self.config.connect_string,
                            connection.private_group()
                        );
                    }

                    self.last_keep_alive = Instant::now();
                    return Ok(connection);
                }
                Err(TransportError::NotUnique(name)) => {
                    debug!("Client name {} taken, trying next suffix", name);
                }
                Err(source) => return Err(self.connection_failed(source)),
            }
        }

        Err(self.connection_failed(TransportError::NotUnique(base)))
    }

    fn connection_failed(&mut self, source: TransportError) -> RelayError {
        if self.connection_failure {
            debug!("Still unable to connect to {}: {}", self.config.connect_string, source);
        } else {
            warn!("Unable to connect to {}: {}", self.config.connect_string, source);
            self.connection_failure = true;
        }
        RelayError::Connection {
            connect_string: self.config.connect_string.clone(),
            source,
        }
    }

    /// Drop the session if `source` made it unusable
    fn transport_failed(&mut self, source: TransportError) -> TransportError {
        if source.closes_session() {
            warn!("Session with {} lost: {}", self.config.connect_string, source);
            self.disconnect();
            self.connection_failure = true;
        }
        source
    }

    fn keep_alive(&mut self) {
        let Some(interval) = self.config.keep_alive_interval else {
            return;
        };
        if self.last_keep_alive.elapsed() < interval {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let result = connection.multicast(
            KEEP_ALIVE_GROUP,
            ServiceLevel::Fifo,
            KindFlags::empty(),
            KEEP_ALIVE_PAYLOAD,
        );
        match result {
            Ok(_) => self.last_keep_alive = Instant::now(),
            Err(source) => {
                let source = self.transport_failed(source);
                warn!("Keep-alive failed: {}", source);
            }
        }
    }
}

impl Drop for PostOffice {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reject a message with an unusable type or one larger than `max_message_len`
///
/// The type doubles as the destination group, so it must also fit the
/// daemon's group name limit.
pub(crate) fn check_message(
    message: &RawMessage,
    max_message_len: usize,
) -> Result<(), RelayError> {
    RawMessage::validate_type(&message.msg_type).map_err(RelayError::InvalidType)?;
    if message.msg_type.len() > MAX_GROUP_NAME {
        return Err(RelayError::InvalidType(WireError::InvalidType(
            message.msg_type.clone(),
        )));
    }

    let len = message.encoded_len();
    if len > max_message_len {
        return Err(RelayError::SizeExceeded {
            len,
            max: max_message_len,
        });
    }
    Ok(())
}

/// Client name for the given attempt, truncated to fit the daemon's limit
pub fn unique_client_id(base: &str, attempt: u32) -> String {
    let suffix = if attempt == 0 {
        String::new()
    } else {
        format!("-{}", attempt)
    };

    let mut end = base.len().min(MAX_PRIVATE_NAME.saturating_sub(suffix.len()));
    while !base.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &base[..end], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHub;

    fn post_office(hub: &LoopbackHub, client_identifier: &str) -> PostOffice {
        PostOffice::new(
            hub.transport(),
            PostOfficeConfig {
                client_identifier: client_identifier.to_string(),
                keep_alive_interval: None,
                ..PostOfficeConfig::default()
            },
        )
    }

    #[test]
    fn test_unique_client_id() {
        assert_eq!(unique_client_id("producer", 0), "producer");
        assert_eq!(unique_client_id("producer", 12), "produce-12");
        assert_eq!(unique_client_id("consumer-long", 0), "consumer-l");
        assert_eq!(unique_client_id("äääääää", 10), "äää-10");
    }

    #[test]
    fn test_connects_lazily() {
        let hub = LoopbackHub::new("hub");
        let mut po = post_office(&hub, "tester");
        assert!(hub.clients().is_empty());
        assert!(!po.is_connected());

        po.subscribe("T").unwrap();
        assert_eq!(hub.clients(), vec!["#tester#hub".to_string()]);
        assert_eq!(hub.members("T"), vec!["#tester#hub".to_string()]);
    }

    #[test]
    fn test_send_and_receive_own_message() {
        let hub = LoopbackHub::new("hub");
        let mut po = post_office(&hub, "tester");
        po.subscribe("T").unwrap();
        po.send(&RawMessage::new("T", "x")).unwrap();

        let delivery = po.poll_delivery().unwrap().unwrap();
        assert_eq!(delivery.sender, "#tester#hub");
        assert_eq!(delivery.flags, KindFlags::NORMAL);
        assert_eq!(&delivery.payload[..], b"T\tx");
        assert!(po.poll_delivery().unwrap().is_none());
    }

    #[test]
    fn test_oversized_message_never_reaches_transport() {
        let hub = LoopbackHub::new("hub");
        let mut po = PostOffice::new(
            hub.transport(),
            PostOfficeConfig {
                max_message_len: 16,
                ..PostOfficeConfig::default()
            },
        );

        let err = po.send(&RawMessage::new("T", "x".repeat(15))).unwrap_err();
        assert!(matches!(err, RelayError::SizeExceeded { len: 17, max: 16 }));
        assert_eq!(hub.multicast_count(), 0);
        assert!(hub.clients().is_empty());

        po.send(&RawMessage::new("T", "x".repeat(14))).unwrap();
        assert_eq!(hub.multicast_count(), 1);
    }

    #[test]
    fn test_invalid_type_is_rejected() {
        let hub = LoopbackHub::new("hub");
        let mut po = post_office(&hub, "tester");
        assert!(matches!(
            po.send(&RawMessage::new("A\tB", "x")),
            Err(RelayError::InvalidType(_))
        ));
        assert!(matches!(
            po.send(&RawMessage::new("", "x")),
            Err(RelayError::InvalidType(_))
        ));

        let too_long = "g".repeat(MAX_GROUP_NAME + 1);
        assert!(matches!(
            po.send(&RawMessage::new(too_long, "x")),
            Err(RelayError::InvalidType(_))
        ));
        po.send(&RawMessage::new("g".repeat(MAX_GROUP_NAME), "x")).unwrap();
        assert_eq!(hub.multicast_count(), 1);
    }

    #[test]
    fn test_taken_name_gets_suffix() {
        let hub = LoopbackHub::new("hub");
        let mut first = post_office(&hub, "dup");
        let mut second = post_office(&hub, "dup");
        assert_eq!(first.client_address().unwrap(), "#dup#hub");
        assert_eq!(second.client_address().unwrap(), "#dup-1#hub");
    }

    #[test]
    fn test_reconnects_and_rejoins_after_session_loss() {
        let hub = LoopbackHub::new("hub");
        let mut po = post_office(&hub, "tester");
        po.subscribe("A").unwrap();
        po.subscribe("B").unwrap();

        hub.disconnect_all();
        let err = po.poll_delivery().unwrap_err();
        assert!(matches!(
            err,
            RelayError::Transport {
                source: TransportError::ConnectionClosed,
                ..
            }
        ));
        assert!(!po.is_connected());

        assert!(po.poll_delivery().unwrap().is_none());
        assert_eq!(hub.members("A"), vec!["#tester#hub".to_string()]);
        assert_eq!(hub.members("B"), vec!["#tester#hub".to_string()]);
    }

    #[test]
    fn test_unsubscribe_is_forgotten_on_reconnect() {
        let hub = LoopbackHub::new("hub");
        let mut po = post_office(&hub, "tester");
        po.subscribe("A").unwrap();
        po.unsubscribe("A").unwrap();
        assert!(hub.members("A").is_empty());

        hub.disconnect_all();
        let _ = po.poll_delivery();
        po.client_address().unwrap();
        assert!(hub.members("A").is_empty());
        assert_eq!(po.subscriptions().count(), 0);
    }

    #[test]
    fn test_identifier_change_reconnects() {
        let hub = LoopbackHub::new("hub");
        let mut po = post_office(&hub, "old");
        po.subscribe("T").unwrap();

        po.set_client_identifier("new");
        assert!(!po.is_connected());
        assert_eq!(po.client_address().unwrap(), "#new#hub");
        assert_eq!(hub.members("T"), vec!["#new#hub".to_string()]);

        po.set_client_identifier("new");
        assert!(po.is_connected());
    }

    #[test]
    fn test_connection_error_is_propagated() {
        let hub = LoopbackHub::new("hub");
        hub.refuse_connections(true);
        let mut po = post_office(&hub, "tester");
        po.set_connect_info("4803@nowhere");

        let err = po.client_address().unwrap_err();
        assert!(matches!(
            err,
            RelayError::Connection {
                ref connect_string,
                source: TransportError::CouldNotConnect(_),
            } if connect_string == "4803@nowhere"
        ));

        hub.refuse_connections(false);
        assert_eq!(po.client_address().unwrap(), "#tester#hub");
    }

    #[test]
    fn test_keep_alive_is_multicast() {
        let hub = LoopbackHub::new("hub");
        let mut po = PostOffice::new(
            hub.transport(),
            PostOfficeConfig {
                client_identifier: "tester".to_string(),
                keep_alive_interval: Some(Duration::ZERO),
                ..PostOfficeConfig::default()
            },
        );
        po.subscribe(KEEP_ALIVE_GROUP).unwrap();

        assert!(po.poll_delivery().unwrap().is_none());
        let delivery = po.poll_delivery().unwrap().unwrap();
        assert_eq!(delivery.flags, KindFlags::empty());
        assert_eq!(&delivery.payload[..], KEEP_ALIVE_PAYLOAD);
    }

    #[test]
    fn test_version_names_transport() {
        let hub = LoopbackHub::new("hub");
        let po = post_office(&hub, "tester");
        assert!(po.version().starts_with("postbox-relay "));
        assert!(po.version().ends_with("(loopback)"));
    }
}
