//! Background message relay
//!
//! [`MessageRelay`] owns a single blocking worker that is the only thing
//! driving the [`PostOffice`] on the hot path. Callers talk to it through the
//! cloneable [`RelayHandle`]: subscription changes and outbound messages go in
//! through bounded queues, complete inbound messages come out through another.
//! Admin calls lock the same post office as the worker, so connection changes
//! never race a relay iteration.

use crate::error::RelayError;
use crate::post_office::{check_message, PostOffice};
use crate::stats::RelayStats;
use postbox_wire::{
    Arrival, AttributeMessage, FragmentKind, RawMessage, Reassembler, KEEP_ALIVE_GROUP,
    KEEP_ALIVE_PAYLOAD,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Queue sizes and pacing of the relay worker
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Pending subscription changes
    pub command_capacity: usize,
    /// Complete messages waiting for a receiver
    pub inbound_capacity: usize,
    /// Messages waiting to be sent
    pub outbound_capacity: usize,
    /// Sleep after an iteration that found no work
    pub idle_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
            inbound_capacity: 1024,
            outbound_capacity: 1024,
            idle_interval: Duration::from_millis(100),
        }
    }
}

/// Subscription change queued for the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCommand {
    /// Join a topic
    Subscribe(String),
    /// Leave a topic
    Unsubscribe(String),
}

/// Running relay; dropping it stops the worker
#[derive(Debug)]
pub struct MessageRelay {
    handle: RelayHandle,
    worker: Option<JoinHandle<()>>,
}

impl MessageRelay {
    /// Start the worker on the blocking pool of the current runtime
    ///
    /// Queue capacities below one are raised to one.
    pub fn start(post_office: PostOffice, config: RelayConfig) -> Self {
        let max_message_len = post_office.config().max_message_len;
        let post_office = Arc::new(Mutex::new(post_office));
        let stats = Arc::new(RelayStats::default());

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (kill_tx, kill_rx) = mpsc::channel(1);

        let worker = RelayWorker {
            post_office: Arc::clone(&post_office),
            commands: command_rx,
            outbound: outbound_rx,
            inbound: inbound_tx,
            kill: kill_rx,
            reassembler: Reassembler::new(),
            stats: Arc::clone(&stats),
            idle_interval: config.idle_interval,
            stopping: false,
        };

        let worker = tokio::task::spawn_blocking(move || worker.run());

        Self {
            handle: RelayHandle {
                post_office,
                commands: command_tx,
                outbound: outbound_tx,
                inbound: Arc::new(Mutex::new(inbound_rx)),
                kill: kill_tx,
                stats,
                max_message_len,
            },
            worker: Some(worker),
        }
    }

    /// Cloneable caller API
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Ask the worker to stop; idempotent
    pub fn kill(&self) {
        self.handle.kill();
    }

    /// Wait for the worker to finish; returns at once if already joined
    pub async fn join(&mut self) -> Result<(), RelayError> {
        match self.worker.take() {
            Some(worker) => worker
                .await
                .map_err(|e| RelayError::Worker(e.to_string())),
            None => Ok(()),
        }
    }

    /// Kill and join
    pub async fn shutdown(mut self) -> Result<(), RelayError> {
        self.kill();
        self.join().await
    }
}

impl Drop for MessageRelay {
    fn drop(&mut self) {
        self.handle.kill();
    }
}

/// Thread-safe caller side of a [`MessageRelay`]
#[derive(Debug, Clone)]
pub struct RelayHandle {
    post_office: Arc<Mutex<PostOffice>>,
    commands: mpsc::Sender<SubscriptionCommand>,
    outbound: mpsc::Sender<RawMessage>,
    inbound: Arc<Mutex<mpsc::Receiver<RawMessage>>>,
    kill: mpsc::Sender<()>,
    stats: Arc<RelayStats>,
    max_message_len: usize,
}

impl RelayHandle {
    /// Queue a subscription to `topic`
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), RelayError> {
        self.command(SubscriptionCommand::Subscribe(topic.into())).await
    }

    /// Queue leaving `topic`
    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), RelayError> {
        self.command(SubscriptionCommand::Unsubscribe(topic.into())).await
    }

    async fn command(&self, command: SubscriptionCommand) -> Result<(), RelayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::Stopped)
    }

    /// Queue a message for sending
    ///
    /// Messages with an unusable type or larger than the transport accepts
    /// are rejected here and never queued. Transport failures after queueing
    /// are only logged and counted in [`RelayStats::send_failures`].
    pub async fn send(&self, message: RawMessage) -> Result<(), RelayError> {
        check_message(&message, self.max_message_len)?;
        self.outbound
            .send(message)
            .await
            .map_err(|_| RelayError::Stopped)
    }

    /// Encode and queue an attribute message
    pub async fn send_attributes(&self, message: &AttributeMessage) -> Result<(), RelayError> {
        self.send(message.to_raw()).await
    }

    /// Next complete message, or `None` after `timeout` or once the relay stopped
    pub async fn receive(&self, timeout: Duration) -> Option<RawMessage> {
        let next = async { self.inbound.lock().await.recv().await };
        tokio::time::timeout(timeout, next).await.ok().flatten()
    }

    /// Next complete message decoded as an attribute message
    pub async fn receive_attributes(
        &self,
        timeout: Duration,
    ) -> Result<Option<AttributeMessage>, RelayError> {
        match self.receive(timeout).await {
            Some(raw) => Ok(Some(AttributeMessage::from_raw(&raw)?)),
            None => Ok(None),
        }
    }

    /// Ask the worker to stop; idempotent
    pub fn kill(&self) {
        match self.kill.try_send(()) {
            Ok(()) => debug!("Relay kill requested"),
            Err(TrySendError::Full(())) | Err(TrySendError::Closed(())) => {}
        }
    }

    /// Change the daemon address; reconnects on next use
    pub async fn set_connect_info(
        &self,
        connect_string: impl Into<String>,
    ) -> Result<(), RelayError> {
        let connect_string = connect_string.into();
        self.with_post_office(move |po| {
            po.set_connect_info(&connect_string);
            Ok(())
        })
        .await
    }

    /// Change the client name; reconnects on next use
    pub async fn set_client_identifier(
        &self,
        client_identifier: impl Into<String>,
    ) -> Result<(), RelayError> {
        let client_identifier = client_identifier.into();
        self.with_post_office(move |po| {
            po.set_client_identifier(&client_identifier);
            Ok(())
        })
        .await
    }

    /// Private group of this client, connecting if needed
    pub async fn client_address(&self) -> Result<String, RelayError> {
        self.with_post_office(|po| po.client_address()).await
    }

    /// Version of the relay and its transport
    pub async fn version(&self) -> Result<String, RelayError> {
        self.with_post_office(|po| Ok(format!("relayed<{}>", po.version())))
            .await
    }

    /// Relay counters
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    async fn with_post_office<R, F>(&self, f: F) -> Result<R, RelayError>
    where
        R: Send + 'static,
        F: FnOnce(&mut PostOffice) -> Result<R, RelayError> + Send + 'static,
    {
        let post_office = Arc::clone(&self.post_office);
        tokio::task::spawn_blocking(move || {
            let mut post_office = post_office.blocking_lock();
            f(&mut *post_office)
        })
        .await
        .map_err(|e| RelayError::Worker(e.to_string()))?
    }
}

struct RelayWorker {
    post_office: Arc<Mutex<PostOffice>>,
    commands: mpsc::Receiver<SubscriptionCommand>,
    outbound: mpsc::Receiver<RawMessage>,
    inbound: mpsc::Sender<RawMessage>,
    kill: mpsc::Receiver<()>,
    reassembler: Reassembler,
    stats: Arc<RelayStats>,
    idle_interval: Duration,
    stopping: bool,
}

impl RelayWorker {
    fn run(mut self) {
        info!("Message relay started");

        while !self.should_stop() {
            let mut busy = self.apply_command();
            busy |= self.relay_inbound();
            busy |= self.relay_outbound();

            self.stats.record_iteration(!busy);
            if !busy {
                std::thread::sleep(self.idle_interval);
            }
        }

        self.reassembler.clear();
        self.post_office.blocking_lock().disconnect();
        info!(
            "Message relay stopped after {} iterations",
            self.stats.iterations()
        );
    }

    fn should_stop(&mut self) -> bool {
        if !self.stopping {
            self.stopping = match self.kill.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => true,
                Err(TryRecvError::Empty) => false,
            };
        }
        self.stopping
    }

    fn apply_command(&mut self) -> bool {
        let Ok(command) = self.commands.try_recv() else {
            return false;
        };

        let mut post_office = self.post_office.blocking_lock();
        let result = match &command {
            SubscriptionCommand::Subscribe(topic) => post_office.subscribe(topic),
            SubscriptionCommand::Unsubscribe(topic) => post_office.unsubscribe(topic),
        };
        drop(post_office);

        match result {
            Ok(()) => debug!("Applied {:?}", command),
            Err(e) => report(&e),
        }
        true
    }

    fn relay_inbound(&mut self) -> bool {
        let polled = self.post_office.blocking_lock().poll_delivery();
        let delivery = match polled {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return false,
            Err(e) => {
                report(&e);
                return false;
            }
        };

        let Some(kind) = FragmentKind::classify(delivery.flags) else {
            if delivery.flags.is_empty() {
                if delivery.payload.starts_with(KEEP_ALIVE_PAYLOAD) {
                    trace!("Keep-alive from {}", delivery.sender);
                    self.deliver(RawMessage::new(KEEP_ALIVE_GROUP, delivery.sender));
                } else {
                    trace!("Dropping empty-kind message from {}", delivery.sender);
                }
            } else {
                warn!(
                    "Dropping message of unknown kind {:?} from {}",
                    delivery.flags, delivery.sender
                );
                self.stats.record_protocol_error();
            }
            return true;
        };

        match self
            .reassembler
            .push(Arrival::new(delivery.sender, kind, delivery.payload))
        {
            Ok(Some(message)) => self.deliver(message),
            Ok(None) => {}
            Err(e) => {
                warn!("Dropping fragment: {}", e);
                self.stats.record_protocol_error();
            }
        }
        true
    }

    /// Queue a complete message, waiting while the queue is full
    fn deliver(&mut self, mut message: RawMessage) {
        let bytes = message.encoded_len();
        let backoff = self.idle_interval.min(Duration::from_millis(10));

        loop {
            match self.inbound.try_send(message) {
                Ok(()) => {
                    self.stats.received.add(bytes);
                    return;
                }
                Err(TrySendError::Full(rejected)) => {
                    if self.should_stop() {
                        return;
                    }
                    message = rejected;
                    std::thread::sleep(backoff);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Inbound queue closed, stopping relay");
                    self.stopping = true;
                    return;
                }
            }
        }
    }

    fn relay_outbound(&mut self) -> bool {
        let Ok(message) = self.outbound.try_recv() else {
            return false;
        };

        let result = self.post_office.blocking_lock().send(&message);
        match result {
            Ok(()) => self.stats.sent.add(message.encoded_len()),
            Err(e) => {
                self.stats.record_send_failure();
                report(&e);
            }
        }
        true
    }
}

fn report(error: &RelayError) {
    match error {
        // The post office already logs connection state transitions
        RelayError::Connection { .. } => debug!("Relay iteration skipped: {}", error),
        RelayError::Worker(_) => error!("{}", error),
        _ => warn!("Relay operation failed: {}", error),
    }
}
