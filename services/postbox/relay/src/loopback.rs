//! In-memory transport daemon.
//!
//! [`LoopbackHub`] behaves like a single group-communication daemon living in
//! the current process: clients connect under unique names, join groups, and
//! every multicast is appended FIFO to the inbox of each member, the sender
//! included. It backs the demo binary and the relay tests.

use crate::error::TransportError;
use crate::transport::{
    Connection, Delivery, ServiceLevel, Transport, MAX_GROUP_NAME, MAX_MESSAGE_LEN,
    MAX_PRIVATE_NAME,
};
use bytes::Bytes;
use postbox_wire::KindFlags;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct ClientState {
    groups: BTreeSet<String>,
    inbox: VecDeque<Delivery>,
}

#[derive(Debug, Default)]
struct HubState {
    clients: HashMap<String, ClientState>,
    refuse_connections: bool,
    multicasts: u64,
}

/// Shared in-memory daemon
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    name: Arc<str>,
    max_message_len: usize,
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Create a hub; `name` appears in private group names
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            max_message_len: MAX_MESSAGE_LEN,
            state: Arc::new(Mutex::new(HubState::default())),
        }
    }

    /// Override the largest accepted payload
    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    /// Hub name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport handing out connections to this hub
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport { hub: self.clone() }
    }

    /// Make subsequent connection attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Private groups of all connected clients
    pub fn clients(&self) -> Vec<String> {
        let mut clients: Vec<_> = self.lock().clients.keys().cloned().collect();
        clients.sort();
        clients
    }

    /// Private groups of the members of `group`
    pub fn members(&self, group: &str) -> Vec<String> {
        let mut members: Vec<_> = self
            .lock()
            .clients
            .iter()
            .filter(|(_, client)| client.groups.contains(group))
            .map(|(name, _)| name.clone())
            .collect();
        members.sort();
        members
    }

    /// Number of multicasts accepted so far
    pub fn multicast_count(&self) -> u64 {
        self.lock().multicasts
    }

    /// Deliver a payload to the members of `group` as if `sender` sent it
    pub fn inject(&self, sender: &str, group: &str, flags: KindFlags, payload: impl Into<Bytes>) {
        let delivery = Delivery {
            sender: sender.to_string(),
            group: group.to_string(),
            flags,
            payload: payload.into(),
        };
        self.lock().fan_out(delivery);
    }

    /// Drop every session, as a restarting daemon would
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        debug!("Loopback hub {} dropping {} clients", self.name, state.clients.len());
        state.clients.clear();
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // Hub state stays usable after a panicking holder
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HubState {
    fn fan_out(&mut self, delivery: Delivery) {
        for client in self.clients.values_mut() {
            if client.groups.contains(&delivery.group) {
                client.inbox.push_back(delivery.clone());
            }
        }
        self.multicasts += 1;
    }
}

/// [`Transport`] over a [`LoopbackHub`]
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    fn connect(
        &mut self,
        connect_string: &str,
        client_id: &str,
    ) -> Result<Box<dyn Connection>, TransportError> {
        if client_id.is_empty() || client_id.len() > MAX_PRIVATE_NAME || client_id.contains('#') {
            return Err(TransportError::IllegalName(client_id.to_string()));
        }

        let private_group = format!("#{}#{}", client_id, self.hub.name);
        let mut state = self.hub.lock();

        if state.refuse_connections {
            return Err(TransportError::CouldNotConnect(connect_string.to_string()));
        }
        if state.clients.contains_key(&private_group) {
            return Err(TransportError::NotUnique(client_id.to_string()));
        }

        state
            .clients
            .insert(private_group.clone(), ClientState::default());
        debug!("Loopback client {} connected", private_group);

        Ok(Box::new(LoopbackConnection {
            hub: self.hub.clone(),
            private_group,
            open: true,
        }))
    }
}

/// One client session on a [`LoopbackHub`]
#[derive(Debug)]
pub struct LoopbackConnection {
    hub: LoopbackHub,
    private_group: String,
    open: bool,
}

impl LoopbackConnection {
    fn with_client<R>(
        &mut self,
        f: impl FnOnce(&mut ClientState) -> R,
    ) -> Result<R, TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        let mut state = self.hub.lock();
        match state.clients.get_mut(&self.private_group) {
            Some(client) => Ok(f(client)),
            None => {
                self.open = false;
                Err(TransportError::ConnectionClosed)
            }
        }
    }
}

impl Connection for LoopbackConnection {
    fn private_group(&self) -> &str {
        &self.private_group
    }

    fn join(&mut self, group: &str) -> Result<(), TransportError> {
        if group.is_empty() || group.len() > MAX_GROUP_NAME {
            return Err(TransportError::IllegalName(group.to_string()));
        }
        self.with_client(|client| {
            client.groups.insert(group.to_string());
        })
    }

    fn leave(&mut self, group: &str) -> Result<(), TransportError> {
        self.with_client(|client| {
            client.groups.remove(group);
        })
    }

    fn multicast(
        &mut self,
        group: &str,
        _service: ServiceLevel,
        flags: KindFlags,
        payload: &[u8],
    ) -> Result<usize, TransportError> {
        if group.is_empty() || group.len() > MAX_GROUP_NAME {
            return Err(TransportError::IllegalName(group.to_string()));
        }

        let max = self.hub.max_message_len;
        if payload.len() > max {
            return Err(TransportError::MessageTooLong {
                len: payload.len(),
                max,
            });
        }

        self.with_client(|_| ())?;
        let delivery = Delivery {
            sender: self.private_group.clone(),
            group: group.to_string(),
            flags,
            payload: Bytes::copy_from_slice(payload),
        };
        self.hub.lock().fan_out(delivery);
        Ok(payload.len())
    }

    fn poll(&mut self) -> Result<bool, TransportError> {
        self.with_client(|client| !client.inbox.is_empty())
    }

    fn receive(&mut self) -> Result<Delivery, TransportError> {
        self.with_client(|client| client.inbox.pop_front())?
            .ok_or(TransportError::NothingToReceive)
    }

    fn disconnect(&mut self) {
        if self.open {
            self.open = false;
            self.hub.lock().clients.remove(&self.private_group);
            debug!("Loopback client {} disconnected", self.private_group);
        }
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
