//! Connected-client roster.
//!
//! One mutex guards membership, subscriptions, and per-client command-uid
//! state. The receiver iterates over a snapshot (id + cloned socket handle)
//! taken under the lock; the sender instead runs its whole fan-out round
//! inside [`ClientRegistry::with_clients`] so no other thread can close a
//! socket out from under an in-progress send, and disconnected clients can
//! be pruned mid-iteration.

use crate::command::CLEAR_PREVIOUS_COMMANDS_TIMEOUT_SEC;
use crate::igtl::Subscription;
use log::{info, warn};
use parking_lot::Mutex;
use std::net::{Shutdown, TcpStream};

pub struct Client {
    pub id: u64,
    pub stream: TcpStream,
    pub peer: String,
    /// Empty lists fall back to the server defaults per list.
    pub subscription: Subscription,
    /// System time of the last inbound message from this client.
    pub last_command_time: f64,
    /// Uids of commands already accepted from this client.
    pub previous_command_uids: Vec<String>,
}

/// Receiver-side view of one client: enough to read from the socket and
/// attribute what arrives.
pub struct ClientSnapshot {
    pub id: u64,
    pub stream: TcpStream,
}

#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    clients: Vec<Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection. Returns the assigned id.
    pub fn add(&self, stream: TcpStream, now: f64) -> u64 {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.clients.push(Client {
            id,
            stream,
            peer: peer.clone(),
            subscription: Subscription::default(),
            last_command_time: now,
            previous_command_uids: Vec::new(),
        });
        info!("server received new client connection ({peer})");
        info!("number of connected clients: {}", inner.clients.len());
        id
    }

    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.clients.iter().position(|c| c.id == id) {
            let client = inner.clients.remove(pos);
            let _ = client.stream.shutdown(Shutdown::Both);
            info!("client disconnected ({})", client.peer);
            info!("number of connected clients: {}", inner.clients.len());
        }
    }

    pub fn num_connected(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().clients.is_empty()
    }

    /// Value snapshot for lock-free iteration in the receiver. Clients whose
    /// socket handle cannot be duplicated are skipped this tick.
    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let inner = self.inner.lock();
        inner
            .clients
            .iter()
            .filter_map(|client| match client.stream.try_clone() {
                Ok(stream) => Some(ClientSnapshot {
                    id: client.id,
                    stream,
                }),
                Err(err) => {
                    warn!("cannot duplicate socket of client {}: {err}", client.id);
                    None
                }
            })
            .collect()
    }

    /// Run `f` with the client list locked. The sender's fan-out rounds live
    /// here so that sends and pruning happen under one lock acquisition.
    pub fn with_clients<R>(&self, f: impl FnOnce(&mut Vec<Client>) -> R) -> R {
        f(&mut self.inner.lock().clients)
    }

    pub fn apply_subscription(&self, id: u64, subscription: Subscription) -> bool {
        let mut inner = self.inner.lock();
        match inner.clients.iter_mut().find(|c| c.id == id) {
            Some(client) => {
                client.subscription = subscription;
                info!("client info message received from client ({})", client.peer);
                true
            }
            None => false,
        }
    }

    pub fn touch_command_time(&self, id: u64, now: f64) {
        let mut inner = self.inner.lock();
        if let Some(client) = inner.clients.iter_mut().find(|c| c.id == id) {
            client.last_command_time = now;
        }
    }

    /// Drop the seen-uid set once the client has been quiet for longer than
    /// the dedupe window. Called on every inbound tick for the client.
    pub fn expire_command_uids(&self, id: u64, now: f64) {
        let mut inner = self.inner.lock();
        if let Some(client) = inner.clients.iter_mut().find(|c| c.id == id) {
            if now - client.last_command_time > CLEAR_PREVIOUS_COMMANDS_TIMEOUT_SEC
                && !client.previous_command_uids.is_empty()
            {
                client.previous_command_uids.clear();
                client.last_command_time = now;
            }
        }
    }

    /// Record a command uid. Returns false when the uid was already seen
    /// (the command must be dropped as a duplicate).
    pub fn register_command_uid(&self, id: u64, uid: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.clients.iter_mut().find(|c| c.id == id) {
            Some(client) => {
                if client.previous_command_uids.iter().any(|seen| seen == uid) {
                    false
                } else {
                    client.previous_command_uids.push(uid.to_string());
                    true
                }
            }
            None => false,
        }
    }

    /// Close every socket and empty the roster (shutdown path).
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        for client in inner.clients.drain(..) {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }
}
