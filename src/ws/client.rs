//! Per-room bookkeeping of connected WebSocket clients.
//!
//! A client is in exactly one of two substates: desynced (handshake not yet
//! complete) or synced. New clients start desynced; the room marks them
//! synced once the SyncStep1/SyncStep2 exchange finishes. A background reaper
//! evicts desynced clients that never complete the handshake and synced
//! clients whose channel has died.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ClientId = String;

/// Outgoing frame for one client connection.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Binary(Vec<u8>),
    Close(u16),
}

#[derive(Debug)]
struct Client {
    sender: mpsc::UnboundedSender<ClientFrame>,
    synced: bool,
    last_modified_at: Instant,
}

impl Client {
    fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
struct GroupState {
    clients: HashMap<ClientId, Client>,
    accepting: bool,
}

/// The set of clients attached to one room.
#[derive(Debug)]
pub struct ClientGroup {
    room_id: String,
    state: RwLock<GroupState>,
}

impl ClientGroup {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            state: RwLock::new(GroupState {
                clients: HashMap::new(),
                accepting: true,
            }),
        }
    }

    /// Add a new (desynced) client. Returns its id, or an error when the
    /// group has been stopped and not re-armed.
    pub fn add(&self, sender: mpsc::UnboundedSender<ClientFrame>) -> Result<ClientId> {
        let mut state = self.state.write();
        if !state.accepting {
            return Err(Error::NotFound(format!(
                "room '{}' is not accepting clients",
                self.room_id
            )));
        }
        let id = uuid::Uuid::new_v4().to_string();
        state.clients.insert(
            id.clone(),
            Client {
                sender,
                synced: false,
                last_modified_at: Instant::now(),
            },
        );
        Ok(id)
    }

    pub fn mark_synced(&self, client_id: &str) {
        let mut state = self.state.write();
        if let Some(client) = state.clients.get_mut(client_id) {
            client.synced = true;
            client.last_modified_at = Instant::now();
        }
    }

    pub fn mark_desynced(&self, client_id: &str) {
        let mut state = self.state.write();
        if let Some(client) = state.clients.get_mut(client_id) {
            client.synced = false;
            client.last_modified_at = Instant::now();
        }
    }

    /// Whether the client exists, is alive, and has completed the handshake.
    pub fn is_synced(&self, client_id: &str) -> Result<bool> {
        let state = self.state.read();
        match state.clients.get(client_id) {
            Some(client) if client.is_alive() => Ok(client.synced),
            _ => Err(Error::NotFound(format!("unknown client '{client_id}'"))),
        }
    }

    /// Remove a client, closing its channel with the given code if still open.
    pub fn remove(&self, client_id: &str, close_code: u16) {
        let mut state = self.state.write();
        if let Some(client) = state.clients.remove(client_id) {
            let _ = client.sender.send(ClientFrame::Close(close_code));
        }
    }

    /// Send a frame to one client. Fails with *unknown-client* when the
    /// client is gone or its channel is dead.
    pub fn send_to(&self, client_id: &str, frame: Vec<u8>) -> Result<()> {
        let state = self.state.read();
        let client = state
            .clients
            .get(client_id)
            .filter(|c| c.is_alive())
            .ok_or_else(|| Error::NotFound(format!("unknown client '{client_id}'")))?;
        client
            .sender
            .send(ClientFrame::Binary(frame))
            .map_err(|_| Error::NotFound(format!("client '{client_id}' channel closed")))
    }

    /// Broadcast a frame to every live synced client. Send failures are
    /// logged and do not block other recipients.
    pub fn broadcast(&self, frame: &[u8]) {
        let state = self.state.read();
        for (id, client) in state.clients.iter() {
            if !client.synced {
                continue;
            }
            if client.sender.send(ClientFrame::Binary(frame.to_vec())).is_err() {
                tracing::warn!(
                    room_id = %self.room_id,
                    client_id = %id,
                    "failed to write broadcast frame to client"
                );
            }
        }
    }

    /// Broadcast to every live synced client except one (awareness relay).
    pub fn broadcast_except(&self, except: &str, frame: &[u8]) {
        let state = self.state.read();
        for (id, client) in state.clients.iter() {
            if !client.synced || id == except {
                continue;
            }
            let _ = client.sender.send(ClientFrame::Binary(frame.to_vec()));
        }
    }

    pub fn count(&self) -> usize {
        self.state.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Close every channel with the given code and empty the group. The group
    /// stops accepting clients until [`Self::restart`].
    pub fn stop(&self, close_code: u16) {
        let mut state = self.state.write();
        for (_, client) in state.clients.drain() {
            let _ = client.sender.send(ClientFrame::Close(close_code));
        }
        state.accepting = false;
    }

    /// Stop with code 1001 and re-arm to accept new clients.
    pub fn restart(&self, close_code: u16) {
        let mut state = self.state.write();
        for (_, client) in state.clients.drain() {
            let _ = client.sender.send(ClientFrame::Close(close_code));
        }
        state.accepting = true;
    }

    /// One reaper pass: evict desynced clients older than the timeout and
    /// synced clients whose channel has died. Returns the evicted ids.
    pub fn reap(&self, desynced_timeout: Duration) -> Vec<ClientId> {
        let mut state = self.state.write();
        let now = Instant::now();
        let expired: Vec<ClientId> = state
            .clients
            .iter()
            .filter(|(_, client)| {
                (!client.synced && now.duration_since(client.last_modified_at) > desynced_timeout)
                    || !client.is_alive()
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(client) = state.clients.remove(id) {
                let _ = client
                    .sender
                    .send(ClientFrame::Close(super::protocol::CLOSE_SHUTTING_DOWN));
                tracing::info!(room_id = %self.room_id, client_id = %id, "evicted client");
            }
        }
        expired
    }

    /// Spawn the periodic reaper for this group.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        poll_interval: Duration,
        desynced_timeout: Duration,
    ) -> JoinHandle<()> {
        let group = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                group.reap(desynced_timeout);
            }
        })
    }
}
