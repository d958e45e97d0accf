//! Live-connection registry keyed by user ID.
//!
//! Written from per-connection lifecycles (register on connect, unregister on
//! teardown) and read from the coordinator's broadcast path, so the map sits
//! behind a reader/writer lock rather than inside the coordinator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Utf8Bytes;
use notably_common::UserId;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Capacity of each connection's outbound frame queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Distinguishes successive connections of the same user, so a superseded
/// connection's teardown can never evict its replacement.
pub type ConnId = u64;

/// Handle to one live connection's outbound queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    tx: mpsc::Sender<Utf8Bytes>,
}

/// Outcome of a best-effort send to a user's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The queue was full; the connection has been dropped from the registry.
    QueueFull,
    NotConnected,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Insert or replace the entry for `user_id` and return the new
    /// connection's id.
    ///
    /// Replacing drops the old sender, which closes the superseded
    /// connection's outbound queue and terminates its write pump.
    pub fn register(&self, user_id: UserId, tx: mpsc::Sender<Utf8Bytes>) -> ConnId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ConnectionHandle { conn_id, tx };
        let previous = self.connections.write().insert(user_id, handle);
        if let Some(old) = previous {
            tracing::debug!(%user_id, old_conn_id = old.conn_id, conn_id, "superseding connection");
        }
        conn_id
    }

    /// Remove the entry, but only if it still belongs to `conn_id`.
    /// Idempotent; unregistering an absent or superseded connection is a no-op.
    pub fn unregister(&self, user_id: UserId, conn_id: ConnId) {
        let mut connections = self.connections.write();
        if connections
            .get(&user_id)
            .is_some_and(|handle| handle.conn_id == conn_id)
        {
            connections.remove(&user_id);
        }
    }

    /// The current connection for a user, if any.
    pub fn get(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.read().get(&user_id).cloned()
    }

    /// Best-effort enqueue of one serialized frame.
    ///
    /// A full queue means the consumer is too slow to keep: the entry is
    /// removed (closing the queue, which ends the write pump) and the caller
    /// is told via `QueueFull`. Broadcast never blocks on a slow reader.
    pub fn send(&self, user_id: UserId, frame: Utf8Bytes) -> SendOutcome {
        let Some(handle) = self.get(user_id) else {
            return SendOutcome::NotConnected;
        };
        match handle.tx.try_send(frame) {
            Ok(()) => SendOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    %user_id,
                    conn_id = handle.conn_id,
                    "outbound queue full, dropping connection"
                );
                self.unregister(user_id, handle.conn_id);
                SendOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(user_id, handle.conn_id);
                SendOutcome::NotConnected
            }
        }
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.connections.read().contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
