//! Connection registry with targeted and global fan-out.
//!
//! Every protocol service owns one registry. Sends go through each peer's
//! bounded [`ConnectionHandle`] queue, so fan-out is fire-and-forget: a full or
//! closed peer is counted as dropped and the loop moves on.
//!
//! Stats are tracked with atomics so the hot path never takes a write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::connection::{encode_json_frame, ConnectionHandle, ConnectionId, SendError};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Live connections of one protocol service.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    stats: AtomicBroadcastStats,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Track a connection. Replaces any handle with the same id.
    pub fn register(&self, handle: ConnectionHandle) {
        self.connections.write().insert(handle.id(), handle);
    }

    /// Stop tracking a connection.
    pub fn unregister(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.write().remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().copied().collect()
    }

    fn record(&self, result: Result<(), SendError>, id: &ConnectionId) -> bool {
        match result {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped message for {id}: {e}");
                false
            }
        }
    }

    /// Send pre-encoded bytes to one connection.
    pub fn send_to(&self, id: &ConnectionId, frame: Arc<Vec<u8>>) -> Result<(), SendError> {
        let handle = self.get(id).ok_or(SendError::Closed)?;
        let result = handle.send(frame);
        self.record(result.clone(), id);
        result
    }

    /// Send pre-encoded bytes to each listed connection. Returns how many
    /// accepted the message.
    pub fn send_many<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ConnectionId>,
        frame: &Arc<Vec<u8>>,
    ) -> usize {
        let connections = self.connections.read();
        let mut delivered = 0;
        for id in ids {
            let result = match connections.get(id) {
                Some(handle) => handle.send(frame.clone()),
                None => Err(SendError::Closed),
            };
            if self.record(result, id) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send pre-encoded bytes to every connection except `except`.
    pub fn broadcast(&self, frame: &Arc<Vec<u8>>, except: Option<&ConnectionId>) -> usize {
        let connections = self.connections.read();
        let mut delivered = 0;
        for (id, handle) in connections.iter() {
            if Some(id) == except {
                continue;
            }
            if self.record(handle.send(frame.clone()), id) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Serialize once and broadcast.
    pub fn broadcast_json<T: Serialize>(
        &self,
        msg: &T,
        except: Option<&ConnectionId>,
    ) -> Result<usize, SendError> {
        let frame = encode_json_frame(msg)?;
        Ok(self.broadcast(&frame, except))
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.len(),
        }
    }
}
