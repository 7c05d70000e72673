//! Fan-out of room frames to every connected peer.
//!
//! Uses a tokio broadcast channel: one send, N receivers, each buffering up
//! to `capacity` frames. A peer that falls further behind than that skips
//! ahead (`Lagged`) and is caught up by the next forced resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::JoinInfo;

/// An encoded frame plus the client it came from, so receivers can skip
/// their own traffic without decoding.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub from: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

impl Outbound {
    pub fn new(from: Uuid, bytes: Vec<u8>) -> Self {
        Self {
            from,
            bytes: Arc::new(bytes),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// Broadcast group for one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,
    peers: RwLock<HashMap<Uuid, JoinInfo>>,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, client_id: Uuid, info: JoinInfo) -> broadcast::Receiver<Outbound> {
        let mut peers = self.peers.write().await;
        peers.insert(client_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, client_id: &Uuid) -> Option<JoinInfo> {
        self.peers.write().await.remove(client_id)
    }

    /// Send to every receiver, the sender's own included; filtering on
    /// [`Outbound::from`] is the receiver's job. Returns the receiver count.
    pub fn broadcast(&self, frame: Outbound) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, client_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}
