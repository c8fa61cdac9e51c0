//! Fan-out of accepted mutations to every other connected session.
//!
//! Uses one tokio broadcast channel for the whole grid. Each connection
//! subscribes on join and skips frames it originated, so nothing is echoed
//! to the sender. A receiver that falls more than `capacity` frames behind
//! observes `Lagged` and is expected to resync from a snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Message, ProtocolError};

/// A connected session.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub addr: SocketAddr,
    pub connected_at: Instant,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            addr,
            connected_at: Instant::now(),
        }
    }
}

/// A pre-encoded frame tagged with the session it came from.
#[derive(Debug)]
pub struct Relay {
    pub origin: Uuid,
    pub frame: String,
}

/// Broadcast health counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Relay>>,
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a session and subscribe it to the fan-out.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Relay>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and publish `msg` on behalf of `origin`.
    ///
    /// Returns the number of subscribed receivers, the sender included.
    pub fn relay(&self, origin: Uuid, msg: &Message) -> Result<usize, ProtocolError> {
        let frame = msg.encode()?;
        let count = self
            .sender
            .send(Arc::new(Relay { origin, frame }))
            .unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
