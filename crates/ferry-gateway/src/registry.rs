use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ferry_proto::chat_frame;

/// Chat frames buffered per peer before new ones are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Identity of one accepted connection.
pub type ConnId = Uuid;

/// Live connections and their outbound chat queues.
///
/// Every add, remove and broadcast fan-out runs under one lock, so a
/// broadcast never sees a half-removed peer.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    /// conn_id -> peer
    peers: Mutex<HashMap<ConnId, Peer>>,
}

struct Peer {
    addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Peers whose queue was full; the frame was dropped for them only.
    pub dropped: usize,
    /// Peers whose queue was closed; already removed.
    pub pruned: Vec<SocketAddr>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<ConnId, Peer>> {
        // Each critical section is a single insert/remove/iteration, so the
        // map is consistent even if a holder panicked.
        self.inner.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection. The returned guard unregisters it when dropped.
    pub fn add(&self, addr: SocketAddr) -> Registration {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        self.peers().insert(conn_id, Peer { addr, tx });
        debug!("registered {} as {}", addr, conn_id);
        Registration {
            registry: self.clone(),
            conn_id,
            addr,
            outbound: rx,
        }
    }

    /// Unregister a connection. Returns false if it was already gone.
    pub fn remove(&self, conn_id: ConnId) -> bool {
        let removed = self.peers().remove(&conn_id);
        if let Some(peer) = &removed {
            debug!("unregistered {} ({})", peer.addr, conn_id);
        }
        removed.is_some()
    }

    pub fn contains(&self, conn_id: ConnId) -> bool {
        self.peers().contains_key(&conn_id)
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses of every registered peer.
    pub fn snapshot(&self) -> Vec<(ConnId, SocketAddr)> {
        self.peers().iter().map(|(id, p)| (*id, p.addr)).collect()
    }

    /// Queue a chat frame for every peer except `from`.
    ///
    /// A peer whose queue is full misses this frame. A peer whose queue is
    /// closed is skipped, and all such peers are removed once the pass is
    /// over. The lock is held for the whole pass; queueing never blocks.
    pub fn broadcast(&self, from: Option<ConnId>, text: &str) -> BroadcastReport {
        let mut line = chat_frame(text).into_bytes();
        line.push(b'\n');
        let frame = Bytes::from(line);

        let mut peers = self.peers();
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (&conn_id, peer) in peers.iter() {
            if Some(conn_id) == from {
                continue;
            }
            match peer.tx.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("outbound queue full for {}, dropping chat frame", peer.addr);
                    report.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => failed.push(conn_id),
            }
        }

        for conn_id in failed {
            if let Some(peer) = peers.remove(&conn_id) {
                info!("pruned dead peer {} ({})", peer.addr, conn_id);
                report.pruned.push(peer.addr);
            }
        }

        report
    }
}

/// A registered connection. Dropping it unregisters the connection, on every
/// exit path of its handler.
pub struct Registration {
    registry: Registry,
    conn_id: ConnId,
    addr: SocketAddr,
    /// Encoded chat frames waiting to be written to this peer.
    pub outbound: mpsc::Receiver<Bytes>,
}

impl Registration {
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.conn_id);
    }
}
