//! In-process transport.
//!
//! All workers attached to the same [MemNetwork] exchange frames through
//! unbounded channels, which makes it possible to run a whole cluster
//! within a single process.

use bytes::Bytes;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

use super::{Inbound, LinkEvent, Transport};
use crate::{TransportError, WorkerId};

struct Link {
    tx: mpsc::UnboundedSender<LinkEvent>,
    alive: Arc<AtomicBool>,
}

/// A network of workers within the same process.
///
/// Clones share the same network.
#[derive(Clone, Default)]
pub struct MemNetwork {
    links: Arc<Mutex<HashMap<WorkerId, Link>>>,
}

impl fmt::Debug for MemNetwork {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ids: Vec<_> = self.links.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("MemNetwork").field("workers", &ids).finish()
    }
}

impl MemNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the worker with the specified id to the network.
    ///
    /// Returns the transport for sending and the receiver of inbound events.
    /// A worker previously attached with the same id is detached.
    pub fn join(&self, id: WorkerId) -> (MemTransport, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let link = Link { tx, alive: alive.clone() };
        if let Some(old) = self.links.lock().unwrap().insert(id, link) {
            old.alive.store(false, Ordering::SeqCst);
        }
        (MemTransport { id, network: self.clone(), alive }, rx)
    }

    /// Simulates a crash of the specified worker.
    ///
    /// The worker can neither send nor receive frames anymore and all other
    /// workers observe the loss of it.
    pub fn kill(&self, id: WorkerId) {
        let peers: Vec<_> = {
            let mut links = self.links.lock().unwrap();
            let Some(link) = links.remove(&id) else { return };
            link.alive.store(false, Ordering::SeqCst);
            links.values().map(|link| link.tx.clone()).collect()
        };

        tracing::debug!(worker = id, "killing worker");
        for tx in peers {
            let _ = tx.send(LinkEvent::PeerLost(id));
        }
    }

    fn deliver(&self, src: WorkerId, dst: WorkerId, frame: Bytes) -> Result<(), TransportError> {
        let links = self.links.lock().unwrap();
        let link = links.get(&dst).ok_or(TransportError::Unreachable(dst))?;
        link.tx.send(LinkEvent::Frame(src, frame)).map_err(|_| TransportError::Unreachable(dst))
    }

    fn detach(&self, id: WorkerId, alive: &Arc<AtomicBool>) {
        let mut links = self.links.lock().unwrap();
        if links.get(&id).map(|link| Arc::ptr_eq(&link.alive, alive)).unwrap_or_default() {
            links.remove(&id);
        }
    }
}

/// Transport of a worker attached to a [MemNetwork].
pub struct MemTransport {
    id: WorkerId,
    network: MemNetwork,
    alive: Arc<AtomicBool>,
}

impl fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemTransport")
            .field("id", &self.id)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish()
    }
}

impl Transport for MemTransport {
    fn send(&self, dst: WorkerId, frame: Bytes) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.network.deliver(self.id, dst, frame)
    }

    fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.network.detach(self.id, &self.alive);
        }
    }
}
