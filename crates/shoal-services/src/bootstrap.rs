//! Bootstrap (rendezvous) service client.
//!
//! The bootstrap service only knows identities. It is contacted when a
//! node joins, when the sampling view runs dry, when a peer is found dead,
//! and when a node leaves.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use shoal_core::{PeerDescriptor, PeerId};

use crate::error::{OverlayError, TransportError};

#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Register `me` and return a sample of other registered identities.
    async fn register(&self, me: PeerId) -> Result<Vec<PeerId>, TransportError>;
    /// Fresh sample of registered identities.
    async fn refill(&self, me: PeerId) -> Result<Vec<PeerId>, TransportError>;
    async fn unregister(&self, me: PeerId);
    async fn report_dead(&self, peer: PeerId);
}

/// Identities received from the bootstrap service that have not been tried yet.
pub struct BootstrapQueue {
    me: PeerId,
    service: Arc<dyn Bootstrap>,
    queue: Mutex<Vec<PeerId>>,
}

impl BootstrapQueue {
    pub fn new(me: PeerId, service: Arc<dyn Bootstrap>) -> Self {
        Self {
            me,
            service,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub async fn register(&self) -> Result<usize, TransportError> {
        let ids = self.service.register(self.me).await?;
        let mut queue = self.queue.lock().await;
        queue.extend(ids.into_iter().filter(|id| *id != self.me));
        tracing::info!(peers = queue.len(), "registered at bootstrap");
        Ok(queue.len())
    }

    /// Pop a queued identity, refilling from the service when the queue is empty.
    pub async fn next(&self) -> Result<PeerDescriptor, OverlayError> {
        if let Some(id) = self.queue.lock().await.pop() {
            return Ok(PeerDescriptor::new(id));
        }
        let ids = self.service.refill(self.me).await.map_err(|e| {
            tracing::warn!(error = %e, "bootstrap refill failed");
            OverlayError::Exhausted
        })?;
        tracing::debug!(peers = ids.len(), "refilled from bootstrap");
        let mut queue = self.queue.lock().await;
        queue.extend(ids.into_iter().filter(|id| *id != self.me));
        queue.pop().map(PeerDescriptor::new).ok_or(OverlayError::Exhausted)
    }

    pub async fn report_dead(&self, peer: PeerId) {
        tracing::debug!(peer, "reporting dead peer to bootstrap");
        self.queue.lock().await.retain(|id| *id != peer);
        self.service.report_dead(peer).await;
    }

    pub async fn unregister(&self) {
        self.service.unregister(self.me).await;
    }
}
