//! In-memory transport and bootstrap service.
//!
//! Every node joined to a [`MemoryNetwork`] sits at a hidden position in a
//! plane; the one-way latency between two nodes is a base delay plus their
//! distance in milliseconds. Frames on a channel are delivered in order.
//!
//! Failure injection for tests and simulation:
//! - [`MemoryNetwork::silence`]: the node accepts channels but frames sent to it vanish.
//! - [`MemoryNetwork::stall`]: opening a channel to the node never completes.
//! - [`MemoryNetwork::crash`]: the node disappears and all its channels close.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use shoal_core::PeerId;

use crate::bootstrap::Bootstrap;
use crate::error::TransportError;
use crate::transport::{ChannelEvent, ChannelLabel, Connection, FrameSink, Transport};

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: DashMap<PeerId, Endpoint>,
    base_latency: Duration,
}

struct Endpoint {
    position: (f64, f64),
    incoming: mpsc::UnboundedSender<Connection>,
    silent: bool,
    stalled: bool,
    channels: Vec<Weak<MemorySink>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_latency(base_latency: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes: DashMap::new(),
                base_latency,
            }),
        }
    }

    /// Attach a node at the origin.
    pub fn join(&self, id: PeerId) -> MemoryTransport {
        self.join_at(id, (0.0, 0.0))
    }

    /// Attach a node at `position`. Rejoining replaces the previous endpoint.
    pub fn join_at(&self, id: PeerId, position: (f64, f64)) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.nodes.insert(
            id,
            Endpoint {
                position,
                incoming: tx,
                silent: false,
                stalled: false,
                channels: Vec::new(),
            },
        );
        MemoryTransport {
            id,
            network: self.inner.clone(),
            incoming: Mutex::new(rx),
        }
    }

    pub fn silence(&self, id: PeerId) {
        if let Some(mut node) = self.inner.nodes.get_mut(&id) {
            node.silent = true;
        }
    }

    pub fn stall(&self, id: PeerId) {
        if let Some(mut node) = self.inner.nodes.get_mut(&id) {
            node.stalled = true;
        }
    }

    /// Remove the node and close every channel it is part of.
    pub fn crash(&self, id: PeerId) {
        if let Some((_, node)) = self.inner.nodes.remove(&id) {
            for sink in node.channels.iter().filter_map(Weak::upgrade) {
                sink.close();
            }
        }
    }

    pub fn latency(&self, a: PeerId, b: PeerId) -> Option<Duration> {
        self.inner.latency(a, b)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.inner.nodes.contains_key(&id)
    }
}

impl NetworkInner {
    fn latency(&self, a: PeerId, b: PeerId) -> Option<Duration> {
        let pa = self.nodes.get(&a)?.position;
        let pb = self.nodes.get(&b)?.position;
        let (dx, dy) = (pa.0 - pb.0, pa.1 - pb.1);
        let distance_ms = (dx * dx + dy * dy).sqrt();
        Some(self.base_latency + Duration::from_micros((distance_ms * 1000.0).round() as u64))
    }

    fn is_silent(&self, id: PeerId) -> bool {
        self.nodes.get(&id).map(|n| n.silent).unwrap_or(false)
    }

    fn track(&self, id: PeerId, sink: &Arc<MemorySink>) {
        if let Some(mut node) = self.nodes.get_mut(&id) {
            node.channels.retain(|w| w.strong_count() > 0);
            node.channels.push(Arc::downgrade(sink));
        }
    }
}

// ── Channels ─────────────────────────────────────────────────────────────────

/// One direction of a channel. Frames carry their delivery deadline so the
/// forwarding task can preserve order while applying latency.
type Pipe = mpsc::UnboundedSender<(Instant, ChannelEvent)>;

fn pipe() -> (Pipe, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<(Instant, ChannelEvent)>();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some((due, event)) = in_rx.recv().await {
            tokio::time::sleep_until(due).await;
            let closed = matches!(event, ChannelEvent::Closed);
            if out_tx.send(event).is_err() || closed {
                break;
            }
        }
    });
    (in_tx, out_rx)
}

pub struct MemorySink {
    remote: PeerId,
    to_remote: Pipe,
    latency: Duration,
    /// Shared by both ends.
    open: Arc<AtomicBool>,
    network: Weak<NetworkInner>,
}

impl FrameSink for MemorySink {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let Some(network) = self.network.upgrade() else {
            return Err(TransportError::Shutdown);
        };
        if network.is_silent(self.remote) {
            return Ok(());
        }
        self.to_remote
            .send((Instant::now() + self.latency, ChannelEvent::Data(frame)))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self
                .to_remote
                .send((Instant::now() + self.latency, ChannelEvent::Closed));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct MemoryTransport {
    id: PeerId,
    network: Arc<NetworkInner>,
    incoming: Mutex<mpsc::UnboundedReceiver<Connection>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    async fn open(&self, peer: PeerId, label: ChannelLabel) -> Result<Connection, TransportError> {
        let (incoming, stalled) = {
            let node = self
                .network
                .nodes
                .get(&peer)
                .ok_or(TransportError::Unreachable(peer))?;
            (node.incoming.clone(), node.stalled)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let latency = self
            .network
            .latency(self.id, peer)
            .ok_or(TransportError::Unreachable(peer))?;

        let open = Arc::new(AtomicBool::new(true));
        let (to_remote, remote_events) = pipe();
        let (to_local, local_events) = pipe();
        let local_sink = Arc::new(MemorySink {
            remote: peer,
            to_remote,
            latency,
            open: open.clone(),
            network: Arc::downgrade(&self.network),
        });
        let remote_sink = Arc::new(MemorySink {
            remote: self.id,
            to_remote: to_local,
            latency,
            open,
            network: Arc::downgrade(&self.network),
        });
        self.network.track(self.id, &local_sink);
        self.network.track(peer, &remote_sink);

        incoming
            .send(Connection {
                peer: self.id,
                label,
                sink: remote_sink,
                events: remote_events,
            })
            .map_err(|_| TransportError::Unreachable(peer))?;

        tokio::time::sleep(latency).await;
        Ok(Connection {
            peer,
            label,
            sink: local_sink,
            events: local_events,
        })
    }

    async fn accept(&self) -> Option<Connection> {
        self.incoming.lock().await.recv().await
    }
}

// ── Bootstrap ────────────────────────────────────────────────────────────────

/// Rendezvous registry handing out random samples of registered identities.
#[derive(Default)]
pub struct MemoryBootstrap {
    registered: parking_lot::Mutex<HashSet<PeerId>>,
    sample_size: usize,
    refills: AtomicUsize,
}

impl MemoryBootstrap {
    pub fn new(sample_size: usize) -> Arc<Self> {
        Arc::new(Self {
            registered: parking_lot::Mutex::new(HashSet::new()),
            sample_size,
            refills: AtomicUsize::new(0),
        })
    }

    pub fn refill_count(&self) -> usize {
        self.refills.load(Ordering::Relaxed)
    }

    pub fn is_registered(&self, id: PeerId) -> bool {
        self.with_registry(|r| r.contains(&id))
    }

    fn with_registry<R>(&self, f: impl FnOnce(&mut HashSet<PeerId>) -> R) -> R {
        f(&mut self.registered.lock())
    }

    fn sample(&self, me: PeerId) -> Vec<PeerId> {
        self.with_registry(|r| {
            let mut ids: Vec<PeerId> = r.iter().copied().filter(|id| *id != me).collect();
            ids.shuffle(&mut rand::thread_rng());
            ids.truncate(self.sample_size);
            ids
        })
    }
}

#[async_trait]
impl Bootstrap for MemoryBootstrap {
    async fn register(&self, me: PeerId) -> Result<Vec<PeerId>, TransportError> {
        let sample = self.sample(me);
        self.with_registry(|r| r.insert(me));
        Ok(sample)
    }

    async fn refill(&self, me: PeerId) -> Result<Vec<PeerId>, TransportError> {
        self.refills.fetch_add(1, Ordering::Relaxed);
        Ok(self.sample(me))
    }

    async fn unregister(&self, me: PeerId) {
        self.with_registry(|r| r.remove(&me));
    }

    async fn report_dead(&self, peer: PeerId) {
        self.with_registry(|r| r.remove(&peer));
    }
}
