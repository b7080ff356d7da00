//! Link pool: at most one pooled link per remote identity.
//!
//! `connect` returns the open link, joins an in-flight dial, or starts a new
//! dial bounded by the connect timeout. Concurrent callers for the same
//! identity share one dial.
//!
//! When both sides dial each other at the same time, the link dialed by the
//! lower identity survives on both ends; the other is closed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::seq::SliceRandom;

use shoal_core::{Label, PeerId};

use crate::dispatch::{Dispatcher, ProtocolHandler};
use crate::error::OverlayError;
use crate::link::{self, Link, LinkEnd};
use crate::transport::{ChannelLabel, Connection, Transport};

type Dial = Shared<BoxFuture<'static, Result<Arc<Link>, OverlayError>>>;

enum Slot {
    Open(Arc<Link>),
    Connecting(Dial),
}

enum Pending {
    Ready(Arc<Link>),
    Dial(Dial),
}

impl Slot {
    /// `None` when the slot holds a dead link and a new dial is needed.
    fn pending(&self) -> Option<Pending> {
        match self {
            Slot::Open(link) if link.is_open() => Some(Pending::Ready(link.clone())),
            Slot::Open(_) => None,
            Slot::Connecting(dial) => Some(Pending::Dial(dial.clone())),
        }
    }
}

pub struct LinkPool {
    local: PeerId,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    slots: DashMap<PeerId, Slot>,
    connect_timeout: Duration,
}

impl LinkPool {
    pub fn new(transport: Arc<dyn Transport>, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            local: transport.local_id(),
            transport,
            dispatcher: Arc::new(Dispatcher::new()),
            slots: DashMap::new(),
            connect_timeout,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn set_handler(&self, label: Label, handler: Arc<dyn ProtocolHandler>) {
        self.dispatcher.register(label, handler);
    }

    pub async fn connect(self: &Arc<Self>, peer: PeerId) -> Result<Arc<Link>, OverlayError> {
        if peer == self.local {
            return Err(OverlayError::ConnectError {
                peer,
                reason: "refusing to dial self".into(),
            });
        }
        let pending = match self.slots.entry(peer) {
            Entry::Occupied(mut slot) => match slot.get().pending() {
                Some(pending) => pending,
                None => {
                    let dial = self.dial(peer);
                    slot.insert(Slot::Connecting(dial.clone()));
                    Pending::Dial(dial)
                }
            },
            Entry::Vacant(slot) => {
                let dial = self.dial(peer);
                slot.insert(Slot::Connecting(dial.clone()));
                Pending::Dial(dial)
            }
        };
        match pending {
            Pending::Ready(link) => Ok(link),
            Pending::Dial(dial) => dial.await,
        }
    }

    fn dial(self: &Arc<Self>, peer: PeerId) -> Dial {
        let pool = self.clone();
        let task = tokio::spawn(async move {
            let opened = tokio::time::timeout(
                pool.connect_timeout,
                pool.transport.open(peer, ChannelLabel::Pool),
            )
            .await;
            match opened {
                Ok(Ok(conn)) => Ok(pool.install_dialed(conn)),
                Ok(Err(e)) => {
                    pool.clear_dial(peer);
                    tracing::debug!(peer, error = %e, "connect failed");
                    Err(OverlayError::ConnectError {
                        peer,
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    pool.clear_dial(peer);
                    tracing::debug!(peer, "connect timed out");
                    Err(OverlayError::ConnectTimeout(peer))
                }
            }
        });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(OverlayError::ConnectError {
                    peer,
                    reason: e.to_string(),
                })
            })
        }
        .boxed()
        .shared()
    }

    fn install_dialed(self: &Arc<Self>, conn: Connection) -> Arc<Link> {
        let link = self.attach(conn);
        match self.slots.entry(link.peer()) {
            Entry::Occupied(mut slot) => {
                let winner = match slot.get() {
                    Slot::Open(existing) if existing.is_open() => Some(existing.clone()),
                    _ => None,
                };
                if let Some(winner) = winner {
                    link.close();
                    return winner;
                }
                slot.insert(Slot::Open(link.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::Open(link.clone()));
            }
        }
        tracing::debug!(peer = link.peer(), "pooled link open");
        link
    }

    fn clear_dial(&self, peer: PeerId) {
        self.slots
            .remove_if(&peer, |_, slot| matches!(slot, Slot::Connecting(_)));
    }

    /// Take over a channel opened by a remote peer.
    pub fn accept(self: &Arc<Self>, conn: Connection) {
        let peer = conn.peer;
        let ours_wins = match self.slots.get(&peer).as_deref() {
            Some(Slot::Open(existing)) => existing.is_open() && self.local < peer,
            Some(Slot::Connecting(_)) => self.local < peer,
            None => false,
        };
        if ours_wins {
            tracing::debug!(peer, "refusing duplicate inbound link");
            conn.sink.close();
            return;
        }
        let link = self.attach(conn);
        if let Some(Slot::Open(old)) = self.slots.insert(peer, Slot::Open(link)) {
            old.close();
        }
        tracing::debug!(peer, "accepted pooled link");
    }

    fn attach(self: &Arc<Self>, conn: Connection) -> Arc<Link> {
        let link = Link::new(conn.peer, ChannelLabel::Pool, conn.sink);
        let pool = Arc::downgrade(self);
        let dispatcher = self.dispatcher.clone();
        let driven = link.clone();
        tokio::spawn(async move {
            if link::drive(driven.clone(), conn.events, dispatcher.clone()).await == LinkEnd::Remote {
                let Some(pool) = pool.upgrade() else { return };
                if pool.evict(&driven) {
                    tracing::debug!(peer = driven.peer(), "pooled link lost");
                    dispatcher.link_lost(driven.peer());
                }
            }
        });
        link
    }

    /// Remove `link`'s slot if it still refers to that exact link.
    fn evict(&self, link: &Link) -> bool {
        self.slots
            .remove_if(&link.peer(), |_, slot| {
                matches!(slot, Slot::Open(current) if current.id() == link.id())
            })
            .is_some()
    }

    pub fn close(&self, link: &Link) {
        self.evict(link);
        link.close();
    }

    pub fn close_peer(&self, peer: PeerId) {
        if let Some((_, Slot::Open(link))) = self.slots.remove(&peer) {
            link.close();
        }
    }

    pub fn get(&self, peer: PeerId) -> Option<Arc<Link>> {
        match self.slots.get(&peer).as_deref() {
            Some(Slot::Open(link)) if link.is_open() => Some(link.clone()),
            _ => None,
        }
    }

    pub fn random_link(&self) -> Option<Arc<Link>> {
        let open = self.open_links();
        open.choose(&mut rand::thread_rng()).cloned()
    }

    fn open_links(&self) -> Vec<Arc<Link>> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Open(link) if link.is_open() => Some(link.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.open_links().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.open_links().iter().map(|l| l.peer()).collect()
    }

    /// Close every link and drop all handlers.
    pub fn shutdown(&self) {
        for link in self.open_links() {
            link.close();
        }
        self.slots.clear();
        self.dispatcher.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct LossCounter(AtomicUsize);

    #[async_trait::async_trait]
    impl ProtocolHandler for LossCounter {
        async fn handle_request(&self, _link: &Arc<Link>, _msg: shoal_core::Message) -> Option<shoal_core::Message> {
            None
        }

        fn on_link_closed(&self, _peer: PeerId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawn_acceptor(pool: Arc<LinkPool>, transport: Arc<dyn Transport>) {
        tokio::spawn(async move {
            while let Some(conn) = transport.accept().await {
                pool.accept(conn);
            }
        });
    }

    fn node(net: &MemoryNetwork, id: PeerId) -> Arc<LinkPool> {
        let transport: Arc<dyn Transport> = Arc::new(net.join(id));
        let pool = LinkPool::new(transport.clone(), Duration::from_secs(2));
        spawn_acceptor(pool.clone(), transport);
        pool
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_link() {
        let net = MemoryNetwork::new();
        let a = node(&net, 1);
        let _b = node(&net, 2);

        let (x, y) = tokio::join!(a.connect(2), a.connect(2));
        let (x, y) = (x.unwrap(), y.unwrap());
        assert_eq!(x.id(), y.id());
        assert_eq!(a.len(), 1);
        assert_eq!(a.connect(2).await.unwrap().id(), x.id());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_hits_connect_timeout() {
        let net = MemoryNetwork::new();
        let a = node(&net, 1);
        let _b = node(&net, 2);
        net.stall(2);
        assert!(matches!(a.connect(2).await, Err(OverlayError::ConnectTimeout(2))));
        assert!(a.is_empty());
    }

    #[tokio::test]
    async fn unknown_peer_is_connect_error() {
        let net = MemoryNetwork::new();
        let a = node(&net, 1);
        assert!(matches!(
            a.connect(42).await,
            Err(OverlayError::ConnectError { peer: 42, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_evicts_and_notifies() {
        let net = MemoryNetwork::new();
        let a = node(&net, 1);
        let b = node(&net, 2);
        let losses = Arc::new(LossCounter::default());
        a.set_handler(Label::Segment, losses.clone());

        a.connect(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.len(), 1);

        b.close_peer(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(a.get(2).is_none());
        assert_eq!(losses.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_close_does_not_notify() {
        let net = MemoryNetwork::new();
        let a = node(&net, 1);
        let _b = node(&net, 2);
        let losses = Arc::new(LossCounter::default());
        a.set_handler(Label::Segment, losses.clone());

        let link = a.connect(2).await.unwrap();
        a.close(&link);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(a.is_empty());
        assert_eq!(losses.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_dials_converge_on_one_link() {
        let net = MemoryNetwork::with_base_latency(Duration::from_millis(20));
        let a = node(&net, 1);
        let b = node(&net, 2);

        let (x, y) = tokio::join!(a.connect(2), b.connect(1));
        x.unwrap();
        y.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert!(a.get(2).is_some());
        assert!(b.get(1).is_some());
    }
}
