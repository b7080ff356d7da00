//! Cyclon peer sampling.
//!
//! Each node keeps a small view of peer descriptors. Every overlay cycle
//! the oldest entry is taken out and becomes the shuffle partner; both sides
//! then swap a handful of random entries. Over time every view converges to
//! a uniform random sample of live peers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::index;

use shoal_core::wire::{fresh_token, CyclonMessage};
use shoal_core::{Coordinate, Message, PeerDescriptor, PeerId};

use crate::bootstrap::BootstrapQueue;
use crate::coordinates::CoordinateStore;
use crate::dispatch::ProtocolHandler;
use crate::error::OverlayError;
use crate::link::Link;

/// Entries exchanged by the responder; the initiator sends one fewer plus itself.
pub const SHUFFLE_LENGTH: usize = 5;
pub const MAX_VIEW: usize = 20;

// ── View ─────────────────────────────────────────────────────────────────────

/// Bounded set of descriptors. Never contains the owner, never holds an
/// identity twice.
#[derive(Debug)]
pub struct SamplingView {
    me: PeerId,
    peers: Vec<PeerDescriptor>,
}

impl SamplingView {
    pub fn new(me: PeerId) -> Self {
        Self {
            me,
            peers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[PeerDescriptor] {
        &self.peers
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.iter().any(|p| p.id == id)
    }

    /// Increase every entry's age and remove the oldest one.
    pub fn age_and_take_oldest(&mut self) -> Option<PeerDescriptor> {
        let mut oldest: Option<(usize, u32)> = None;
        for (i, peer) in self.peers.iter_mut().enumerate() {
            peer.age += 1;
            if oldest.map_or(true, |(_, age)| peer.age > age) {
                oldest = Some((i, peer.age));
            }
        }
        oldest.map(|(i, _)| self.peers.remove(i))
    }

    /// Remove up to `n` entries chosen uniformly at random.
    pub fn take_random(&mut self, n: usize) -> Vec<PeerDescriptor> {
        let n = n.min(self.peers.len());
        let mut picked = index::sample(&mut rand::thread_rng(), self.peers.len(), n).into_vec();
        picked.sort_unstable_by(|a, b| b.cmp(a));
        picked.into_iter().map(|i| self.peers.swap_remove(i)).collect()
    }

    /// Add `received` entries that are new, then refill free slots from `fallback`.
    pub fn merge(&mut self, received: Vec<PeerDescriptor>, fallback: Vec<PeerDescriptor>) {
        for peer in received {
            if self.peers.len() >= MAX_VIEW {
                break;
            }
            self.admit(peer);
        }
        for peer in fallback {
            if self.peers.len() >= MAX_VIEW {
                break;
            }
            self.admit(peer);
        }
    }

    fn admit(&mut self, peer: PeerDescriptor) {
        if peer.id != self.me && !self.contains(peer.id) {
            self.peers.push(peer);
        }
    }

    pub fn set_coordinate(&mut self, id: PeerId, coord: Coordinate) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.id == id) {
            peer.coord = coord;
        }
    }

    pub fn remove(&mut self, id: PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.id != id);
        self.peers.len() != before
    }
}

// ── Protocol ─────────────────────────────────────────────────────────────────

pub struct SamplingProtocol {
    me: PeerId,
    upload: u64,
    view: Mutex<SamplingView>,
    coords: Arc<CoordinateStore>,
    bootstrap: Arc<BootstrapQueue>,
    timeout: Duration,
}

impl SamplingProtocol {
    pub fn new(
        me: PeerId,
        upload: u64,
        coords: Arc<CoordinateStore>,
        bootstrap: Arc<BootstrapQueue>,
        timeout: Duration,
    ) -> Self {
        Self {
            me,
            upload,
            view: Mutex::new(SamplingView::new(me)),
            coords,
            bootstrap,
            timeout,
        }
    }

    fn self_descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(self.me)
            .with_coord(self.coords.coordinate())
            .with_upload(self.upload)
    }

    /// Shuffle partner for the next cycle. Falls back to the bootstrap
    /// service when the view is empty.
    pub async fn next_peer(&self) -> Result<PeerDescriptor, OverlayError> {
        let oldest = self.view.lock().age_and_take_oldest();
        match oldest {
            Some(peer) => Ok(peer),
            None => self.bootstrap.next().await,
        }
    }

    /// Run one shuffle over `link`.
    pub async fn next_cycle(&self, link: &Link) -> Result<(), OverlayError> {
        let spliced = self.view.lock().take_random(SHUFFLE_LENGTH - 1);
        let mut shuffle_list = spliced.clone();
        shuffle_list.push(self.self_descriptor());

        let request = Message::Cyclon(CyclonMessage::Request {
            shuffle_list,
            token: fresh_token(),
        });
        match link.request(request, self.timeout).await {
            Ok(Message::Cyclon(CyclonMessage::Response { shuffle_list, .. })) => {
                self.view.lock().merge(shuffle_list, spliced);
                tracing::trace!(peer = link.peer(), "shuffle complete");
                Ok(())
            }
            Ok(_) => {
                self.view.lock().merge(Vec::new(), spliced);
                Err(OverlayError::UnexpectedResponse)
            }
            Err(e) => {
                tracing::debug!(peer = link.peer(), error = %e, "shuffle failed");
                let mut view = self.view.lock();
                view.remove(link.peer());
                view.merge(Vec::new(), spliced);
                Err(e)
            }
        }
    }

    fn answer(&self, received: Vec<PeerDescriptor>) -> Vec<PeerDescriptor> {
        let mut view = self.view.lock();
        let taken = view.take_random(SHUFFLE_LENGTH);
        view.merge(received, taken.clone());
        taken
    }

    pub async fn report_dead(&self, peer: PeerId) {
        self.view.lock().remove(peer);
        self.bootstrap.report_dead(peer).await;
    }

    pub fn set_coordinate(&self, peer: PeerId, coord: Coordinate) {
        self.view.lock().set_coordinate(peer, coord);
    }

    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        self.view.lock().peers().to_vec()
    }

    pub fn len(&self) -> usize {
        self.view.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.lock().is_empty()
    }

    /// Seed the view directly, bypassing a shuffle.
    pub fn insert(&self, peer: PeerDescriptor) {
        self.view.lock().merge(vec![peer], Vec::new());
    }
}

#[async_trait]
impl ProtocolHandler for SamplingProtocol {
    async fn handle_request(&self, _link: &Arc<Link>, msg: Message) -> Option<Message> {
        let Message::Cyclon(CyclonMessage::Request {
            shuffle_list,
            token,
        }) = msg
        else {
            return None;
        };
        Some(Message::Cyclon(CyclonMessage::Response {
            shuffle_list: self.answer(shuffle_list),
            token,
        }))
    }
}
