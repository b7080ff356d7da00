//! Close-peer set: the peers nearest to us in coordinate space.
//!
//! Fed from the sampling view on a fast timer, and from closeness queries
//! answered by other members of the set on a slower one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;

use shoal_core::wire::{fresh_token, ClosePeerMessage};
use shoal_core::{Coordinate, Message, PeerDescriptor, PeerId};

use crate::coordinates::CoordinateStore;
use crate::dispatch::ProtocolHandler;
use crate::error::OverlayError;
use crate::link::Link;
use crate::link_pool::LinkPool;
use crate::sampling::SamplingProtocol;

pub const MAX_CLOSE_PEERS: usize = 16;

/// Bounded, ascending-by-distance set of descriptors.
#[derive(Debug)]
pub struct ClosePeerSet {
    me: PeerId,
    peers: Vec<PeerDescriptor>,
}

impl ClosePeerSet {
    pub fn new(me: PeerId) -> Self {
        Self {
            me,
            peers: Vec::new(),
        }
    }

    pub fn peers(&self) -> &[PeerDescriptor] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerDescriptor> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Merge `incoming`, recompute distances from `own`, keep the closest.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = PeerDescriptor>, own: &Coordinate) {
        for peer in incoming {
            if peer.id == self.me {
                continue;
            }
            match self.peers.iter_mut().find(|p| p.id == peer.id) {
                Some(known) => {
                    known.coord = peer.coord;
                    if peer.upload > 0 {
                        known.upload = peer.upload;
                    }
                }
                None => self.peers.push(peer),
            }
        }
        for peer in &mut self.peers {
            peer.distance = own.distance(&peer.coord);
        }
        self.peers.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        self.peers.truncate(MAX_CLOSE_PEERS);
    }

    /// Members strictly closer to `query` than `own` is, with distances
    /// measured from `query`.
    pub fn find_close(&self, query: &Coordinate, own: &Coordinate) -> Vec<PeerDescriptor> {
        let own_distance = own.distance(query);
        self.peers
            .iter()
            .filter_map(|p| {
                let distance = p.coord.distance(query);
                (distance < own_distance).then(|| {
                    PeerDescriptor::new(p.id)
                        .with_coord(p.coord)
                        .with_upload(p.upload)
                        .with_distance(distance)
                })
            })
            .collect()
    }

    pub fn remove(&mut self, id: PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.id != id);
        self.peers.len() != before
    }
}

// ── Explorer ─────────────────────────────────────────────────────────────────

pub struct ClosePeerExplorer {
    me: PeerId,
    set: Mutex<ClosePeerSet>,
    coords: Arc<CoordinateStore>,
    sampling: Arc<SamplingProtocol>,
    pool: Arc<LinkPool>,
    timeout: Duration,
}

impl ClosePeerExplorer {
    pub fn new(
        coords: Arc<CoordinateStore>,
        sampling: Arc<SamplingProtocol>,
        pool: Arc<LinkPool>,
        timeout: Duration,
    ) -> Self {
        let me = pool.local_id();
        Self {
            me,
            set: Mutex::new(ClosePeerSet::new(me)),
            coords,
            sampling,
            pool,
            timeout,
        }
    }

    pub fn merge_peers(&self, peers: impl IntoIterator<Item = PeerDescriptor>) {
        let own = self.coords.coordinate();
        self.set.lock().merge(peers, &own);
    }

    pub fn refresh_from_sampling(&self) {
        self.merge_peers(self.sampling.snapshot());
    }

    /// Insert `peer` unless it is already known.
    pub fn ensure_known(&self, peer: PeerDescriptor) {
        if self.set.lock().get(peer.id).is_none() {
            tracing::debug!(peer = peer.id, "adding descriptor to close-peer set");
            self.merge_peers([peer]);
        }
    }

    pub fn get(&self, id: PeerId) -> Option<PeerDescriptor> {
        self.set.lock().get(id).cloned()
    }

    pub fn remove(&self, id: PeerId) {
        self.set.lock().remove(id);
    }

    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        self.set.lock().peers().to_vec()
    }

    pub fn len(&self) -> usize {
        self.set.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().is_empty()
    }

    /// Ask one random member for peers closer to us than it is.
    pub async fn next_cycle(&self) -> Result<(), OverlayError> {
        self.refresh_from_sampling();
        let target = {
            let set = self.set.lock();
            set.peers().choose(&mut rand::thread_rng()).map(|p| p.id)
        };
        let Some(target) = target else {
            return Ok(());
        };

        let link = match self.pool.connect(target).await {
            Ok(link) => link,
            Err(e) => {
                tracing::debug!(peer = target, error = %e, "close-peer connect failed");
                self.remove(target);
                return Err(e);
            }
        };
        let request = Message::ClosePeer(ClosePeerMessage::Request {
            sender: self.me,
            timestamp: fresh_token(),
            coord: self.coords.coordinate(),
        });
        match link.request(request, self.timeout).await {
            Ok(Message::ClosePeer(ClosePeerMessage::Response { peers, .. })) => {
                tracing::trace!(peer = target, received = peers.len(), "close-peer answer");
                self.merge_peers(peers);
                Ok(())
            }
            Ok(_) => Err(OverlayError::UnexpectedResponse),
            Err(e) => {
                tracing::debug!(peer = target, error = %e, "close-peer query failed");
                self.pool.close(&link);
                self.remove(target);
                Err(e)
            }
        }
    }

    /// Exploration on one timer, sampling-view refresh on another.
    pub async fn run(
        self: Arc<Self>,
        explore_every: Duration,
        refresh_every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut explore = tokio::time::interval(explore_every);
        explore.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(refresh_every);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = refresh.tick() => self.refresh_from_sampling(),
                _ = explore.tick() => {
                    if let Err(e) = self.next_cycle().await {
                        tracing::debug!(error = %e, "close-peer cycle failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for ClosePeerExplorer {
    async fn handle_request(&self, _link: &Arc<Link>, msg: Message) -> Option<Message> {
        let Message::ClosePeer(ClosePeerMessage::Request {
            timestamp, coord, ..
        }) = msg
        else {
            return None;
        };
        let own = self.coords.coordinate();
        let peers = self.set.lock().find_close(&coord, &own);
        Some(Message::ClosePeer(ClosePeerMessage::Response { timestamp, peers }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(id: PeerId, x: f64, y: f64) -> PeerDescriptor {
        PeerDescriptor::new(id).with_coord(Coordinate::new(x, y))
    }

    fn assert_sorted(set: &ClosePeerSet) {
        assert!(set.len() <= MAX_CLOSE_PEERS);
        for pair in set.peers().windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn merge_sorts_and_truncates() {
        let mut set = ClosePeerSet::new(0);
        let own = Coordinate::ORIGIN;
        set.merge((1..=30).rev().map(|i| at(i, i as f64, 0.0)), &own);
        assert_eq!(set.len(), MAX_CLOSE_PEERS);
        assert_eq!(set.peers()[0].id, 1);
        assert_eq!(set.peers()[15].id, 16);
        assert_sorted(&set);
    }

    #[test]
    fn merge_updates_known_coordinate_and_skips_self() {
        let mut set = ClosePeerSet::new(0);
        let own = Coordinate::ORIGIN;
        set.merge([at(1, 10.0, 0.0), at(2, 5.0, 0.0)], &own);
        set.merge([at(1, 1.0, 0.0), at(0, 0.0, 0.0)], &own);
        assert_eq!(set.len(), 2);
        assert_eq!(set.peers()[0].id, 1);
        assert_eq!(set.peers()[0].distance, 1.0);
        assert!(set.get(0).is_none());
        assert_sorted(&set);
    }

    #[test]
    fn find_close_returns_only_strictly_closer_peers() {
        let mut set = ClosePeerSet::new(0);
        let own = Coordinate::ORIGIN;
        set.merge([at(1, 9.0, 0.0), at(2, 5.0, 0.0), at(3, -4.0, 0.0)], &own);

        let query = Coordinate::new(10.0, 0.0);
        let close = set.find_close(&query, &own);
        let ids: Vec<_> = close.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
        for p in &close {
            assert!(p.distance < own.distance(&query));
            assert_eq!(p.distance, p.coord.distance(&query));
        }
    }

    #[test]
    fn equidistant_peer_is_not_closer() {
        let mut set = ClosePeerSet::new(0);
        let own = Coordinate::ORIGIN;
        set.merge([at(1, 20.0, 0.0)], &own);
        assert!(set.find_close(&Coordinate::new(10.0, 0.0), &own).is_empty());
    }
}
