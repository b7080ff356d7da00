//! Neighbor manager.
//!
//! Keeps two bounded lists of peers playing the same video bitrate:
//! outbound neighbors (chosen here from the close-peer set and the only
//! peers segments are requested from) and inbound neighbors (peers that
//! chose us). A peer may sit in both lists.
//!
//! Notifications are applied as soon as they arrive. An outbound admission
//! still in flight when the peer gets blacklisted, when we pause, or when
//! our bitrate changes is discarded once its answer comes back.
//!
//! A peer whose inbound list has no room for us answers normally and then
//! sends REMOVE_FROM_OUTBOUND, so the relation stays symmetric. The notice
//! may overtake our handling of the answer; it is remembered for peers
//! with a query in flight.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use shoal_core::wire::{fresh_token, NeighborMessage, NotificationType};
use shoal_core::{Coordinate, Message, PeerDescriptor, PeerId};

use crate::close_peers::ClosePeerExplorer;
use crate::coordinates::CoordinateStore;
use crate::dispatch::ProtocolHandler;
use crate::link::Link;
use crate::link_pool::LinkPool;
use crate::playback::PlaybackState;

pub const MAX_OUTBOUND: usize = 16;
pub const MAX_INBOUND: usize = 16;

// ── Lists ────────────────────────────────────────────────────────────────────

/// What to do with the next candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Outbound has room.
    Free,
    /// Outbound is full but the candidate is closer than its farthest entry.
    Swap,
    Skip,
}

/// Result of an inbound request from a peer on our bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAdmission {
    Accepted,
    /// Accepted; the farthest inbound entry was dropped to make room.
    Displaced(PeerId),
    /// Inbound is full of closer peers.
    Refused,
}

/// Peer dropped from outbound by an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evicted {
    pub peer: PeerId,
    /// Still an inbound neighbor, so the link stays up.
    pub inbound: bool,
}

#[derive(Debug, Default)]
pub struct NeighborSets {
    /// Ascending by distance.
    outbound: Vec<PeerDescriptor>,
    inbound: Vec<PeerDescriptor>,
    blacklist: HashSet<PeerId>,
    querying: HashSet<PeerId>,
    /// Peers that refused us while a query to them was in flight.
    refused: HashSet<PeerId>,
}

fn by_distance(peers: &mut [PeerDescriptor]) {
    peers.sort_by(|a, b| a.distance.total_cmp(&b.distance));
}

impl NeighborSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbound(&self) -> &[PeerDescriptor] {
        &self.outbound
    }

    pub fn inbound(&self) -> &[PeerDescriptor] {
        &self.inbound
    }

    pub fn contains_outbound(&self, id: PeerId) -> bool {
        self.outbound.iter().any(|p| p.id == id)
    }

    pub fn contains_inbound(&self, id: PeerId) -> bool {
        self.inbound.iter().any(|p| p.id == id)
    }

    pub fn is_blacklisted(&self, id: PeerId) -> bool {
        self.blacklist.contains(&id)
    }

    pub fn blacklisted(&self) -> usize {
        self.blacklist.len()
    }

    pub fn blacklist(&mut self, id: PeerId) {
        self.blacklist.insert(id);
    }

    pub fn unblacklist(&mut self, id: PeerId) -> bool {
        self.blacklist.remove(&id)
    }

    pub fn begin_query(&mut self, id: PeerId) {
        self.querying.insert(id);
        self.refused.remove(&id);
    }

    pub fn is_querying(&self, id: PeerId) -> bool {
        self.querying.contains(&id)
    }

    /// Remember a refusal from a peer we are querying. Ignored otherwise.
    pub fn mark_refused(&mut self, id: PeerId) {
        if self.querying.contains(&id) {
            self.refused.insert(id);
        }
    }

    /// Returns whether the peer refused us during the query.
    pub fn end_query(&mut self, id: PeerId) -> bool {
        self.querying.remove(&id);
        self.refused.remove(&id)
    }

    pub fn find(&self, id: PeerId) -> Option<&PeerDescriptor> {
        self.outbound
            .iter()
            .chain(self.inbound.iter())
            .find(|p| p.id == id)
    }

    /// Every neighbor identity, each once.
    pub fn all_ids(&self) -> Vec<PeerId> {
        let mut seen = HashSet::new();
        self.outbound
            .iter()
            .chain(self.inbound.iter())
            .filter(|p| seen.insert(p.id))
            .map(|p| p.id)
            .collect()
    }

    /// Recompute distances after our own coordinate moved.
    pub fn refresh_distances(&mut self, own: &Coordinate) {
        for peer in self.outbound.iter_mut().chain(self.inbound.iter_mut()) {
            peer.distance = own.distance(&peer.coord);
        }
        by_distance(&mut self.outbound);
    }

    /// Close peers that are neither outbound nor blacklisted, farthest
    /// first, so that popping yields the closest.
    pub fn candidates(&self, close: &[PeerDescriptor]) -> Vec<PeerDescriptor> {
        let mut left: Vec<_> = close
            .iter()
            .filter(|p| !self.contains_outbound(p.id) && !self.is_blacklisted(p.id))
            .cloned()
            .collect();
        left.sort_by(|a, b| b.distance.total_cmp(&a.distance));
        left
    }

    pub fn admission(&self, candidate: &PeerDescriptor) -> Admission {
        if self.outbound.len() < MAX_OUTBOUND {
            return Admission::Free;
        }
        match self.outbound.last() {
            Some(farthest) if candidate.distance < farthest.distance => Admission::Swap,
            _ => Admission::Skip,
        }
    }

    /// Add `peer` to outbound, dropping the farthest entry if over capacity.
    pub fn admit_outbound(&mut self, peer: PeerDescriptor) -> Option<Evicted> {
        self.outbound.retain(|p| p.id != peer.id);
        by_distance(&mut self.outbound);
        let evicted = if self.outbound.len() >= MAX_OUTBOUND {
            self.outbound.pop()
        } else {
            None
        };
        self.outbound.push(peer);
        by_distance(&mut self.outbound);
        evicted.map(|p| Evicted {
            peer: p.id,
            inbound: self.contains_inbound(p.id),
        })
    }

    pub fn accept_inbound(&mut self, peer: PeerDescriptor) -> InboundAdmission {
        if let Some(known) = self.inbound.iter_mut().find(|p| p.id == peer.id) {
            *known = peer;
            return InboundAdmission::Accepted;
        }
        if self.inbound.len() < MAX_INBOUND {
            self.inbound.push(peer);
            return InboundAdmission::Accepted;
        }
        let farthest = self
            .inbound
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.distance.total_cmp(&b.distance))
            .map(|(i, p)| (i, p.distance));
        match farthest {
            Some((i, distance)) if peer.distance < distance => {
                let dropped = std::mem::replace(&mut self.inbound[i], peer);
                InboundAdmission::Displaced(dropped.id)
            }
            _ => InboundAdmission::Refused,
        }
    }

    pub fn remove_outbound(&mut self, id: PeerId) -> bool {
        let before = self.outbound.len();
        self.outbound.retain(|p| p.id != id);
        self.outbound.len() != before
    }

    pub fn remove_inbound(&mut self, id: PeerId) -> bool {
        let before = self.inbound.len();
        self.inbound.retain(|p| p.id != id);
        self.inbound.len() != before
    }

    /// Drop `id` from both lists. Returns whether it was a neighbor.
    pub fn remove(&mut self, id: PeerId) -> bool {
        let outbound = self.remove_outbound(id);
        let inbound = self.remove_inbound(id);
        outbound || inbound
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

enum QueryOutcome {
    Discarded(&'static str),
    Refused { keep_link: bool },
    Admitted(Option<Evicted>),
}

pub struct NeighborManager {
    me: PeerId,
    upload: u64,
    sets: Mutex<NeighborSets>,
    playback: Arc<PlaybackState>,
    coords: Arc<CoordinateStore>,
    close_peers: Arc<ClosePeerExplorer>,
    pool: Arc<LinkPool>,
    timeout: Duration,
    this: Weak<NeighborManager>,
}

impl NeighborManager {
    pub fn new(
        upload: u64,
        playback: Arc<PlaybackState>,
        coords: Arc<CoordinateStore>,
        close_peers: Arc<ClosePeerExplorer>,
        pool: Arc<LinkPool>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            me: pool.local_id(),
            upload,
            sets: Mutex::new(NeighborSets::new()),
            playback,
            coords,
            close_peers,
            pool,
            timeout,
            this: this.clone(),
        })
    }

    pub fn outbound(&self) -> Vec<PeerDescriptor> {
        self.sets.lock().outbound().to_vec()
    }

    pub fn inbound(&self) -> Vec<PeerDescriptor> {
        self.sets.lock().inbound().to_vec()
    }

    pub fn is_blacklisted(&self, id: PeerId) -> bool {
        self.sets.lock().is_blacklisted(id)
    }

    pub fn blacklisted(&self) -> usize {
        self.sets.lock().blacklisted()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }

    pub fn play(&self) {
        if !self.playback.set_playing(true) {
            tracing::info!("playback started");
        }
    }

    /// Stop playing and tell every neighbor.
    pub async fn pause(&self) {
        if self.playback.set_playing(false) {
            tracing::info!("playback paused");
        }
        let neighbors = self.sets.lock().all_ids();
        join_all(
            neighbors
                .into_iter()
                .map(|peer| self.leave(peer, NotificationType::Paused, None)),
        )
        .await;
    }

    /// Tell every neighbor we moved to `bitrate` and start over.
    pub async fn notify_bitrate_change(&self, bitrate: u64) {
        tracing::info!(bitrate, "video bitrate changed");
        let neighbors = self.sets.lock().all_ids();
        join_all(
            neighbors
                .into_iter()
                .map(|peer| self.leave(peer, NotificationType::BrChange, Some(bitrate))),
        )
        .await;
    }

    fn notification(&self, kind: NotificationType, bitrate: Option<u64>) -> Message {
        Message::Neighbor(NeighborMessage::Notification {
            notification_type: kind,
            sender: self.me,
            bitrate,
        })
    }

    /// Drop `peer` locally and send it `kind`.
    async fn leave(&self, peer: PeerId, kind: NotificationType, bitrate: Option<u64>) {
        match self.pool.connect(peer).await {
            Ok(link) => {
                self.sets.lock().remove(peer);
                if let Err(e) = link.send(&self.notification(kind, bitrate)) {
                    tracing::debug!(peer, error = %e, "notification not sent");
                }
            }
            Err(e) => self.forget(peer, e),
        }
    }

    /// Send a removal notice; the local lists were already updated.
    async fn notify_removal(&self, peer: PeerId, kind: NotificationType) {
        match self.pool.connect(peer).await {
            Ok(link) => {
                if let Err(e) = link.send(&self.notification(kind, None)) {
                    tracing::debug!(peer, error = %e, "notification not sent");
                }
            }
            Err(e) => self.forget(peer, e),
        }
    }

    fn spawn_removal(&self, peer: PeerId, kind: NotificationType) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move { this.notify_removal(peer, kind).await });
    }

    fn forget(&self, peer: PeerId, error: crate::error::OverlayError) {
        tracing::debug!(peer, error = %error, "neighbor unreachable, forgetting it");
        self.sets.lock().remove(peer);
        self.close_peers.remove(peer);
    }

    /// Our descriptor for `id`: the neighbor entry, the close-peer entry, or a
    /// new one that is also added to the close-peer set.
    fn descriptor_for(&self, id: PeerId, coord: Coordinate, upload: u64, bitrate: u64) -> PeerDescriptor {
        let known = self
            .sets
            .lock()
            .find(id)
            .cloned()
            .or_else(|| self.close_peers.get(id));
        let mut peer = match known {
            Some(peer) => peer,
            None => {
                let peer = PeerDescriptor::new(id).with_coord(coord).with_upload(upload);
                self.close_peers.ensure_known(peer.clone());
                peer
            }
        };
        peer.coord = coord;
        peer.bitrate = bitrate;
        if upload > 0 {
            peer.upload = upload;
        }
        peer.distance = self.coords.distance_to(&coord);
        peer
    }

    pub async fn next_cycle(&self) {
        let bitrate = self.playback.video_bitrate();
        if !self.is_playing() || bitrate == 0 {
            return;
        }
        let own = self.coords.coordinate();
        let close = self.close_peers.snapshot();
        let mut candidates = {
            let mut sets = self.sets.lock();
            sets.refresh_distances(&own);
            sets.candidates(&close)
        };

        while let Some(candidate) = candidates.pop() {
            if !self.is_playing() {
                break;
            }
            let admission = self.sets.lock().admission(&candidate);
            match admission {
                Admission::Free | Admission::Swap => self.query(candidate, bitrate).await,
                Admission::Skip => {
                    tracing::trace!(peer = candidate.id, "candidate too far for outbound");
                }
            }
        }
    }

    async fn query(&self, candidate: PeerDescriptor, bitrate: u64) {
        let id = candidate.id;
        self.sets.lock().begin_query(id);
        let Some((coord, upload, theirs, playing)) = self.exchange(id, bitrate).await else {
            self.sets.lock().end_query(id);
            return;
        };

        if theirs != bitrate || !playing || theirs == 0 {
            tracing::debug!(peer = id, bitrate = theirs, playing, "neighbor not eligible, blacklisting");
            let mut sets = self.sets.lock();
            sets.end_query(id);
            sets.blacklist(id);
            return;
        }
        let peer = (self.is_playing() && self.playback.video_bitrate() == bitrate)
            .then(|| self.descriptor_for(id, coord, upload, theirs));

        let outcome = {
            let mut sets = self.sets.lock();
            let refused = sets.end_query(id);
            match peer {
                None => QueryOutcome::Discarded("local playback changed during query"),
                Some(_) if sets.is_blacklisted(id) => QueryOutcome::Discarded("peer left during query"),
                Some(_) if refused => QueryOutcome::Refused {
                    keep_link: sets.contains_inbound(id),
                },
                Some(peer) => QueryOutcome::Admitted(sets.admit_outbound(peer)),
            }
        };

        match outcome {
            QueryOutcome::Discarded(why) => tracing::debug!(peer = id, why, "outbound admission discarded"),
            QueryOutcome::Refused { keep_link } => {
                tracing::debug!(peer = id, "peer has no inbound room for us");
                if !keep_link {
                    self.pool.close_peer(id);
                }
            }
            QueryOutcome::Admitted(evicted) => {
                tracing::info!(peer = id, "outbound neighbor added");
                if let Some(evicted) = evicted {
                    tracing::info!(peer = evicted.peer, "outbound neighbor evicted");
                    if evicted.inbound {
                        self.spawn_removal(evicted.peer, NotificationType::RemoveFromInbound);
                    } else {
                        self.pool.close_peer(evicted.peer);
                    }
                }
            }
        }
    }

    /// One REQUEST/RESPONSE round. Returns the peer's coordinate, upload,
    /// bitrate and playing flag.
    async fn exchange(&self, id: PeerId, bitrate: u64) -> Option<(Coordinate, u64, u64, bool)> {
        let link = match self.pool.connect(id).await {
            Ok(link) => link,
            Err(e) => {
                tracing::debug!(peer = id, error = %e, "neighbor connect failed");
                self.close_peers.remove(id);
                return None;
            }
        };
        let request = Message::Neighbor(NeighborMessage::Request {
            sender: self.me,
            timestamp: fresh_token(),
            bitrate,
            coord: self.coords.coordinate(),
            upload: self.upload,
        });
        match link.request(request, self.timeout).await {
            Ok(Message::Neighbor(NeighborMessage::Response {
                coord,
                upload,
                bitrate,
                playing,
                ..
            })) => Some((coord, upload, bitrate, playing)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(peer = id, error = %e, "neighbor query failed");
                None
            }
        }
    }

    fn answer(
        &self,
        sender: PeerId,
        timestamp: u64,
        bitrate: u64,
        coord: Coordinate,
        upload: u64,
    ) -> Message {
        let own_bitrate = self.playback.video_bitrate();
        let playing = self.is_playing();

        if bitrate == own_bitrate && self.sets.lock().unblacklist(sender) {
            tracing::debug!(peer = sender, "peer back on our bitrate, unblacklisted");
        }
        if bitrate == own_bitrate && playing {
            let peer = self.descriptor_for(sender, coord, upload, bitrate);
            let admitted = self.sets.lock().accept_inbound(peer);
            match admitted {
                InboundAdmission::Accepted => {
                    tracing::debug!(peer = sender, "inbound neighbor accepted");
                }
                InboundAdmission::Displaced(dropped) => {
                    tracing::info!(peer = sender, dropped, "inbound neighbor displaced");
                    self.spawn_removal(dropped, NotificationType::RemoveFromOutbound);
                }
                InboundAdmission::Refused => {
                    tracing::debug!(peer = sender, "inbound full, refusing");
                    self.spawn_removal(sender, NotificationType::RemoveFromOutbound);
                }
            }
        }

        Message::Neighbor(NeighborMessage::Response {
            sender: self.me,
            timestamp,
            playing,
            coord: self.coords.coordinate(),
            upload: self.upload,
            bitrate: own_bitrate,
        })
    }

    fn apply_notification(&self, link: &Link, sender: PeerId, kind: NotificationType) {
        match kind {
            NotificationType::Paused | NotificationType::BrChange => {
                tracing::debug!(peer = sender, ?kind, "neighbor left our stream");
                {
                    let mut sets = self.sets.lock();
                    sets.remove(sender);
                    sets.blacklist(sender);
                }
                self.pool.close(link);
            }
            NotificationType::RemoveFromInbound => {
                let keep = {
                    let mut sets = self.sets.lock();
                    sets.remove_inbound(sender);
                    sets.contains_outbound(sender)
                };
                if !keep {
                    self.pool.close_peer(sender);
                }
            }
            NotificationType::RemoveFromOutbound => {
                let keep = {
                    let mut sets = self.sets.lock();
                    sets.remove_outbound(sender);
                    sets.mark_refused(sender);
                    sets.contains_inbound(sender) || sets.is_querying(sender)
                };
                if !keep {
                    self.pool.close_peer(sender);
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => self.next_cycle().await,
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for NeighborManager {
    async fn handle_request(&self, _link: &Arc<Link>, msg: Message) -> Option<Message> {
        let Message::Neighbor(NeighborMessage::Request {
            sender,
            timestamp,
            bitrate,
            coord,
            upload,
        }) = msg
        else {
            return None;
        };
        Some(self.answer(sender, timestamp, bitrate, coord, upload))
    }

    async fn handle_notification(&self, link: &Arc<Link>, msg: Message) {
        if let Message::Neighbor(NeighborMessage::Notification {
            notification_type,
            sender,
            ..
        }) = msg
        {
            self.apply_notification(link, sender, notification_type);
        }
    }

    fn on_link_closed(&self, peer: PeerId) {
        if self.sets.lock().remove(peer) {
            tracing::debug!(peer, "neighbor link lost");
        }
    }
}
