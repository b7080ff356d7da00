//! Responsibility coordinator.
//!
//! Decides which members of the local neighborhood (outbound neighbors plus
//! this node) should fetch a segment from the server. Membership is a pure
//! function of identities, the segment index and declared uploads, so
//! neighbors with similar views reach the same decision without talking.

use parking_lot::Mutex;
use rand::Rng;

use shoal_core::wire::StreamType;
use shoal_core::PeerId;

/// Largest responsibility factor tried is twice this.
pub const HIGHEST_RF: u64 = 16;

/// Identity and declared upload of one member of the neighborhood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub id: PeerId,
    pub upload: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsiblePeer {
    pub id: PeerId,
    pub upload: u64,
    pub super_peer: bool,
    /// Cumulative upload over the list, ascending.
    pub resp_value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub rf: u64,
    /// Responsible peers other than this node, ascending by upload.
    pub peers: Vec<ResponsiblePeer>,
    pub self_responsible: bool,
    pub responsible_upload: u64,
    pub required_upload: u64,
}

/// Compute responsibility for segment `index` among `neighbors` and `me`.
pub fn compute(me: Member, neighbors: &[Member], index: u64, summed_bitrate: u64) -> Assignment {
    let mut members = neighbors.to_vec();
    members.push(me);

    let count = members.len() as u64;
    let total: u64 = members.iter().map(|m| m.upload).sum();
    let super_peer_limit = 2.0 * total as f64 / count as f64;
    let required_upload = summed_bitrate.saturating_mul(count);
    let is_super = |m: &Member| m.upload as f64 >= super_peer_limit;

    let mut rf = HIGHEST_RF * 2;
    let (responsible, responsible_upload) = loop {
        rf /= 2;
        let responsible: Vec<Member> = members
            .iter()
            .filter(|m| m.id % rf == index % rf || is_super(m))
            .copied()
            .collect();
        let upload: u64 = responsible.iter().map(|m| m.upload).sum();
        if upload >= required_upload || rf == 1 {
            break (responsible, upload);
        }
    };

    let self_responsible = responsible.iter().any(|m| m.id == me.id);
    let mut peers: Vec<ResponsiblePeer> = responsible
        .into_iter()
        .filter(|m| m.id != me.id)
        .map(|m| ResponsiblePeer {
            id: m.id,
            upload: m.upload,
            super_peer: is_super(&m),
            resp_value: 0,
        })
        .collect();
    peers.sort_by_key(|p| p.upload);
    assign_weights(&mut peers);

    Assignment {
        rf,
        peers,
        self_responsible,
        responsible_upload,
        required_upload,
    }
}

/// Recompute cumulative weights in list order.
pub fn assign_weights(peers: &mut [ResponsiblePeer]) {
    let mut running = 0u64;
    for peer in peers {
        running = running.saturating_add(peer.upload);
        peer.resp_value = running;
    }
}

/// Remove and return a peer chosen with probability proportional to its
/// upload, then reweigh the rest.
pub fn pick_weighted<R: Rng + ?Sized>(peers: &mut Vec<ResponsiblePeer>, rng: &mut R) -> Option<ResponsiblePeer> {
    let total = peers.last()?.resp_value;
    let target = if total == 0 { 0 } else { rng.gen_range(0..total) };
    let index = peers
        .iter()
        .position(|p| target <= p.resp_value)
        .unwrap_or(0);
    let picked = peers.remove(index);
    assign_weights(peers);
    Some(picked)
}

/// Tracks the last requested bitrate per stream type so a request can be
/// sized for audio and video together.
pub struct ResponsibilityCoordinator {
    me: Member,
    last: Mutex<(u64, u64)>,
}

impl ResponsibilityCoordinator {
    pub fn new(me: PeerId, upload: u64) -> Self {
        Self {
            me: Member { id: me, upload },
            last: Mutex::new((0, 0)),
        }
    }

    pub fn calculate(
        &self,
        stream: StreamType,
        index: u64,
        bitrate: u64,
        neighbors: &[Member],
    ) -> Assignment {
        let summed = {
            let mut last = self.last.lock();
            match stream {
                StreamType::Video => {
                    last.0 = bitrate;
                    bitrate + last.1
                }
                StreamType::Audio => {
                    last.1 = bitrate;
                    bitrate + last.0
                }
            }
        };
        let assignment = compute(self.me, neighbors, index, summed);
        tracing::trace!(
            index,
            rf = assignment.rf,
            summed_bitrate = summed,
            responsible = assignment.peers.len(),
            self_responsible = assignment.self_responsible,
            "responsibility computed"
        );
        assignment
    }

    pub fn reset(&self) {
        *self.last.lock() = (0, 0);
    }
}
