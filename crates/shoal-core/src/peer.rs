//! Peer identity and descriptors exchanged between overlay components.

use serde::{Deserialize, Serialize};

use crate::coord::Coordinate;

/// Self-reported, unauthenticated peer identity.
pub type PeerId = u64;

/// What one node knows about another.
///
/// The sampling view, the close-peer set and the neighbor lists each keep
/// their own copies; they are reconciled by `id` when merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    #[serde(default)]
    pub coord: Coordinate,
    /// Cycles since this entry was created. Only meaningful in the sampling view.
    #[serde(default)]
    pub age: u32,
    /// Declared upload capacity in bits per second.
    #[serde(default)]
    pub upload: u64,
    /// Declared video bitrate in bits per second, 0 when unknown.
    #[serde(default)]
    pub bitrate: u64,
    /// Distance to the holder's own coordinate. Recomputed on every merge.
    #[serde(default)]
    pub distance: f64,
}

impl PeerDescriptor {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            coord: Coordinate::ORIGIN,
            age: 0,
            upload: 0,
            bitrate: 0,
            distance: 0.0,
        }
    }

    pub fn with_coord(mut self, coord: Coordinate) -> Self {
        self.coord = coord;
        self
    }

    pub fn with_upload(mut self, upload: u64) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_distance(mut self, distance: f64) -> Self {
        self.distance = distance;
        self
    }
}
