//! Coordinate store and the Vivaldi probe protocol.
//!
//! Each probe measures one round trip to a connected peer and nudges the
//! local coordinate so that coordinate distance tracks measured RTT. The
//! uncertainty weighs how far a single sample may move us.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use shoal_core::wire::{fresh_token, VivaldiMessage};
use shoal_core::{Coordinate, Message};

use crate::dispatch::ProtocolHandler;
use crate::error::OverlayError;
use crate::link::Link;
use crate::link_pool::LinkPool;
use crate::sampling::SamplingProtocol;

pub const UNCERTAINTY_FACTOR: f64 = 0.5;
pub const CORRECTION_FACTOR: f64 = 0.5;

/// Measured RTTs below this are clamped to keep the relative error finite.
const MIN_RTT_MS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub coord: Coordinate,
    pub uncertainty: f64,
}

impl Default for Estimate {
    fn default() -> Self {
        Self {
            coord: Coordinate::ORIGIN,
            uncertainty: 1.0,
        }
    }
}

impl Estimate {
    /// Fold one RTT sample against a peer's advertised estimate.
    pub fn observe(self, rtt_ms: f64, peer: Coordinate, peer_uncertainty: f64) -> Estimate {
        let rtt = rtt_ms.max(MIN_RTT_MS);
        let estimated = self.coord.distance(&peer);
        let error = rtt - estimated;
        let relative_error = error.abs() / rtt;

        let total = self.uncertainty + peer_uncertainty;
        let balance = if total > 0.0 { self.uncertainty / total } else { 0.5 };

        let uncertainty = relative_error * UNCERTAINTY_FACTOR * balance
            + self.uncertainty * (1.0 - UNCERTAINTY_FACTOR * balance);

        let mut force = self.coord.difference_vector(&peer);
        force.normalize();
        force.apply_error(error);
        let mut coord = self.coord;
        coord.apply_force_vector(&force, CORRECTION_FACTOR, balance);

        Estimate { coord, uncertainty }
    }
}

/// This node's coordinate and uncertainty.
#[derive(Debug, Default)]
pub struct CoordinateStore {
    state: Mutex<Estimate>,
}

impl CoordinateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn estimate(&self) -> Estimate {
        *self.state.lock()
    }

    pub fn coordinate(&self) -> Coordinate {
        self.state.lock().coord
    }

    pub fn uncertainty(&self) -> f64 {
        self.state.lock().uncertainty
    }

    /// Distance from this node to `other`.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        self.coordinate().distance(other)
    }

    pub fn observe(&self, rtt_ms: f64, peer: Coordinate, peer_uncertainty: f64) -> Estimate {
        let mut state = self.state.lock();
        *state = state.observe(rtt_ms, peer, peer_uncertainty);
        *state
    }
}

// ── Probe protocol ───────────────────────────────────────────────────────────

pub struct VivaldiProtocol {
    store: Arc<CoordinateStore>,
    sampling: Arc<SamplingProtocol>,
    timeout: Duration,
}

impl VivaldiProtocol {
    pub fn new(store: Arc<CoordinateStore>, sampling: Arc<SamplingProtocol>, timeout: Duration) -> Self {
        Self {
            store,
            sampling,
            timeout,
        }
    }

    /// Probe the peer behind `link` once. The caller decides what to do with
    /// the link on failure.
    pub async fn next_cycle(&self, link: &Link) -> Result<Estimate, OverlayError> {
        let started = Instant::now();
        let request = Message::Vivaldi(VivaldiMessage::Request {
            token: fresh_token(),
        });
        let Message::Vivaldi(VivaldiMessage::Response {
            coord, uncertainty, ..
        }) = link.request(request, self.timeout).await?
        else {
            return Err(OverlayError::UnexpectedResponse);
        };
        let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
        let updated = self.store.observe(rtt_ms, coord, uncertainty);
        self.sampling.set_coordinate(link.peer(), coord);
        tracing::trace!(
            peer = link.peer(),
            rtt_ms,
            x = updated.coord.x,
            y = updated.coord.y,
            uncertainty = updated.uncertainty,
            "vivaldi probe"
        );
        Ok(updated)
    }

    /// Probe a random pooled link every `period`. Failures leave the link alone.
    pub async fn run(self: Arc<Self>, pool: Arc<LinkPool>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    let Some(link) = pool.random_link() else { continue };
                    if let Err(e) = self.next_cycle(&link).await {
                        tracing::debug!(peer = link.peer(), error = %e, "pooled vivaldi probe failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for VivaldiProtocol {
    async fn handle_request(&self, _link: &Arc<Link>, msg: Message) -> Option<Message> {
        let Message::Vivaldi(VivaldiMessage::Request { token }) = msg else {
            return None;
        };
        let Estimate { coord, uncertainty } = self.store.estimate();
        Some(Message::Vivaldi(VivaldiMessage::Response {
            token,
            coord,
            uncertainty,
        }))
    }
}
