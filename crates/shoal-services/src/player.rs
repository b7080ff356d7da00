//! The local media player and bandwidth measurement, as seen by the overlay.

use async_trait::async_trait;

/// Read-only view of the player driving segment requests.
pub trait MediaPlayer: Send + Sync {
    /// Playback position in seconds.
    fn current_time(&self) -> f64;
    fn is_paused(&self) -> bool;
    /// Declared bitrate of a representation in bits per second.
    fn bandwidth_for_representation(&self, rep_id: &str) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    pub upload_bps: u64,
    pub download_bps: u64,
}

/// One-shot capacity measurement run when a node starts.
#[async_trait]
pub trait BandwidthProbe: Send + Sync {
    async fn measure(&self) -> anyhow::Result<Bandwidth>;
}

/// Probe reporting fixed, configured capacities.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub Bandwidth);

impl StaticProbe {
    pub fn symmetric(bps: u64) -> Self {
        Self(Bandwidth {
            upload_bps: bps,
            download_bps: bps,
        })
    }
}

#[async_trait]
impl BandwidthProbe for StaticProbe {
    async fn measure(&self) -> anyhow::Result<Bandwidth> {
        Ok(self.0)
    }
}
