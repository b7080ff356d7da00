//! Simulated origin server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

pub struct Origin {
    latency: Duration,
    segment_bytes: usize,
    served: AtomicU64,
}

impl Origin {
    pub fn new(latency: Duration, segment_bytes: usize) -> Self {
        Self {
            latency,
            segment_bytes,
            served: AtomicU64::new(0),
        }
    }

    /// Download a segment. The payload is the URL repeated to the segment size,
    /// so any copy can be checked against its name.
    pub async fn get(&self, url: &str) -> Bytes {
        tokio::time::sleep(self.latency).await;
        self.served.fetch_add(1, Ordering::Relaxed);
        Bytes::from(payload(url, self.segment_bytes))
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

pub fn payload(url: &str, len: usize) -> Vec<u8> {
    url.as_bytes().iter().copied().cycle().take(len).collect()
}
