//! Segments fetched by this node, kept for a while so neighbors can ask for them.

use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

pub struct SegmentCache {
    entries: DashMap<String, (Bytes, Instant)>,
    ttl: Duration,
}

impl SegmentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn put(&self, url: impl Into<String>, data: Bytes) {
        self.entries.insert(url.into(), (data, Instant::now()));
    }

    /// The segment stored under `url`, unless it has expired.
    pub fn get(&self, url: &str) -> Option<Bytes> {
        let entry = self.entries.get(url)?;
        let (data, stored) = entry.value();
        (stored.elapsed() < self.ttl).then(|| data.clone())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, stored)| stored.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }
}
