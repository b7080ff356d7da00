//! Fetch telemetry: where segments came from and why peers had nothing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use shoal_core::wire::NoDataReason;

use crate::error::ServerReason;

pub trait Telemetry: Send + Sync {
    fn report_from_server(&self, reason: ServerReason);
    fn report_from_peer(&self);
    fn report_no_data(&self, reason: NoDataReason);
}

/// In-process counters.
#[derive(Default)]
pub struct FetchStats {
    from_peer: AtomicU64,
    from_server: DashMap<ServerReason, u64>,
    no_data: DashMap<NoDataReason, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchSnapshot {
    pub from_peer: u64,
    pub from_server: BTreeMap<String, u64>,
    pub no_data: BTreeMap<String, u64>,
}

impl FetchSnapshot {
    pub fn total_from_server(&self) -> u64 {
        self.from_server.values().sum()
    }
}

impl FetchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_peer(&self) -> u64 {
        self.from_peer.load(Ordering::Relaxed)
    }

    pub fn from_server(&self, reason: ServerReason) -> u64 {
        self.from_server.get(&reason).map(|c| *c).unwrap_or(0)
    }

    pub fn no_data(&self, reason: NoDataReason) -> u64 {
        self.no_data.get(&reason).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> FetchSnapshot {
        FetchSnapshot {
            from_peer: self.from_peer(),
            from_server: self
                .from_server
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
            no_data: self
                .no_data
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
        }
    }

    pub fn reset(&self) {
        self.from_peer.store(0, Ordering::Relaxed);
        self.from_server.clear();
        self.no_data.clear();
    }

    pub fn log_stats(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            from_peer = snapshot.from_peer,
            from_server = snapshot.total_from_server(),
            server_reasons = ?snapshot.from_server,
            no_data = ?snapshot.no_data,
            "fetch stats"
        );
    }
}

impl Telemetry for FetchStats {
    fn report_from_server(&self, reason: ServerReason) {
        *self.from_server.entry(reason).or_default() += 1;
    }

    fn report_from_peer(&self) {
        self.from_peer.fetch_add(1, Ordering::Relaxed);
    }

    fn report_no_data(&self, reason: NoDataReason) {
        *self.no_data.entry(reason).or_default() += 1;
    }
}
