//! Configuration system for Shoal.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SHOAL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/shoal/config.toml
//!   3. ~/.config/shoal/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoalConfig {
    pub overlay: OverlayConfig,
    pub segments: SegmentConfig,
    pub node: NodeConfig,
    pub simulation: SimulationConfig,
}

/// Timers and round-trip deadlines of the overlay protocols.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Peer assistance on/off. When off every fetch goes to the server.
    pub enabled: bool,
    pub connect_timeout_ms: u64,
    /// Deadline for CYCLON, VIVALDI and CLOSEPEER round trips.
    pub request_timeout_ms: u64,
    pub neighbor_request_timeout_ms: u64,
    /// Shuffle + probe cycle over a short-lived maintenance channel.
    pub overlay_interval_ms: u64,
    /// Coordinate probe over a random pooled channel.
    pub vivaldi_interval_ms: u64,
    pub close_peer_interval_ms: u64,
    pub sampling_refresh_interval_ms: u64,
    pub neighbor_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Segments per stream type fetched from the server before peers are asked.
    pub init_count: u32,
    /// Upper bound on the wait before the first peer request, in seconds.
    pub max_wait_secs: f64,
    pub cache_ttl_secs: u64,
    pub cache_sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Declared upload capacity used when the bandwidth probe fails. Bits/s.
    pub upload_bps: u64,
}

/// Local swarm run by `shoald`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub peers: usize,
    /// Status API port. 0 = disabled.
    pub api_port: u16,
    pub segment_duration_secs: f64,
    /// Video representation ladder in bits/s.
    pub bitrates: Vec<u64>,
    pub audio_bitrate: u64,
    pub segment_bytes: usize,
    pub origin_latency_ms: u64,
    /// Nodes are scattered over a square of this side; distance is link latency in ms.
    pub max_link_latency_ms: u64,
    pub stats_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_timeout_ms: 2000,
            request_timeout_ms: 3000,
            neighbor_request_timeout_ms: 1000,
            overlay_interval_ms: 1111,
            vivaldi_interval_ms: 888,
            close_peer_interval_ms: 3888,
            sampling_refresh_interval_ms: 1222,
            neighbor_interval_ms: 1555,
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            init_count: 4,
            max_wait_secs: 6.0,
            cache_ttl_secs: 60,
            cache_sweep_interval_ms: 1000,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            upload_bps: 5_000_000,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            peers: 24,
            api_port: 9180,
            segment_duration_secs: 2.0,
            bitrates: vec![400_000, 1_000_000, 2_500_000],
            audio_bitrate: 128_000,
            segment_bytes: 16 * 1024,
            origin_latency_ms: 120,
            max_link_latency_ms: 80,
            stats_interval_secs: 10,
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl OverlayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn neighbor_request_timeout(&self) -> Duration {
        Duration::from_millis(self.neighbor_request_timeout_ms)
    }
}

impl SegmentConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("shoal")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ShoalConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ShoalConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SHOAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ShoalConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SHOAL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SHOAL_OVERLAY__ENABLED") {
            self.overlay.enabled = v == "true" || v == "1";
        }
        if let Some(v) = var("SHOAL_NODE__UPLOAD_BPS") {
            if let Ok(n) = v.parse() {
                self.node.upload_bps = n;
            }
        }
        if let Some(v) = var("SHOAL_SIMULATION__PEERS") {
            if let Ok(n) = v.parse() {
                self.simulation.peers = n;
            }
        }
        if let Some(v) = var("SHOAL_SIMULATION__API_PORT") {
            if let Ok(p) = v.parse() {
                self.simulation.api_port = p;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timers() {
        let config = ShoalConfig::default();
        assert!(config.overlay.enabled);
        assert_eq!(config.overlay.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.overlay.neighbor_interval_ms, 1555);
        assert_eq!(config.segments.init_count, 4);
        assert_eq!(config.segments.cache_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = ShoalConfig::from_toml(
            r#"
            [overlay]
            enabled = false

            [simulation]
            peers = 3
            "#,
        )
        .unwrap();
        assert!(!config.overlay.enabled);
        assert_eq!(config.overlay.request_timeout_ms, 3000);
        assert_eq!(config.simulation.peers, 3);
        assert_eq!(config.segments.max_wait_secs, 6.0);
    }

    #[test]
    fn overrides_parse_and_ignore_garbage() {
        let mut config = ShoalConfig::default();
        config.apply_overrides(|key| match key {
            "SHOAL_OVERLAY__ENABLED" => Some("0".into()),
            "SHOAL_SIMULATION__PEERS" => Some("8".into()),
            "SHOAL_NODE__UPLOAD_BPS" => Some("lots".into()),
            _ => None,
        });
        assert!(!config.overlay.enabled);
        assert_eq!(config.simulation.peers, 8);
        assert_eq!(config.node.upload_bps, NodeConfig::default().upload_bps);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("shoal-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("SHOAL_CONFIG", config_path.to_str().unwrap());
        }

        let path = ShoalConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = ShoalConfig::load().expect("load should succeed");
        assert_eq!(config.overlay.overlay_interval_ms, 1111);

        unsafe {
            std::env::remove_var("SHOAL_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
