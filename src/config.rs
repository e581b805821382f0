// src/config.rs

//! Loads and holds the daemon's YAML configuration (§6), with SIGHUP reload
//! via an atomic pointer swap so readers never observe a torn config (§5).

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Recognized output modes for the request pipeline (C10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Auto,
    Json,
    Redirect,
}

/// Which content hashes the source scanner (C5) should maintain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashesConfig {
    #[serde(default)]
    pub sha1: bool,
    #[serde(default = "default_true")]
    pub sha256: bool,
    #[serde(default)]
    pub md5: bool,
    #[serde(default)]
    pub sha3_512: bool,
}

impl Default for HashesConfig {
    fn default() -> Self {
        Self {
            sha1: false,
            sha256: true,
            md5: false,
            sha3_512: false,
        }
    }
}

/// A configured fallback mirror, used when no eligible mirror carries a
/// requested file (§4.8 "Absent-file fallback").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackMirror {
    pub url: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub continent_code: String,
}

fn default_true() -> bool {
    true
}
fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_listen_address() -> String {
    "127.0.0.1:9091".to_string()
}
fn default_redis_address() -> String {
    "127.0.0.1:6379".to_string()
}
fn default_redis_db() -> i64 {
    0
}
fn default_concurrent_sync() -> usize {
    4
}
fn default_scan_interval_minutes() -> u64 {
    30
}
fn default_check_interval_seconds() -> u64 {
    60
}
fn default_repository_scan_interval_minutes() -> u64 {
    60
}
fn default_max_link_headers() -> usize {
    5
}
fn default_weight_distribution_range() -> f64 {
    1.5
}
fn default_trace_file() -> String {
    "trace".to_string()
}
fn default_rpc_listen_address() -> String {
    "127.0.0.1:3390".to_string()
}
fn default_timezone_tolerance_seconds() -> i64 {
    300
}
fn default_stale_sync_hours() -> i64 {
    24
}

/// The full daemon configuration, deserialized from YAML (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub repository: PathBuf,
    #[serde(default)]
    pub templates: Option<PathBuf>,
    #[serde(default)]
    pub local_js_path: Option<PathBuf>,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_metrics_listen_address")]
    pub metrics_listen_address: String,
    #[serde(default)]
    pub gzip: bool,
    #[serde(default)]
    pub same_download_interval: u64,

    #[serde(default = "default_redis_address")]
    pub redis_address: String,
    #[serde(default)]
    pub redis_password: Option<String>,
    #[serde(default = "default_redis_db")]
    pub redis_db: i64,
    #[serde(default)]
    pub redis_sentinels: Vec<String>,
    #[serde(default)]
    pub redis_sentinel_master: Option<String>,

    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_trace_file")]
    pub trace_file_location: String,
    pub geoip_database_path: PathBuf,
    pub geoip_asn_database_path: PathBuf,

    #[serde(default = "default_concurrent_sync")]
    pub concurrent_sync: usize,
    #[serde(default = "default_scan_interval_minutes")]
    pub scan_interval_minutes: u64,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_repository_scan_interval_minutes")]
    pub repository_scan_interval_minutes: u64,
    #[serde(default = "default_max_link_headers")]
    pub max_link_headers: usize,

    #[serde(default)]
    pub fix_timezone_offsets: bool,
    #[serde(default = "default_timezone_tolerance_seconds")]
    pub timezone_tolerance_seconds: i64,
    #[serde(default = "default_stale_sync_hours")]
    pub stale_sync_hours: i64,
    #[serde(default)]
    pub dummy_scan_mode: bool,
    #[serde(default)]
    pub hashes: HashesConfig,
    #[serde(default)]
    pub disallow_redirects: bool,
    #[serde(default = "default_weight_distribution_range")]
    pub weight_distribution_range: f64,
    #[serde(default)]
    pub disable_on_missing_file: bool,
    #[serde(default)]
    pub fallbacks: Vec<FallbackMirror>,

    #[serde(default = "default_rpc_listen_address")]
    pub rpc_listen_address: String,
    #[serde(default)]
    pub rpc_password: Option<String>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        if config.weight_distribution_range <= 0.0 {
            anyhow::bail!("WeightDistributionRange must be > 0");
        }
        Ok(config)
    }
}

/// Holds the live configuration behind an atomic swap, so a SIGHUP reload
/// never exposes readers to a partially-updated struct (§5, §9 design note:
/// "publish-then-swap" discipline, passed explicitly rather than through
/// process-wide global state).
#[derive(Debug)]
pub struct ConfigHandle {
    path: PathBuf,
    current: ArcSwap<Config>,
}

impl ConfigHandle {
    pub fn load(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let config = Config::from_file(&path)?;
        Ok(Arc::new(Self {
            path,
            current: ArcSwap::new(Arc::new(config)),
        }))
    }

    pub fn get(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Reloads the configuration from disk, publishing the new value only
    /// after it has been fully parsed and validated.
    pub fn reload(&self) -> Result<()> {
        let fresh = Config::from_file(&self.path)?;
        self.current.store(Arc::new(fresh));
        info!(path = %self.path.display(), "configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_weight_distribution_range() {
        let yaml = r#"
repository: /srv/repo
geoip_database_path: /srv/geo/city.mmdb
geoip_asn_database_path: /srv/geo/asn.mmdb
weight_distribution_range: 0
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn applies_defaults() {
        let yaml = r#"
repository: /srv/repo
geoip_database_path: /srv/geo/city.mmdb
geoip_asn_database_path: /srv/geo/asn.mmdb
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.concurrent_sync, 4);
        assert_eq!(config.max_link_headers, 5);
        assert!(config.hashes.sha256);
    }
}
