//! Proxy configuration loaded from a JSON file.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_vnode_size() -> usize {
    160
}

fn default_flush_size() -> usize {
    1024 * 1024
}

fn default_flush_time() -> Duration {
    Duration::from_secs(1)
}

/// Top-level configuration. Config errors are fatal at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Ordered circle list; the replica count is its length.
    pub circles: Vec<CircleConfig>,
    /// Front-door bind address.
    pub listen_addr: String,
    /// Base directory for per-backend spool files.
    pub data_dir: PathBuf,
    /// Allowed databases; writes to others are rejected.
    pub db_list: Vec<String>,
    /// Ring replication factor.
    #[serde(default = "default_vnode_size")]
    pub vnode_size: usize,
    /// Byte threshold triggering a buffer flush.
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
    /// Interval between periodic flushes, e.g. "1s" or "500ms".
    #[serde(with = "humantime_serde", default = "default_flush_time")]
    pub flush_time: Duration,
    /// Per-source migration concurrency bound; 0 means 1.
    #[serde(default)]
    pub migrate_max_cpus: usize,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub https_enabled: bool,
    #[serde(default)]
    pub https_cert: String,
    #[serde(default)]
    pub https_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircleConfig {
    pub name: String,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
}

impl ProxyConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: ProxyConfig = serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Normalize defaults and reject inconsistent configs.
    pub fn validate(&mut self) -> Result<()> {
        if self.circles.is_empty() {
            return Err(Error::Config("circles must not be empty".to_string()));
        }
        if self.db_list.is_empty() {
            return Err(Error::Config("db_list must not be empty".to_string()));
        }
        if self.listen_addr.is_empty() {
            return Err(Error::Config("listen_addr must be set".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for circle in &self.circles {
            if circle.backends.is_empty() {
                return Err(Error::Config(format!(
                    "circle {} has no backends",
                    circle.name
                )));
            }
            for backend in &circle.backends {
                if backend.url.is_empty() {
                    return Err(Error::Config(format!(
                        "backend {} in circle {} has no url",
                        backend.name, circle.name
                    )));
                }
                if !seen.insert(backend.url.clone()) {
                    return Err(Error::Config(format!(
                        "backend url {} appears more than once",
                        backend.url
                    )));
                }
            }
        }
        if self.vnode_size == 0 {
            self.vnode_size = default_vnode_size();
        }
        if self.migrate_max_cpus == 0 {
            self.migrate_max_cpus = 1;
        }
        if self.flush_size == 0 {
            return Err(Error::Config("flush_size must be positive".to_string()));
        }
        if self.https_enabled && (self.https_cert.is_empty() || self.https_key.is_empty()) {
            return Err(Error::Config(
                "https_enabled requires https_cert and https_key".to_string(),
            ));
        }
        Ok(())
    }
}
