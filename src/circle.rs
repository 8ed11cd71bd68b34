//! A circle: one full replica of the dataset.
//!
//! Each circle owns a consistent-hash ring over its backends, an index from
//! URL to backend, a per-source migration semaphore, and a migrating flag
//! that external actors use to gate incompatible operations.

use crate::backend::{Backend, Series};
use crate::config::CircleConfig;
use crate::{Error, Result};

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

pub struct Circle {
    pub name: String,
    pub circle_num: usize,
    backends: Vec<Arc<Backend>>,
    url_to_backend: HashMap<String, Arc<Backend>>,
    ring: crate::ring::HashRing,
    /// Set for the duration of a migration workflow; readers never block
    /// each other.
    migrating: parking_lot::RwLock<bool>,
    /// One semaphore per source backend, bounding in-flight per-measurement
    /// migrations at `migrate_max_cpus`.
    migrate_limits: HashMap<String, Arc<Semaphore>>,
}

impl Circle {
    pub fn new(
        config: &CircleConfig,
        circle_num: usize,
        db_list: &[String],
        data_dir: &Path,
        vnode_size: usize,
        migrate_max_cpus: usize,
    ) -> Result<Self> {
        let mut ring = crate::ring::HashRing::new(vnode_size);
        let mut backends = Vec::with_capacity(config.backends.len());
        let mut url_to_backend = HashMap::new();
        let mut migrate_limits = HashMap::new();
        for bc in &config.backends {
            let backend = Arc::new(Backend::new(&bc.name, &bc.url, db_list, data_dir)?);
            ring.add(&backend.url);
            url_to_backend.insert(backend.url.clone(), Arc::clone(&backend));
            migrate_limits.insert(
                backend.url.clone(),
                Arc::new(Semaphore::new(migrate_max_cpus)),
            );
            backends.push(backend);
        }
        Ok(Self {
            name: config.name.clone(),
            circle_num,
            backends,
            url_to_backend,
            ring,
            migrating: parking_lot::RwLock::new(false),
            migrate_limits,
        })
    }

    /// Resolve the backend URL owning a routing key.
    pub fn route_url(&self, key: &str) -> Result<&str> {
        self.ring.get(key)
    }

    /// Resolve the backend owning a routing key.
    pub fn route(&self, key: &str) -> Result<Arc<Backend>> {
        let url = self.ring.get(key)?;
        self.backend_by_url(url)
    }

    pub fn backend_by_url(&self, url: &str) -> Result<Arc<Backend>> {
        self.url_to_backend
            .get(url)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(url.to_string()))
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// First backend currently reporting healthy, if any.
    pub fn first_active_backend(&self) -> Option<Arc<Backend>> {
        self.backends.iter().find(|b| b.is_active()).cloned()
    }

    pub fn set_migrating(&self, migrating: bool) {
        *self.migrating.write() = migrating;
    }

    pub fn is_migrating(&self) -> bool {
        *self.migrating.read()
    }

    /// The per-source migration semaphore for a backend of this circle.
    pub fn migrate_limit(&self, src_url: &str) -> Result<Arc<Semaphore>> {
        self.migrate_limits
            .get(src_url)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(src_url.to_string()))
    }

    /// Copy all points of (db, measurement) from `src` to every destination,
    /// bounded by `last_seconds` (0 = all time). The source is read in
    /// chunks; each chunk is written to every destination before the next is
    /// fetched, so a failure loses no more than one chunk of progress.
    /// Idempotency comes from the database's series+timestamp point
    /// identity; the proxy does not dedup.
    pub async fn migrate(
        &self,
        src: &Backend,
        dsts: &[Arc<Backend>],
        db: &str,
        measurement: &str,
        last_seconds: u64,
    ) -> Result<()> {
        let mut chunks = src.read_measurement(db, measurement, last_seconds).await?;
        while let Some(chunk) = chunks.next_chunk().await? {
            for result in &chunk.results {
                if let Some(err) = &result.error {
                    return Err(Error::Internal(format!(
                        "select from {} failed: {err}",
                        src.url
                    )));
                }
            }
            let lines = chunk
                .results
                .iter()
                .flat_map(|r| r.series.iter())
                .map(series_to_lines)
                .collect::<Vec<_>>()
                .concat();
            if lines.is_empty() {
                continue;
            }
            let body = Bytes::from(lines);
            for dst in dsts {
                dst.write_lines(db, body.clone()).await?;
            }
        }
        Ok(())
    }

    /// Run a cluster-scope statement on every backend of this circle,
    /// returning the last successful body.
    pub async fn query_cluster(&self, db: &str, q: &str) -> Result<(u16, Bytes)> {
        let mut last = None;
        for backend in &self.backends {
            match backend.forward_query(db, q).await {
                Ok(resp) => last = Some(resp),
                Err(e) => {
                    warn!(circle = %self.name, url = %backend.url, error = %e, "cluster query failed");
                    return Err(e);
                }
            }
        }
        last.ok_or_else(|| Error::Internal(format!("circle {} has no backends", self.name)))
    }
}

impl std::fmt::Debug for Circle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circle")
            .field("name", &self.name)
            .field("circle_num", &self.circle_num)
            .field("backends", &self.backends.len())
            .field("migrating", &self.is_migrating())
            .finish()
    }
}

/// Rebuild line protocol from one result series: measurement and tags from
/// the series header, fields from the non-time columns, timestamps from the
/// `time` column (integers, since migration queries use `epoch=ns`).
fn series_to_lines(series: &Series) -> Vec<u8> {
    let mut prefix = escape_measurement(&series.name);
    for (key, value) in &series.tags {
        if value.is_empty() {
            continue;
        }
        prefix.push(',');
        prefix.push_str(&escape_tag(key));
        prefix.push('=');
        prefix.push_str(&escape_tag(value));
    }

    let time_idx = series.columns.iter().position(|c| c == "time");
    let mut out = Vec::new();
    for row in &series.values {
        let Some(ts) = time_idx.and_then(|i| row.get(i)).and_then(|v| v.as_i64()) else {
            continue;
        };
        let mut fields = String::new();
        for (idx, column) in series.columns.iter().enumerate() {
            if Some(idx) == time_idx {
                continue;
            }
            let Some(value) = row.get(idx) else { continue };
            let Some(rendered) = render_field(value) else {
                continue;
            };
            if !fields.is_empty() {
                fields.push(',');
            }
            fields.push_str(&escape_tag(column));
            fields.push('=');
            fields.push_str(&rendered);
        }
        if fields.is_empty() {
            continue;
        }
        out.extend_from_slice(prefix.as_bytes());
        out.push(b' ');
        out.extend_from_slice(fields.as_bytes());
        out.push(b' ');
        out.extend_from_slice(ts.to_string().as_bytes());
        out.push(b'\n');
    }
    out
}

fn render_field(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => {
            Some(format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")))
        }
        _ => None,
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, CircleConfig};
    use tempfile::TempDir;

    fn test_circle(urls: &[&str]) -> (Circle, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = CircleConfig {
            name: "circle-a".to_string(),
            backends: urls
                .iter()
                .enumerate()
                .map(|(i, url)| BackendConfig {
                    name: format!("b{i}"),
                    url: url.to_string(),
                })
                .collect(),
        };
        let circle = Circle::new(
            &config,
            0,
            &["metrics".to_string()],
            dir.path(),
            160,
            1,
        )
        .unwrap();
        (circle, dir)
    }

    #[test]
    fn route_and_index_agree() {
        let (circle, _dir) = test_circle(&["http://b1:8086", "http://b2:8086"]);
        for i in 0..100 {
            let key = format!("metrics,m{i}");
            let url = circle.route_url(&key).unwrap().to_string();
            let backend = circle.route(&key).unwrap();
            assert_eq!(backend.url, url);
        }
    }

    #[test]
    fn migrating_flag_toggles() {
        let (circle, _dir) = test_circle(&["http://b1:8086"]);
        assert!(!circle.is_migrating());
        circle.set_migrating(true);
        assert!(circle.is_migrating());
        circle.set_migrating(false);
        assert!(!circle.is_migrating());
    }

    #[test]
    fn unknown_backend_url_is_an_error() {
        let (circle, _dir) = test_circle(&["http://b1:8086"]);
        assert!(matches!(
            circle.backend_by_url("http://nope:8086"),
            Err(Error::UnknownBackend(_))
        ));
    }

    #[test]
    fn series_lines_carry_tags_fields_and_time() {
        let series: Series = serde_json::from_value(serde_json::json!({
            "name": "cpu",
            "tags": {"host": "h1", "region": "us east"},
            "columns": ["time", "value", "status"],
            "values": [
                [1_000_000_000i64, 0.5, "ok"],
                [2_000_000_000i64, 1.5, null]
            ]
        }))
        .unwrap();
        let lines = series_to_lines(&series);
        let text = String::from_utf8(lines).unwrap();
        assert_eq!(
            text,
            "cpu,host=h1,region=us\\ east value=0.5,status=\"ok\" 1000000000\n\
             cpu,host=h1,region=us\\ east value=1.5 2000000000\n"
        );
    }

    #[test]
    fn rows_without_fields_or_time_are_skipped() {
        let series: Series = serde_json::from_value(serde_json::json!({
            "name": "cpu",
            "columns": ["time", "value"],
            "values": [[null, 1.0], [1_000_000_000i64, null]]
        }))
        .unwrap();
        assert!(series_to_lines(&series).is_empty());
    }
}
