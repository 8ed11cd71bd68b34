//! One remote database endpoint.
//!
//! A backend owns its health flag, a per-database in-memory buffer, an
//! on-disk spool shared across databases, and three perpetual workers:
//! a liveness probe, a periodic buffer flush, and a spool drain. Writers
//! only ever touch the buffer lock; network failures degrade to the spool
//! and are never surfaced to the writer.

mod buffer;
mod spool;

pub use buffer::DbBuffer;
pub use spool::{decode_record, encode_record, Spool, SpoolRecord};

use crate::line::Precision;
use crate::{Error, Result};

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MIGRATE_CHUNK_SIZE: usize = 10_000;

/// Decoded body of an InfluxDB `/query` response.
#[derive(Debug, Deserialize)]
pub struct QueryResults {
    #[serde(default)]
    pub results: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Series {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

/// One remote database endpoint, identified by its URL (also its ring token).
pub struct Backend {
    pub name: String,
    pub url: String,
    client: reqwest::Client,
    active: AtomicBool,
    /// Keys are exactly the configured databases; populated at init, never
    /// resized.
    buffers: HashMap<String, RwLock<DbBuffer>>,
    spool: Mutex<Spool>,
}

impl Backend {
    pub fn new(name: &str, url: &str, db_list: &[String], data_dir: &Path) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let buffers = db_list
            .iter()
            .map(|db| (db.clone(), RwLock::new(DbBuffer::new())))
            .collect();
        let spool_path = data_dir.join(format!("{}.dat", url_slug(url)));
        Ok(Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            client,
            active: AtomicBool::new(true),
            buffers,
            spool: Mutex::new(Spool::new(spool_path)),
        })
    }

    /// Last observed health.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Append a canonicalized line to the (backend, db) buffer. When the
    /// buffer crosses `flush_size` the batch is swapped out and sent from a
    /// spawned task, so the caller never blocks on the network.
    pub async fn enqueue(self: &Arc<Self>, db: &str, line: &[u8], flush_size: usize) -> Result<()> {
        let buffer = self
            .buffers
            .get(db)
            .ok_or_else(|| Error::DatabaseNotAllowed(db.to_string()))?;
        let batch = {
            let mut guard = buffer.write().await;
            guard.append(line);
            if guard.size_bytes() >= flush_size {
                Some(guard.take().0)
            } else {
                None
            }
        };
        if let Some(bytes) = batch {
            let backend = Arc::clone(self);
            let db = db.to_string();
            tokio::spawn(async move {
                backend.send_or_spool(&db, bytes.into()).await;
            });
        }
        Ok(())
    }

    /// Buffered byte length for one database. Test and observability hook.
    pub async fn buffered_bytes(&self, db: &str) -> usize {
        match self.buffers.get(db) {
            Some(buffer) => buffer.read().await.size_bytes(),
            None => 0,
        }
    }

    /// Size of the on-disk spool in bytes.
    pub async fn spool_size(&self) -> Result<u64> {
        self.spool.lock().await.size().await
    }

    /// Start the three perpetual workers. Called once at init.
    pub fn spawn_workers(self: &Arc<Self>, flush_time: Duration) {
        let probe = Arc::clone(self);
        tokio::spawn(async move { probe.probe_loop().await });
        let flush = Arc::clone(self);
        tokio::spawn(async move { flush.flush_loop(flush_time).await });
        let drain = Arc::clone(self);
        tokio::spawn(async move { drain.drain_loop(flush_time).await });
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let healthy = self.ping().await;
            let was = self.active.swap(healthy, Ordering::AcqRel);
            if was != healthy {
                info!(url = %self.url, healthy, "backend health changed");
            }
        }
    }

    async fn flush_loop(self: Arc<Self>, flush_time: Duration) {
        let mut interval = tokio::time::interval(flush_time);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for (db, buffer) in &self.buffers {
                let batch = {
                    let mut guard = buffer.write().await;
                    if guard.is_empty() {
                        None
                    } else {
                        Some(guard.take().0)
                    }
                };
                if let Some(bytes) = batch {
                    self.send_or_spool(db, bytes.into()).await;
                }
            }
        }
    }

    async fn drain_loop(self: Arc<Self>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !self.is_active() {
                continue;
            }
            if let Err(e) = self.drain_spool_once().await {
                warn!(url = %self.url, error = %e, "spool drain pass failed");
            }
        }
    }

    /// Send one swapped-out batch; on failure, or while the backend is
    /// inactive, append it to the spool instead. A spool write failure drops
    /// the batch: that loss window is accepted and logged.
    async fn send_or_spool(&self, db: &str, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        if self.is_active() {
            match self.write_lines(db, payload.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(url = %self.url, db, error = %e, "flush failed, spooling batch");
                }
            }
        }
        let record = SpoolRecord {
            precision: Precision::Ns,
            db: db.to_string(),
            payload,
        };
        let spool = self.spool.lock().await;
        if let Err(e) = spool.append(&record).await {
            tracing::error!(url = %self.url, db, error = %e, "spool write failed, dropping batch");
        }
    }

    /// Replay spooled records FIFO. The pass stops at the first failure and
    /// retries next tick; consumed records are dropped from the file.
    async fn drain_spool_once(&self) -> Result<()> {
        let spool = self.spool.lock().await;
        let records = spool.read_all().await?;
        if records.is_empty() {
            // A file holding nothing but a torn tail still has a size.
            if spool.size().await? > 0 {
                spool.truncate().await?;
            }
            return Ok(());
        }
        let mut sent = 0;
        for record in &records {
            match self.write_lines(&record.db, record.payload.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(url = %self.url, db = %record.db, error = %e, "spool replay failed");
                    break;
                }
            }
        }
        if sent == records.len() {
            debug!(url = %self.url, records = sent, "spool drained");
            spool.truncate().await?;
        } else if sent > 0 {
            spool.rewrite(&records[sent..]).await?;
        }
        Ok(())
    }

    /// Probe the health endpoint. A single failure flips inactive, a single
    /// success flips active.
    pub async fn ping(&self) -> bool {
        match self.client.get(format!("{}/ping", self.url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// POST a batch of line-protocol writes.
    pub async fn write_lines(&self, db: &str, body: Bytes) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/write", self.url))
            .query(&[("db", db)])
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::BackendStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// List the measurements in one database, via the backend's catalog.
    pub async fn get_measurements(&self, db: &str) -> Result<Vec<String>> {
        let body = self.run_query(db, "show measurements").await?;
        let mut measurements = Vec::new();
        for result in body.results {
            if let Some(err) = result.error {
                return Err(Error::Internal(format!(
                    "show measurements on {}: {err}",
                    self.url
                )));
            }
            for series in result.series {
                for row in series.values {
                    if let Some(serde_json::Value::String(name)) = row.into_iter().next() {
                        measurements.push(name);
                    }
                }
            }
        }
        Ok(measurements)
    }

    /// Drop one measurement from one database.
    pub async fn drop_measurement(&self, db: &str, measurement: &str) -> Result<()> {
        let q = format!("drop measurement \"{}\"", measurement.replace('"', "\\\""));
        let body = self.run_query(db, &q).await?;
        for result in body.results {
            if let Some(err) = result.error {
                return Err(Error::Internal(format!(
                    "drop measurement on {}: {err}",
                    self.url
                )));
            }
        }
        Ok(())
    }

    /// Run a statement and decode the JSON body.
    async fn run_query(&self, db: &str, q: &str) -> Result<QueryResults> {
        let resp = self
            .client
            .post(format!("{}/query", self.url))
            .query(&[("db", db), ("q", q)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::BackendStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(resp.json().await?)
    }

    /// Forward a raw query for the HTTP front door, passing the backend's
    /// status and body through unchanged.
    pub async fn forward_query(&self, db: &str, q: &str) -> Result<(u16, Bytes)> {
        let resp = self
            .client
            .post(format!("{}/query", self.url))
            .query(&[("db", db), ("q", q)])
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        Ok((status, body))
    }

    /// Select a measurement's points in chunked form for migration.
    /// `last_seconds == 0` selects all time.
    pub async fn read_measurement(
        &self,
        db: &str,
        measurement: &str,
        last_seconds: u64,
    ) -> Result<ChunkStream> {
        let escaped = measurement.replace('"', "\\\"");
        let q = if last_seconds > 0 {
            format!("select * from \"{escaped}\" where time >= now() - {last_seconds}s group by *")
        } else {
            format!("select * from \"{escaped}\" group by *")
        };
        let chunk_size = MIGRATE_CHUNK_SIZE.to_string();
        let resp = self
            .client
            .post(format!("{}/query", self.url))
            .query(&[
                ("db", db),
                ("q", q.as_str()),
                ("epoch", "ns"),
                ("chunked", "true"),
                ("chunk_size", chunk_size.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::BackendStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(ChunkStream::new(resp))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Incremental reader over a chunked `/query` response: one JSON document
/// per line, one document per chunk.
pub struct ChunkStream {
    stream: Pin<Box<dyn futures::Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buf: Vec<u8>,
    done: bool,
}

impl ChunkStream {
    fn new(resp: reqwest::Response) -> Self {
        Self {
            stream: Box::pin(resp.bytes_stream()),
            buf: Vec::new(),
            done: false,
        }
    }

    /// Next decoded chunk, or `None` at end of response.
    pub async fn next_chunk(&mut self) -> Result<Option<QueryResults>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(line)?));
            }
            if self.done {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let doc = serde_json::from_slice(&self.buf)?;
                self.buf.clear();
                return Ok(Some(doc));
            }
            match self.stream.next().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk?),
                None => self.done = true,
            }
        }
    }
}

fn url_slug(url: &str) -> String {
    url.trim_end_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
