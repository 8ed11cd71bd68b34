//! # Ringleader
//!
//! A sharding and replication proxy for InfluxDB-compatible time-series
//! backends.
//!
//! Ringleader sits between writers/readers and a fleet of database instances.
//! Writes are partitioned by their `db,measurement` routing key across the
//! backends of a circle using consistent hashing, and replicated across
//! multiple independent circles so that each circle holds a full copy of the
//! data with its own placement.
//!
//! ## Key Features
//!
//! - **Deterministic placement**: a fixed 64-bit hash over virtual nodes, so
//!   two proxies with identical configs route identically
//! - **Durable buffering**: per-(backend, database) in-memory buffers that
//!   degrade to an on-disk spool when a backend is unreachable, drained
//!   asynchronously once it recovers
//! - **Data movement**: rebalance, recovery and resync workflows with bounded
//!   per-source parallelism
//!
//! ## Architecture
//!
//! - **Backend**: one remote database endpoint with health probing, buffered
//!   writes and a crash-safe spool
//! - **Circle**: a hash ring over a set of backends, one full replica
//! - **Proxy**: the top-level coordinator owning the circles, the write path
//!   and the migration control plane

pub mod admission;
pub mod api;
pub mod backend;
pub mod circle;
pub mod config;
pub mod line;
pub mod migrate;
pub mod proxy;
pub mod ring;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::circle::Circle;
    pub use crate::config::{BackendConfig, CircleConfig, ProxyConfig};
    pub use crate::line::Precision;
    pub use crate::proxy::Proxy;
    pub use crate::{Error, Result};
}
