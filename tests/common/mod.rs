//! Shared harness: in-process mock backends speaking just enough of the
//! InfluxDB v1 HTTP API for the proxy to exercise its write, drain and
//! migration paths against real sockets.
#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ringleader::config::ProxyConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct MockState {
    /// db -> measurement names served by `show measurements`.
    pub measurements: Arc<Mutex<HashMap<String, Vec<String>>>>,
    /// Recorded `(db, body)` pairs from `/write`.
    pub writes: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockState {
    pub fn with_measurements(db: &str, names: &[&str]) -> Self {
        let state = Self::default();
        state.measurements.lock().unwrap().insert(
            db.to_string(),
            names.iter().map(|s| s.to_string()).collect(),
        );
        state
    }

    pub fn write_bodies(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

pub struct MockBackend {
    pub url: String,
    pub state: MockState,
}

/// Spawn a mock backend on an ephemeral port.
pub async fn spawn_backend(state: MockState) -> MockBackend {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    serve_backend(listener, state.clone());
    MockBackend {
        url: format!("http://{addr}"),
        state,
    }
}

/// Spawn a mock backend on a specific address, e.g. to bring a previously
/// dead backend back up.
pub async fn spawn_backend_at(addr: SocketAddr, state: MockState) -> MockBackend {
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    serve_backend(listener, state.clone());
    MockBackend {
        url: format!("http://{addr}"),
        state,
    }
}

fn serve_backend(listener: tokio::net::TcpListener, state: MockState) {
    let app = Router::new()
        .route("/ping", get(|| async { StatusCode::NO_CONTENT }))
        .route("/write", post(record_write))
        .route("/query", get(handle_query).post(handle_query))
        .with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

async fn record_write(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let db = params.get("db").cloned().unwrap_or_default();
    state
        .writes
        .lock()
        .unwrap()
        .push((db, String::from_utf8_lossy(&body).into_owned()));
    StatusCode::NO_CONTENT
}

async fn handle_query(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let q = params.get("q").cloned().unwrap_or_default();
    let lowered = q.to_lowercase();
    if lowered.starts_with("show measurements") {
        let db = params.get("db").cloned().unwrap_or_default();
        let names = state
            .measurements
            .lock()
            .unwrap()
            .get(&db)
            .cloned()
            .unwrap_or_default();
        let values: Vec<Vec<String>> = names.into_iter().map(|n| vec![n]).collect();
        return Json(serde_json::json!({
            "results": [{"series": [{
                "name": "measurements",
                "columns": ["name"],
                "values": values
            }]}]
        }))
        .into_response();
    }
    if lowered.starts_with("select") {
        // One point per measurement is enough to observe migration traffic.
        let measurement = q
            .split('"')
            .nth(1)
            .unwrap_or("unknown")
            .to_string();
        return Json(serde_json::json!({
            "results": [{"series": [{
                "name": measurement,
                "tags": {"host": "h1"},
                "columns": ["time", "value"],
                "values": [[1_000_000_000i64, 1.0]]
            }]}]
        }))
        .into_response();
    }
    Json(serde_json::json!({"results": [{}]})).into_response()
}

/// A config over the given circles, each entry being that circle's backend
/// URLs.
pub fn proxy_config(
    data_dir: &std::path::Path,
    circle_urls: &[Vec<String>],
    flush_size: usize,
    flush_time: Duration,
) -> ProxyConfig {
    let mut config: ProxyConfig = serde_json::from_value(serde_json::json!({
        "circles": circle_urls
            .iter()
            .enumerate()
            .map(|(i, urls)| serde_json::json!({
                "name": format!("circle-{i}"),
                "backends": urls
                    .iter()
                    .enumerate()
                    .map(|(j, url)| serde_json::json!({"name": format!("b{i}{j}"), "url": url}))
                    .collect::<Vec<_>>()
            }))
            .collect::<Vec<_>>(),
        "listen_addr": "127.0.0.1:7076",
        "data_dir": data_dir,
        "db_list": ["metrics"],
        "vnode_size": 160
    }))
    .unwrap();
    config.flush_size = flush_size;
    config.flush_time = flush_time;
    config.validate().unwrap();
    config
}
