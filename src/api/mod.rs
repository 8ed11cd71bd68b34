//! HTTP front door.
//!
//! Exposes the write path, query dispatch behind the admission gate, and a
//! control plane that maps 1:1 onto the proxy's migration workflows.

use crate::config::ProxyConfig;
use crate::line::Precision;
use crate::migrate::Workflow;
use crate::proxy::Proxy;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub proxy: Arc<Proxy>,
    username: String,
    password: String,
}

/// Build the HTTP API router
pub fn build_router(proxy: Arc<Proxy>, config: &ProxyConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ping", get(ping))
        .route("/write", post(write))
        .route("/query", get(query).post(query))
        .route("/rebalance", post(rebalance))
        .route("/recovery", post(recovery))
        .route("/resync", post(resync))
        .route("/clear", post(clear))
        .route("/migrate/status", get(migrate_status))
        .route("/migrate/state", get(migrate_state))
        .with_state(ApiState {
            proxy,
            username: config.username.clone(),
            password: config.password.clone(),
        })
        .layer(cors)
}

async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// InfluxDB v1 credentials arrive as `u`/`p` query parameters.
fn authorized(state: &ApiState, params: &HashMap<String, String>) -> bool {
    if state.username.is_empty() {
        return true;
    }
    params.get("u").map(String::as_str) == Some(state.username.as_str())
        && params.get("p").map(String::as_str) == Some(state.password.as_str())
}

async fn write(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if !authorized(&state, &params) {
        return (StatusCode::UNAUTHORIZED, "unauthorized\n").into_response();
    }
    let Some(db) = params.get("db") else {
        return (StatusCode::BAD_REQUEST, "missing db parameter\n").into_response();
    };
    let precision = params
        .get("precision")
        .and_then(|p| Precision::parse(p));

    for line in body.split(|&b| b == b'\n') {
        let trimmed: &[u8] = {
            let start = line.iter().position(|b| !b.is_ascii_whitespace());
            match start {
                Some(s) => &line[s..],
                None => continue,
            }
        };
        if trimmed.is_empty() || trimmed[0] == b'#' {
            continue;
        }
        if let Err(e) = state.proxy.write_data(db, trimmed, precision).await {
            return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

fn measurement_from_query(q: &str) -> Option<String> {
    static FROM_RE: OnceLock<Regex> = OnceLock::new();
    let re = FROM_RE.get_or_init(|| {
        Regex::new(r#"(?i)\bfrom\s+(?:"([^"]+)"|([^\s;,]+))"#).expect("from pattern compiles")
    });
    let caps = re.captures(q)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

async fn query(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &params) {
        return (StatusCode::UNAUTHORIZED, "unauthorized\n").into_response();
    }
    let Some(q) = params.get("q") else {
        return (StatusCode::BAD_REQUEST, "missing q parameter\n").into_response();
    };
    let db = params.get("db").cloned().unwrap_or_default();
    let proxy = &state.proxy;

    if proxy.check_create_database_query(q) {
        // Create-database runs on every backend of every circle.
        let mut last = None;
        for circle in state.proxy.circles() {
            match circle.query_cluster(&db, q).await {
                Ok(resp) => last = Some(resp),
                Err(e) => {
                    error!(circle = circle.circle_num, error = %e, "create database failed");
                    return (StatusCode::BAD_GATEWAY, format!("{e}\n")).into_response();
                }
            }
        }
        return match last {
            Some((status, body)) => forwarded(status, body),
            None => StatusCode::BAD_GATEWAY.into_response(),
        };
    }

    if proxy.check_cluster_query(q) {
        // Cluster-scope reads are answered by any healthy backend.
        for circle in state.proxy.circles() {
            if let Some(backend) = circle.first_active_backend() {
                return match backend.forward_query(&db, q).await {
                    Ok((status, body)) => forwarded(status, body),
                    Err(e) => {
                        warn!(url = %backend.url, error = %e, "cluster query failed");
                        (StatusCode::BAD_GATEWAY, format!("{e}\n")).into_response()
                    }
                };
            }
        }
        return (StatusCode::BAD_GATEWAY, "no active backend\n").into_response();
    }

    if proxy.check_measurement_query(q) {
        let Some(measurement) = measurement_from_query(q) else {
            return (StatusCode::BAD_REQUEST, "cannot find measurement\n").into_response();
        };
        let key = format!("{db},{measurement}");
        for backend in state.proxy.backends_for_key(&key) {
            if !backend.is_active() {
                continue;
            }
            return match backend.forward_query(&db, q).await {
                Ok((status, body)) => forwarded(status, body),
                Err(e) => {
                    warn!(url = %backend.url, error = %e, "query forward failed");
                    (StatusCode::BAD_GATEWAY, format!("{e}\n")).into_response()
                }
            };
        }
        return (StatusCode::BAD_GATEWAY, "no active backend\n").into_response();
    }

    (StatusCode::FORBIDDEN, "query forbidden\n").into_response()
}

fn forwarded(status: u16, body: Bytes) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct RebalanceRequest {
    circle_num: usize,
    #[serde(default)]
    backend_urls: Vec<String>,
    #[serde(default)]
    dbs: Vec<String>,
}

async fn rebalance(
    State(state): State<ApiState>,
    Json(req): Json<RebalanceRequest>,
) -> Response {
    let proxy = Arc::clone(&state.proxy);
    tokio::spawn(async move {
        if let Err(e) = proxy
            .rebalance(req.circle_num, &req.backend_urls, req.dbs)
            .await
        {
            error!(circle = req.circle_num, error = %e, "rebalance failed");
        }
    });
    (StatusCode::ACCEPTED, "rebalance started\n").into_response()
}

#[derive(Debug, Deserialize)]
struct RecoveryRequest {
    from_circle_num: usize,
    to_circle_num: usize,
    #[serde(default)]
    backend_urls: Vec<String>,
    #[serde(default)]
    dbs: Vec<String>,
}

async fn recovery(
    State(state): State<ApiState>,
    Json(req): Json<RecoveryRequest>,
) -> Response {
    let proxy = Arc::clone(&state.proxy);
    tokio::spawn(async move {
        if let Err(e) = proxy
            .recovery(
                req.from_circle_num,
                req.to_circle_num,
                &req.backend_urls,
                req.dbs,
            )
            .await
        {
            error!(
                from = req.from_circle_num,
                to = req.to_circle_num,
                error = %e,
                "recovery failed"
            );
        }
    });
    (StatusCode::ACCEPTED, "recovery started\n").into_response()
}

#[derive(Debug, Deserialize)]
struct ResyncRequest {
    #[serde(default)]
    dbs: Vec<String>,
    #[serde(default)]
    last_seconds: u64,
}

async fn resync(State(state): State<ApiState>, Json(req): Json<ResyncRequest>) -> Response {
    let proxy = Arc::clone(&state.proxy);
    tokio::spawn(async move {
        if let Err(e) = proxy.resync(req.dbs, req.last_seconds).await {
            error!(error = %e, "resync failed");
        }
    });
    (StatusCode::ACCEPTED, "resync started\n").into_response()
}

#[derive(Debug, Deserialize)]
struct ClearRequest {
    circle_num: usize,
    #[serde(default)]
    dbs: Vec<String>,
}

async fn clear(State(state): State<ApiState>, Json(req): Json<ClearRequest>) -> Response {
    let proxy = Arc::clone(&state.proxy);
    tokio::spawn(async move {
        if let Err(e) = proxy.clear_measurements(req.circle_num, req.dbs).await {
            error!(circle = req.circle_num, error = %e, "clear failed");
        }
    });
    (StatusCode::ACCEPTED, "clear started\n").into_response()
}

async fn migrate_status(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let workflow = params
        .get("type")
        .map(String::as_str)
        .and_then(Workflow::parse);
    let Some(workflow) = workflow else {
        return (
            StatusCode::BAD_REQUEST,
            "type must be one of rebalance, recovery, resync\n",
        )
            .into_response();
    };
    Json(state.proxy.migration_status(workflow)).into_response()
}

async fn migrate_state(State(state): State<ApiState>) -> Response {
    Json(state.proxy.migrating_state()).into_response()
}
