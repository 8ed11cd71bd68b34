//! Smoke tests for the HTTP front door.

mod common;

use common::{proxy_config, spawn_backend, MockState};
use ringleader::api;
use ringleader::proxy::Proxy;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    base: String,
    proxy: Arc<Proxy>,
    client: reqwest::Client,
}

async fn serve(config: ringleader::config::ProxyConfig) -> Harness {
    let proxy = Arc::new(Proxy::new(&config).unwrap());
    let app = api::build_router(Arc::clone(&proxy), &config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Harness {
        base: format!("http://{addr}"),
        proxy,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn ping_returns_no_content() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(MockState::default()).await;
    let config = proxy_config(
        dir.path(),
        &[vec![backend.url.clone()]],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    let h = serve(config).await;

    let resp = h.client.get(format!("{}/ping", h.base)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 204);
}

#[tokio::test]
async fn write_endpoint_buffers_canonicalized_lines() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(MockState::default()).await;
    let config = proxy_config(
        dir.path(),
        &[vec![backend.url.clone()]],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    let h = serve(config).await;

    let resp = h
        .client
        .post(format!("{}/write", h.base))
        .query(&[("db", "metrics"), ("precision", "s")])
        .body("cpu,host=h1 value=1 1\n\n# a comment\nmem value=2 2")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    let expected = "cpu,host=h1 value=1 1000000000\n".len();
    let cpu_home = h.proxy.circles()[0].route("metrics,cpu").unwrap();
    let mem_home = h.proxy.circles()[0].route("metrics,mem").unwrap();
    let total = cpu_home.buffered_bytes("metrics").await
        + if mem_home.url == cpu_home.url {
            0
        } else {
            mem_home.buffered_bytes("metrics").await
        };
    assert_eq!(total, expected + "mem value=2 2000000000\n".len());
}

#[tokio::test]
async fn write_rejects_unknown_database_and_missing_db() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(MockState::default()).await;
    let config = proxy_config(
        dir.path(),
        &[vec![backend.url.clone()]],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    let h = serve(config).await;

    let resp = h
        .client
        .post(format!("{}/write", h.base))
        .body("cpu value=1 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = h
        .client
        .post(format!("{}/write", h.base))
        .query(&[("db", "other")])
        .body("cpu value=1 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn write_requires_credentials_when_configured() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(MockState::default()).await;
    let mut config = proxy_config(
        dir.path(),
        &[vec![backend.url.clone()]],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    config.username = "admin".to_string();
    config.password = "secret".to_string();
    let h = serve(config).await;

    let resp = h
        .client
        .post(format!("{}/write", h.base))
        .query(&[("db", "metrics")])
        .body("cpu value=1 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = h
        .client
        .post(format!("{}/write", h.base))
        .query(&[("db", "metrics"), ("u", "admin"), ("p", "secret")])
        .body("cpu value=1 1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
}

#[tokio::test]
async fn query_admission_denies_forbidden_statements() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(MockState::default()).await;
    let config = proxy_config(
        dir.path(),
        &[vec![backend.url.clone()]],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    let h = serve(config).await;

    let resp = h
        .client
        .get(format!("{}/query", h.base))
        .query(&[("db", "metrics"), ("q", "drop database metrics")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    let resp = h
        .client
        .get(format!("{}/query", h.base))
        .query(&[("db", "metrics"), ("q", "show databases")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = h
        .client
        .get(format!("{}/query", h.base))
        .query(&[("db", "metrics"), ("q", "select * from cpu")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn migrate_endpoints_expose_state_and_status() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(MockState::default()).await;
    let config = proxy_config(
        dir.path(),
        &[vec![backend.url.clone()]],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    let h = serve(config).await;

    let state: serde_json::Value = h
        .client
        .get(format!("{}/migrate/state", h.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["circle-0"], serde_json::json!(false));

    let resp = h
        .client
        .get(format!("{}/migrate/status", h.base))
        .query(&[("type", "rebalance")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = h
        .client
        .get(format!("{}/migrate/status", h.base))
        .query(&[("type", "repair")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}
