//! Integration tests for the replicated write path.

mod common;

use common::proxy_config;
use ringleader::line::Precision;
use ringleader::proxy::Proxy;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn two_circle_proxy(dir: &TempDir) -> Arc<Proxy> {
    let config = proxy_config(
        dir.path(),
        &[
            vec!["http://url1:8086".to_string()],
            vec!["http://url2:8086".to_string()],
        ],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    Arc::new(Proxy::new(&config).unwrap())
}

#[tokio::test]
async fn replicated_write_lands_in_every_circle() {
    let dir = TempDir::new().unwrap();
    let proxy = two_circle_proxy(&dir);

    proxy
        .write_data("metrics", b"cpu,host=h1 value=1 1\n", Some(Precision::S))
        .await
        .unwrap();

    let canonical = "cpu,host=h1 value=1 1000000000\n";
    for circle in proxy.circles() {
        let backend = circle.route("metrics,cpu").unwrap();
        assert_eq!(
            backend.buffered_bytes("metrics").await,
            canonical.len(),
            "circle {} buffer should hold exactly the canonicalized line",
            circle.circle_num
        );
    }
}

#[tokio::test]
async fn placement_is_stable_across_repeated_lookups() {
    let dir = TempDir::new().unwrap();
    let config = proxy_config(
        dir.path(),
        &[vec![
            "http://url1:8086".to_string(),
            "http://url2:8086".to_string(),
        ]],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    let proxy = Arc::new(Proxy::new(&config).unwrap());
    let circle = &proxy.circles()[0];

    let cpu_home = circle.route_url("m,cpu").unwrap().to_string();
    let mem_home = circle.route_url("m,mem").unwrap().to_string();
    for _ in 0..1000 {
        assert_eq!(circle.route_url("m,cpu").unwrap(), cpu_home);
        assert_eq!(circle.route_url("m,mem").unwrap(), mem_home);
    }
}

#[tokio::test]
async fn writes_preserve_enqueue_order_per_buffer() {
    let dir = TempDir::new().unwrap();
    let config = proxy_config(
        dir.path(),
        &[vec!["http://url1:8086".to_string()]],
        1024 * 1024,
        Duration::from_secs(3600),
    );
    let proxy = Arc::new(Proxy::new(&config).unwrap());

    for i in 0..3 {
        proxy
            .write_data(
                "metrics",
                format!("cpu value={i} {i}").as_bytes(),
                Some(Precision::Ns),
            )
            .await
            .unwrap();
    }
    let backend = proxy.circles()[0].backends()[0].clone();
    assert_eq!(
        backend.buffered_bytes("metrics").await,
        "cpu value=0 0\ncpu value=1 1\ncpu value=2 2\n".len()
    );
}
