//! Ringleader proxy binary.

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use ringleader::config::ProxyConfig;
use ringleader::proxy::Proxy;
use ringleader::{api, telemetry, Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ringleader", version, about = "Sharding and replication proxy for time-series backends")]
struct Args {
    /// Path to the proxy config file
    #[arg(long, default_value = "proxy.json")]
    config: PathBuf,
    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("ringleader: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    telemetry::init(&args.log_level)?;

    let config = ProxyConfig::load(&args.config)?;
    let proxy = Arc::new(Proxy::new(&config)?);
    proxy.spawn_workers();

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen_addr {}: {e}", config.listen_addr)))?;
    let app = api::build_router(Arc::clone(&proxy), &config);

    info!(
        %addr,
        circles = proxy.circles().len(),
        https = config.https_enabled,
        "ringleader listening"
    );
    if config.https_enabled {
        let tls = RustlsConfig::from_pem_file(&config.https_cert, &config.https_key)
            .await
            .map_err(Error::Io)?;
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await?;
    } else {
        axum_server::bind(addr)
            .serve(app.into_make_service())
            .await?;
    }
    Ok(())
}
