//! codedrop signal server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use codedrop_signal::{Registry, serve};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = std::env::var("CODEDROP_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("bad bind address {:?}", bind))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not bind {}", addr))?;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received");
            ctrl_c_cancel.cancel();
        }
    });

    serve(listener, Arc::new(Registry::new()), cancel).await
}
