//! Signal server for codedrop.
//!
//! Pairs two WebSocket clients under a transfer code, relays negotiation
//! envelopes between them, and carries chunk frames for sessions that
//! never manage a direct channel. The server never parses a negotiation
//! payload or a chunk; it only routes.

pub mod handler;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use registry::Registry;

/// Build the router: one WebSocket endpoint, everything else 404s.
pub fn create_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .with_state(registry)
}

/// WebSocket upgrade handler
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<Registry>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handler::handle_socket(socket, registry, addr))
}

/// Serve on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<()> {
    let router = create_router(registry);
    tracing::info!("signal server listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        cancel.cancelled().await;
        tracing::info!("signal server shutting down");
    })
    .await?;
    Ok(())
}
