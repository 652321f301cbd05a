//! Per-socket signaling logic: greeting, the join handshake, then relay
//! until the socket goes away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use codedrop_core::code::normalize_code;
use codedrop_core::wire::{CODE_CONFLICT_PREFIX, Envelope, Role};

use crate::registry::{PeerHandle, RegisterOutcome, Registry};

/// How long a fresh socket gets to produce its join.
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Keepalive ping cadence.
const PING_INTERVAL_SECS: u64 = 30;
const OUTBOUND_QUEUE: usize = 64;

/// Handle one WebSocket connection from greeting to teardown.
pub async fn handle_socket(socket: WebSocket, registry: Arc<Registry>, addr: SocketAddr) {
    let conn_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    // One writer task owns the sink; everything else queues through it.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tracing::info!("connection {} from {}", conn_id, addr);
    serve_connection(&mut stream, &out_tx, &registry, conn_id).await;

    drop(out_tx);
    let _ = writer.await;
    tracing::info!(
        "connection {} closed ({} codes active)",
        conn_id,
        registry.active_codes().await
    );
}

async fn serve_connection(
    stream: &mut SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<Message>,
    registry: &Registry,
    conn_id: Uuid,
) {
    send_envelope(out_tx, &Envelope::ConnectionSuccess).await;

    let joined = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        wait_for_join(stream, out_tx),
    )
    .await;
    let (code, role) = match joined {
        Ok(Some(join)) => join,
        Ok(None) => return,
        Err(_) => {
            send_error(out_tx, "join timed out").await;
            return;
        }
    };

    let handle = PeerHandle {
        conn_id,
        tx: out_tx.clone(),
    };
    match registry.register(&code, role, handle).await {
        RegisterOutcome::Conflict => {
            tracing::warn!("{} rejected: {} already has a live {}", conn_id, code, role);
            send_error(
                out_tx,
                &format!("{}: a {} is already joined under {}", CODE_CONFLICT_PREFIX, role, code),
            )
            .await;
            return;
        }
        RegisterOutcome::Registered { peer_present } => {
            tracing::info!(
                "{} joined {} as {} (peer present: {})",
                conn_id,
                code,
                role,
                peer_present
            );
            send_envelope(out_tx, &Envelope::JoinSuccess { code: code.clone() }).await;
        }
    }

    relay_loop(stream, out_tx, registry, conn_id, &code, role).await;
    registry.deregister(&code, conn_id).await;
}

/// Reads until a valid join shows up. Anything else gets an error reply
/// and another chance; `None` means the socket went away first.
async fn wait_for_join(
    stream: &mut SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<Message>,
) -> Option<(String, Role)> {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        match serde_json::from_str::<Envelope>(&text) {
            Ok(Envelope::Join { code, data }) => match normalize_code(&code) {
                Some(code) => return Some((code, data.role)),
                None => send_error(out_tx, "malformed transfer code").await,
            },
            Ok(other) => {
                send_error(out_tx, &format!("expected join, got {}", other.kind())).await;
            }
            Err(e) => {
                tracing::warn!("unparseable message during join: {}", e);
                send_error(out_tx, "malformed message").await;
            }
        }
    }
    None
}

async fn relay_loop(
    stream: &mut SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<Message>,
    registry: &Registry,
    conn_id: Uuid,
    code: &str,
    role: Role,
) {
    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if out_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!("socket error on {}: {}", conn_id, e);
                        return;
                    }
                    None => return,
                };
                match message {
                    Message::Text(text) => {
                        handle_text(&text, out_tx, registry, conn_id, code, role).await;
                    }
                    Message::Binary(payload) => {
                        // Chunk traffic on the relayed path, forwarded untouched.
                        let delivered = registry
                            .relay_to_peer(code, conn_id, Message::Binary(payload))
                            .await;
                        if !delivered {
                            tracing::debug!("dropped binary frame under {}: no live peer", code);
                        }
                    }
                    Message::Close(_) => return,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }
}

async fn handle_text(
    text: &str,
    out_tx: &mpsc::Sender<Message>,
    registry: &Registry,
    conn_id: Uuid,
    code: &str,
    role: Role,
) {
    let envelope = match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("unparseable message from {}: {}", conn_id, e);
            send_error(out_tx, "malformed message").await;
            return;
        }
    };
    match &envelope {
        Envelope::Offer { code: target, .. }
        | Envelope::Answer { code: target, .. }
        | Envelope::IceCandidate { code: target, .. } => {
            if target != code {
                send_error(out_tx, "envelope addressed to a different code").await;
                return;
            }
            // Negotiation payloads are peer business; forward byte-for-byte.
            let delivered = registry
                .relay_to_peer(code, conn_id, Message::Text(text.to_string().into()))
                .await;
            if !delivered {
                tracing::debug!("dropped {} under {}: no live peer", envelope.kind(), code);
            }
        }
        Envelope::Join { code: target, data } => {
            // A repeat join on the same socket is a no-op.
            if normalize_code(target).as_deref() == Some(code) && data.role == role {
                send_envelope(
                    out_tx,
                    &Envelope::JoinSuccess {
                        code: code.to_string(),
                    },
                )
                .await;
            } else {
                send_error(out_tx, "already joined; open a new connection to switch").await;
            }
        }
        Envelope::ConnectionSuccess | Envelope::JoinSuccess { .. } | Envelope::Error { .. } => {
            send_error(
                out_tx,
                &format!("{} only goes server to client", envelope.kind()),
            )
            .await;
        }
    }
}

async fn send_envelope(out_tx: &mpsc::Sender<Message>, envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(json) => {
            let _ = out_tx.send(Message::Text(json.into())).await;
        }
        Err(e) => tracing::error!("could not encode {}: {}", envelope.kind(), e),
    }
}

async fn send_error(out_tx: &mpsc::Sender<Message>, message: &str) {
    send_envelope(
        out_tx,
        &Envelope::Error {
            message: message.to_string(),
        },
    )
    .await;
}
