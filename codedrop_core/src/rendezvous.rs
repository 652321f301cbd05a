//! Client side of the signaling service.
//!
//! One WebSocket serves two jobs: JSON envelopes for negotiation and, when
//! the session falls back to relay, binary chunk traffic. The socket is
//! split into a writer task fed by a queue and a reader task that routes
//! the two kinds of traffic apart, so the negotiation loop and the relay
//! channel never contend for the stream itself.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::TransferError;
use crate::transport::RelayChannel;
use crate::wire::{CODE_CONFLICT_PREFIX, Envelope, JoinData, Role};

const OUT_QUEUE: usize = 32;
const ENVELOPE_QUEUE: usize = 64;
const BINARY_QUEUE: usize = 64;
const PING_INTERVAL_SECS: u64 = 30;
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// An established connection to the signal server.
#[derive(Debug)]
pub struct Rendezvous {
    out_tx: mpsc::Sender<Message>,
    envelope_rx: mpsc::Receiver<Envelope>,
    binary_rx: Option<mpsc::Receiver<Bytes>>,
    /// Envelopes that arrived while waiting for a join ack.
    pending: VecDeque<Envelope>,
    shutdown: CancellationToken,
}

impl Rendezvous {
    /// Connects and waits for the server's greeting. One attempt; callers
    /// wrap this in the shared retry when they want persistence.
    pub async fn connect(url: &Url) -> Result<Self, TransferError> {
        tracing::debug!("connecting to signal server at {}", url);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUT_QUEUE);
        let (envelope_tx, envelope_rx) = mpsc::channel(ENVELOPE_QUEUE);
        let (binary_tx, binary_rx) = mpsc::channel(BINARY_QUEUE);
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
            ping.tick().await;
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        // Frames accepted before the shutdown still go out
                        // ahead of the close handshake.
                        while let Ok(msg) = out_rx.try_recv() {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                    }
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        });

        let reader_shutdown = shutdown.clone();
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            let _ = envelope_tx.send(envelope).await;
                        }
                        Err(e) => tracing::warn!("unparseable signal message: {}", e),
                    },
                    Ok(Message::Binary(data)) => {
                        let _ = binary_tx.send(data).await;
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("signal server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("signaling read failed: {}", e);
                        break;
                    }
                }
            }
            reader_shutdown.cancel();
        });

        let mut client = Self {
            out_tx,
            envelope_rx,
            binary_rx: Some(binary_rx),
            pending: VecDeque::new(),
            shutdown,
        };

        match tokio::time::timeout(GREETING_TIMEOUT, client.envelope_rx.recv()).await {
            Ok(Some(Envelope::ConnectionSuccess)) => Ok(client),
            Ok(Some(other)) => Err(TransferError::Signaling(format!(
                "expected connection-success, got {}",
                other.kind()
            ))),
            Ok(None) => Err(TransferError::Signaling(
                "connection closed during greeting".to_string(),
            )),
            Err(_) => Err(TransferError::Signaling(
                "no greeting from signal server".to_string(),
            )),
        }
    }

    /// Registers under `code` and waits for the ack. Conflicts come back
    /// as `CodeConflict`; a repeated join from the same connection is
    /// acked again by the server, which makes negotiation restarts safe.
    pub async fn join(&mut self, code: &str, role: Role) -> Result<(), TransferError> {
        self.send_envelope(&Envelope::Join {
            code: code.to_string(),
            data: JoinData { role },
        })
        .await?;

        let deadline = tokio::time::Instant::now() + JOIN_ACK_TIMEOUT;
        loop {
            let envelope = tokio::time::timeout_at(deadline, self.envelope_rx.recv())
                .await
                .map_err(|_| TransferError::Signaling("join not acknowledged".to_string()))?
                .ok_or_else(|| {
                    TransferError::Signaling("connection closed while joining".to_string())
                })?;
            match envelope {
                Envelope::JoinSuccess { code: acked } if acked == code => {
                    tracing::info!("joined code {} as {}", code, role);
                    return Ok(());
                }
                Envelope::Error { message } => {
                    return Err(if message.starts_with(CODE_CONFLICT_PREFIX) {
                        TransferError::CodeConflict(code.to_string())
                    } else {
                        TransferError::Signaling(message)
                    });
                }
                // A relayed message can slip in ahead of the ack when the
                // peer is already active; keep it for `recv`.
                other => self.pending.push_back(other),
            }
        }
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransferError> {
        let json = serde_json::to_string(envelope)?;
        self.out_tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| TransferError::Signaling("signaling connection closed".to_string()))
    }

    /// Next envelope from the server or the peer. `None` when the socket
    /// is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.pending.pop_front() {
            return Some(envelope);
        }
        self.envelope_rx.recv().await
    }

    /// Builds the relayed data channel over this socket. The binary half
    /// backs exactly one channel, so this succeeds at most once.
    pub fn relay_channel(&mut self) -> Option<RelayChannel> {
        let data_rx = self.binary_rx.take()?;
        Some(RelayChannel::new(self.out_tx.clone(), data_rx))
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
