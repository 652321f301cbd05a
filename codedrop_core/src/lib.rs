//! Core engine for codedrop: code-based rendezvous plus chunked file
//! transfer between two peers.
//!
//! The engine runs as a background task driven by [`EngineCommand`]s and
//! reports everything through [`EngineEvent`]s, so any interface layer
//! (CLI, GUI, tests) can sit on the other side of two channels. A session
//! pairs over the signal server, negotiates a direct QUIC channel when it
//! can, relays through the server when it cannot, and streams files as
//! checksummed chunks either way.

pub mod assembler;
pub mod chunker;
pub mod code;
pub mod config;
pub mod error;
pub mod rendezvous;
pub mod retry;
pub mod session;
pub mod transport;
pub mod wire;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use crate::config::EngineConfig;
pub use crate::error::TransferError;
pub use crate::session::SessionState;
pub use crate::wire::{Role, TransferMetadata};

use crate::assembler::{AddOutcome, Assembler};
use crate::rendezvous::Rendezvous;
use crate::session::PeerSession;
use crate::transport::{PeerChannel, Transport};
use crate::wire::decode_frame;

const FILE_QUEUE: usize = 8;
const CONTROL_QUEUE: usize = 10;
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const STALE_TRANSFER_AGE: Duration = Duration::from_secs(120);
const RECEIVE_PROGRESS_INTERVAL_MS: u128 = 100;

/// Commands from the interface layer into the engine.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Mint a transfer code and wait for a peer as the sending side.
    InitTransfer,
    /// Join an existing code as the receiving side.
    Connect { code: String },
    /// Stream a file to the connected peer.
    SendFile { path: PathBuf },
    /// Hold the active transfer after the chunk in flight.
    Pause,
    /// Continue a paused transfer.
    Resume,
    /// Abandon the active session and drop partial transfer state.
    Cancel,
    /// Tear down the session and the signaling connection.
    Disconnect,
}

/// Events from the engine back to the interface layer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Free-form notes for a status line.
    Status(String),
    /// The minted code to hand to the receiving side.
    CodeReady { code: String },
    /// The session moved through its lifecycle.
    SessionChanged { state: SessionState },
    TransferProgress {
        file_name: String,
        percent: f32,
        speed: String,
        is_sending: bool,
    },
    TransferPaused { file_name: String },
    TransferResumed { file_name: String },
    /// The sending side delivered every chunk.
    TransferCompleted { file_name: String },
    /// A whole file arrived and passed verification.
    FileReceived {
        file_name: String,
        mime_type: String,
        bytes: Bytes,
        /// Where the file was written, unless saving failed.
        saved_to: Option<PathBuf>,
    },
    /// A transfer or session died; `kind` is the stable error label.
    TransferFailed { kind: &'static str, message: String },
    /// The session and signaling connection are gone.
    Disconnected,
}

/// Pause/resume signals into a running send loop.
#[derive(Debug, Clone, Copy)]
pub enum TransferControl {
    Pause,
    Resume,
}

struct ActiveLink {
    cancel: CancellationToken,
    file_tx: mpsc::Sender<PathBuf>,
    control_tx: mpsc::Sender<TransferControl>,
    finished: Arc<AtomicBool>,
}

impl ActiveLink {
    fn is_live(&self) -> bool {
        !self.finished.load(Ordering::Relaxed)
    }
}

/// Runs the engine until the command channel closes.
///
/// At most one session is active at a time; a finished or failed session
/// frees the slot for the next `InitTransfer`/`Connect`.
pub async fn run_engine(
    config: EngineConfig,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    event_tx: mpsc::Sender<EngineEvent>,
) {
    let _ = dotenvy::dotenv();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut active: Option<ActiveLink> = None;

    while let Some(cmd) = cmd_rx.recv().await {
        if active.as_ref().is_some_and(|link| !link.is_live()) {
            active = None;
        }
        match cmd {
            EngineCommand::InitTransfer => {
                if active.is_some() {
                    let _ = event_tx
                        .send(EngineEvent::Status(
                            "already in a session; disconnect first".to_string(),
                        ))
                        .await;
                    continue;
                }
                let code = code::generate_code();
                let _ = event_tx
                    .send(EngineEvent::CodeReady { code: code.clone() })
                    .await;
                active = Some(spawn_link(
                    config.clone(),
                    code,
                    Role::Sender,
                    event_tx.clone(),
                ));
            }
            EngineCommand::Connect { code } => {
                if active.is_some() {
                    let _ = event_tx
                        .send(EngineEvent::Status(
                            "already in a session; disconnect first".to_string(),
                        ))
                        .await;
                    continue;
                }
                let Some(code) = code::normalize_code(&code) else {
                    let _ = event_tx
                        .send(EngineEvent::TransferFailed {
                            kind: "invalid-code",
                            message: format!("{:?} is not a valid transfer code", code),
                        })
                        .await;
                    continue;
                };
                active = Some(spawn_link(
                    config.clone(),
                    code,
                    Role::Receiver,
                    event_tx.clone(),
                ));
            }
            EngineCommand::SendFile { path } => match &active {
                Some(link) => {
                    let _ = link.file_tx.send(path).await;
                }
                None => {
                    let _ = event_tx
                        .send(EngineEvent::TransferFailed {
                            kind: "no-session",
                            message: "connect to a peer before sending a file".to_string(),
                        })
                        .await;
                }
            },
            EngineCommand::Pause => {
                if let Some(link) = &active {
                    let _ = link.control_tx.send(TransferControl::Pause).await;
                }
            }
            EngineCommand::Resume => {
                if let Some(link) = &active {
                    let _ = link.control_tx.send(TransferControl::Resume).await;
                }
            }
            EngineCommand::Cancel => {
                if let Some(link) = active.take() {
                    link.cancel.cancel();
                    let _ = event_tx
                        .send(EngineEvent::Status("transfer cancelled".to_string()))
                        .await;
                }
            }
            EngineCommand::Disconnect => {
                if let Some(link) = active.take() {
                    link.cancel.cancel();
                }
                let _ = event_tx.send(EngineEvent::Disconnected).await;
            }
        }
    }

    if let Some(link) = active.take() {
        link.cancel.cancel();
    }
}

fn spawn_link(
    config: EngineConfig,
    code: String,
    role: Role,
    event_tx: mpsc::Sender<EngineEvent>,
) -> ActiveLink {
    let cancel = CancellationToken::new();
    let (file_tx, file_rx) = mpsc::channel(FILE_QUEUE);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let finished = Arc::new(AtomicBool::new(false));

    let task_cancel = cancel.clone();
    let task_finished = finished.clone();
    tokio::spawn(async move {
        run_link(config, code, role, task_cancel, event_tx, file_rx, control_rx).await;
        task_finished.store(true, Ordering::Relaxed);
    });

    ActiveLink {
        cancel,
        file_tx,
        control_tx,
        finished,
    }
}

async fn run_link(
    config: EngineConfig,
    code: String,
    role: Role,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<EngineEvent>,
    mut file_rx: mpsc::Receiver<PathBuf>,
    mut control_rx: mpsc::Receiver<TransferControl>,
) {
    // 1. Reach the signal server.
    let url = config.signal_url.clone();
    let mut rendezvous = match retry::retry(config.retry, &cancel, "signaling connect", || {
        Rendezvous::connect(&url)
    })
    .await
    {
        Ok(client) => client,
        Err(e) => {
            report_failure(&event_tx, &e).await;
            return;
        }
    };

    // 2. Negotiate a channel, restarting from scratch on transient failures.
    let mut backoff = retry::Backoff::new(config.retry, "negotiation");
    let (mut channel, mut peer) = loop {
        if cancel.is_cancelled() {
            report_failure(&event_tx, &TransferError::TransferCancelled).await;
            return;
        }
        match session::negotiate(&mut rendezvous, &code, role, &config, &cancel, &event_tx).await {
            Ok(pair) => break pair,
            Err(e) => {
                if let Err(give_up) = backoff.step(&cancel, e).await {
                    report_failure(&event_tx, &give_up).await;
                    rendezvous.close();
                    return;
                }
            }
        }
    };
    let _ = event_tx
        .send(EngineEvent::Status(format!(
            "{} channel to peer is up",
            channel.kind()
        )))
        .await;

    // 3. Move data until the session ends.
    let clean = match role {
        Role::Sender => {
            run_sender(
                &mut channel,
                &mut peer,
                &config,
                &cancel,
                &event_tx,
                &mut file_rx,
                &mut control_rx,
            )
            .await
        }
        Role::Receiver => {
            run_receiver(&mut channel, &mut peer, &config, &cancel, &event_tx).await
        }
    };

    // 4. Tear down.
    channel.close().await;
    rendezvous.close();
    let resting = if clean {
        SessionState::Closed
    } else {
        SessionState::Failed
    };
    peer.advance(resting).await;
}

/// Returns whether the loop ended by choice rather than by error.
async fn run_sender(
    channel: &mut PeerChannel,
    peer: &mut PeerSession,
    config: &EngineConfig,
    cancel: &CancellationToken,
    event_tx: &mpsc::Sender<EngineEvent>,
    file_rx: &mut mpsc::Receiver<PathBuf>,
    control_rx: &mut mpsc::Receiver<TransferControl>,
) -> bool {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => return true,
            path = file_rx.recv() => match path {
                Some(path) => path,
                None => return true,
            },
        };

        peer.advance(SessionState::Transferring).await;
        let policy = channel.default_chunk_policy();
        match chunker::send_file(
            channel,
            &path,
            None,
            policy,
            config.retry,
            cancel,
            control_rx,
            event_tx,
        )
        .await
        {
            Ok(metadata) => {
                let _ = event_tx
                    .send(EngineEvent::TransferCompleted {
                        file_name: metadata.file_name,
                    })
                    .await;
            }
            Err(TransferError::TransferCancelled) => return true,
            Err(e) => {
                report_failure(event_tx, &e).await;
                return false;
            }
        }
    }
}

struct ReceiveStat {
    started: Instant,
    bytes: u64,
    /// `None` until the first progress event, which goes out unthrottled.
    last_emit: Option<Instant>,
}

/// Returns whether the loop ended by choice rather than by error.
async fn run_receiver(
    channel: &mut PeerChannel,
    peer: &mut PeerSession,
    config: &EngineConfig,
    cancel: &CancellationToken,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> bool {
    let mut assembler = Assembler::new();
    let mut stats: HashMap<Uuid, ReceiveStat> = HashMap::new();
    let mut sweep = tokio::time::interval(STALE_SWEEP_INTERVAL);
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                assembler.clear_incomplete();
                return true;
            }
            _ = sweep.tick() => {
                if assembler.sweep_stale(STALE_TRANSFER_AGE) > 0 {
                    stats.retain(|id, _| assembler.metadata(*id).is_some());
                }
            }
            frame = channel.recv() => {
                let Some(encoded) = frame else {
                    assembler.clear_incomplete();
                    let _ = event_tx
                        .send(EngineEvent::Status("peer channel closed".to_string()))
                        .await;
                    return true;
                };
                if let Err(e) = handle_frame(
                    encoded,
                    &mut assembler,
                    &mut stats,
                    config,
                    event_tx,
                    peer,
                )
                .await
                {
                    assembler.clear_incomplete();
                    report_failure(event_tx, &e).await;
                    return false;
                }
            }
        }
    }
}

async fn handle_frame(
    encoded: Bytes,
    assembler: &mut Assembler,
    stats: &mut HashMap<Uuid, ReceiveStat>,
    config: &EngineConfig,
    event_tx: &mpsc::Sender<EngineEvent>,
    peer: &mut PeerSession,
) -> Result<(), TransferError> {
    let frame = decode_frame(&encoded)?;
    let transfer_id = frame.header.transfer_id;
    let file_name = frame.header.file_name.clone();
    let payload_len = frame.payload.len() as u64;

    peer.advance(SessionState::Transferring).await;
    if assembler.add_chunk(frame)? == AddOutcome::Duplicate {
        return Ok(());
    }

    let stat = stats.entry(transfer_id).or_insert_with(|| ReceiveStat {
        started: Instant::now(),
        bytes: 0,
        last_emit: None,
    });
    stat.bytes += payload_len;

    let complete = assembler.is_complete(transfer_id);
    let emit_due = stat
        .last_emit
        .is_none_or(|at| at.elapsed().as_millis() >= RECEIVE_PROGRESS_INTERVAL_MS);
    if complete || emit_due {
        let (received, total) = assembler.progress(transfer_id);
        let percent = if total == 0 {
            0.0
        } else {
            (received as f32 / total as f32) * 100.0
        };
        let elapsed = stat.started.elapsed().as_secs_f64();
        let bps = if elapsed > 0.0 {
            stat.bytes as f64 / elapsed
        } else {
            0.0
        };
        let _ = event_tx
            .send(EngineEvent::TransferProgress {
                file_name: file_name.clone(),
                percent,
                speed: chunker::format_speed(bps),
                is_sending: false,
            })
            .await;
        stat.last_emit = Some(Instant::now());
    }

    if complete {
        match assembler.assemble(transfer_id) {
            Ok((metadata, bytes)) => {
                stats.remove(&transfer_id);
                let saved_to =
                    save_received_file(&config.download_dir, &metadata.file_name, &bytes).await;
                tracing::info!("received {} ({} bytes)", metadata.file_name, bytes.len());
                let _ = event_tx
                    .send(EngineEvent::FileReceived {
                        file_name: metadata.file_name,
                        mime_type: metadata.mime_type,
                        bytes,
                        saved_to,
                    })
                    .await;
            }
            Err(e) => {
                assembler.remove(transfer_id);
                stats.remove(&transfer_id);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Writes a received file under the download directory, using only the
/// final component of the peer-supplied name.
async fn save_received_file(download_dir: &Path, file_name: &str, bytes: &[u8]) -> Option<PathBuf> {
    let safe_name = Path::new(file_name)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed.bin".to_string());
    let target = download_dir.join(safe_name);

    let written: std::io::Result<()> = async {
        tokio::fs::create_dir_all(download_dir).await?;
        tokio::fs::write(&target, bytes).await?;
        Ok(())
    }
    .await;

    match written {
        Ok(()) => Some(target),
        Err(e) => {
            tracing::warn!("could not save {}: {}", target.display(), e);
            None
        }
    }
}

async fn report_failure(event_tx: &mpsc::Sender<EngineEvent>, err: &TransferError) {
    tracing::warn!("session ended: {}", err);
    let _ = event_tx
        .send(EngineEvent::TransferFailed {
            kind: err.kind(),
            message: err.to_string(),
        })
        .await;
}
