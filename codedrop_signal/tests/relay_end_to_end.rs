//! Full-stack tests against a real server socket: two engines pairing and
//! moving a file over the relayed path, code conflicts, and protocol
//! policing for clients that speak out of turn.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use codedrop_core::rendezvous::Rendezvous;
use codedrop_core::transport::Transport;
use codedrop_core::wire::{ChunkFrame, ChunkHeader, Role, chunk_checksum, encode_frame};
use codedrop_core::{
    EngineCommand, EngineConfig, EngineEvent, SessionState, TransferError, run_engine,
};
use codedrop_signal::{Registry, serve};

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn spawn_signal() -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = serve(listener, Arc::new(Registry::new()), server_cancel).await;
    });
    (addr, cancel)
}

fn engine_config(addr: SocketAddr, download_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        signal_url: format!("ws://{}/ws", addr).parse().unwrap(),
        download_dir: download_dir.to_path_buf(),
        enable_direct: false,
        ..EngineConfig::default()
    }
}

struct Engine {
    cmd_tx: mpsc::Sender<EngineCommand>,
    event_rx: mpsc::Receiver<EngineEvent>,
}

fn start_engine(config: EngineConfig) -> Engine {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(100);
    tokio::spawn(run_engine(config, cmd_rx, event_tx));
    Engine { cmd_tx, event_rx }
}

/// Discards events until `pick` keeps one; panics after fifteen seconds.
async fn wait_for<F, T>(event_rx: &mut mpsc::Receiver<EngineEvent>, mut pick: F) -> T
where
    F: FnMut(EngineEvent) -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let event = tokio::time::timeout_at(deadline, event_rx.recv())
            .await
            .expect("timed out waiting for an engine event")
            .expect("engine event channel closed");
        if let Some(value) = pick(event) {
            return value;
        }
    }
}

#[tokio::test]
async fn relayed_transfer_moves_a_file_between_engines() {
    init_tracing();
    let (addr, _server) = spawn_signal().await;
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let contents: Vec<u8> = (0..300_000).map(|i| (i % 251) as u8).collect();
    let source = send_dir.path().join("dataset.bin");
    std::fs::write(&source, &contents).unwrap();

    let mut sender = start_engine(engine_config(addr, send_dir.path()));
    let mut receiver = start_engine(engine_config(addr, recv_dir.path()));

    sender
        .cmd_tx
        .send(EngineCommand::InitTransfer)
        .await
        .unwrap();
    let code = wait_for(&mut sender.event_rx, |event| match event {
        EngineEvent::CodeReady { code } => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code.len(), 6);

    receiver
        .cmd_tx
        .send(EngineCommand::Connect { code })
        .await
        .unwrap();

    for engine in [&mut sender, &mut receiver] {
        wait_for(&mut engine.event_rx, |event| match event {
            EngineEvent::SessionChanged {
                state: SessionState::Connected,
            } => Some(()),
            _ => None,
        })
        .await;
    }

    sender
        .cmd_tx
        .send(EngineCommand::SendFile { path: source })
        .await
        .unwrap();

    let (file_name, bytes, saved_to) = wait_for(&mut receiver.event_rx, |event| match event {
        EngineEvent::FileReceived {
            file_name,
            bytes,
            saved_to,
            ..
        } => Some((file_name, bytes, saved_to)),
        _ => None,
    })
    .await;
    assert_eq!(file_name, "dataset.bin");
    assert_eq!(&bytes[..], &contents[..]);
    let saved_to = saved_to.expect("received file should be on disk");
    assert!(saved_to.starts_with(recv_dir.path()));
    assert_eq!(std::fs::read(&saved_to).unwrap(), contents);

    wait_for(&mut sender.event_rx, |event| match event {
        EngineEvent::TransferCompleted { file_name } => Some(file_name),
        _ => None,
    })
    .await;

    sender
        .cmd_tx
        .send(EngineCommand::Disconnect)
        .await
        .unwrap();
    wait_for(&mut sender.event_rx, |event| match event {
        EngineEvent::Disconnected => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn disconnect_right_after_completion_does_not_strand_the_tail() {
    init_tracing();
    let (addr, _server) = spawn_signal().await;
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let contents: Vec<u8> = (0..400_000).map(|i| (i % 249) as u8).collect();
    let source = send_dir.path().join("late.bin");
    std::fs::write(&source, &contents).unwrap();

    let mut sender = start_engine(engine_config(addr, send_dir.path()));
    let mut receiver = start_engine(engine_config(addr, recv_dir.path()));

    sender
        .cmd_tx
        .send(EngineCommand::InitTransfer)
        .await
        .unwrap();
    let code = wait_for(&mut sender.event_rx, |event| match event {
        EngineEvent::CodeReady { code } => Some(code),
        _ => None,
    })
    .await;
    receiver
        .cmd_tx
        .send(EngineCommand::Connect { code })
        .await
        .unwrap();
    for engine in [&mut sender, &mut receiver] {
        wait_for(&mut engine.event_rx, |event| match event {
            EngineEvent::SessionChanged {
                state: SessionState::Connected,
            } => Some(()),
            _ => None,
        })
        .await;
    }

    sender
        .cmd_tx
        .send(EngineCommand::SendFile { path: source })
        .await
        .unwrap();
    wait_for(&mut sender.event_rx, |event| match event {
        EngineEvent::TransferCompleted { .. } => Some(()),
        _ => None,
    })
    .await;
    // Tear the sender down while its last frames may still be queued.
    sender
        .cmd_tx
        .send(EngineCommand::Disconnect)
        .await
        .unwrap();

    let bytes = wait_for(&mut receiver.event_rx, |event| match event {
        EngineEvent::FileReceived { bytes, .. } => Some(bytes),
        _ => None,
    })
    .await;
    assert_eq!(&bytes[..], &contents[..]);
}

fn relay_frame(transfer_id: Uuid, index: u64) -> Bytes {
    let payload = Bytes::from(vec![index as u8; 2048]);
    encode_frame(&ChunkFrame {
        header: ChunkHeader {
            transfer_id,
            file_name: "queued.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            total_size: 12 * 2048,
            total_chunks: 12,
            chunk_index: index,
            checksum: chunk_checksum(&payload),
        },
        payload,
    })
    .unwrap()
}

#[tokio::test]
async fn queued_relay_frames_flush_before_the_close_handshake() {
    init_tracing();
    let (addr, _server) = spawn_signal().await;
    let url: url::Url = format!("ws://{}/ws", addr).parse().unwrap();

    let mut sender = Rendezvous::connect(&url).await.unwrap();
    sender.join("FLUSH0", Role::Sender).await.unwrap();
    let mut receiver = Rendezvous::connect(&url).await.unwrap();
    receiver.join("FLUSH0", Role::Receiver).await.unwrap();

    let mut outgoing = sender.relay_channel().unwrap();
    let mut incoming = receiver.relay_channel().unwrap();

    let transfer_id = Uuid::new_v4();
    let frames: Vec<Bytes> = (0..12).map(|i| relay_frame(transfer_id, i)).collect();
    for frame in &frames {
        outgoing.send(frame.clone()).await.unwrap();
    }
    // Shut the socket down on the heels of the last send.
    sender.close();

    for expected in &frames {
        let frame = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
            .await
            .expect("timed out waiting for a relayed frame")
            .expect("relay stream ended before the queued frames arrived");
        assert_eq!(&frame, expected);
    }
}

#[tokio::test]
async fn second_sender_under_the_same_code_is_rejected() {
    init_tracing();
    let (addr, _server) = spawn_signal().await;
    let url: url::Url = format!("ws://{}/ws", addr).parse().unwrap();

    let mut first = Rendezvous::connect(&url).await.unwrap();
    first.join("TANGO7", Role::Sender).await.unwrap();

    let mut second = Rendezvous::connect(&url).await.unwrap();
    let err = second.join("TANGO7", Role::Sender).await.unwrap_err();
    assert!(matches!(err, TransferError::CodeConflict(_)));

    // The other slot is still free.
    let mut receiver = Rendezvous::connect(&url).await.unwrap();
    receiver.join("TANGO7", Role::Receiver).await.unwrap();
}

#[tokio::test]
async fn speaking_before_join_gets_an_error_reply() {
    init_tracing();
    let (addr, _server) = spawn_signal().await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    let greeting = expect_text(&mut socket).await;
    assert!(greeting.contains("connection-success"));

    socket
        .send(tokio_tungstenite::tungstenite::Message::Text(
            r#"{"type":"offer","code":"TANGO7","data":{}}"#.into(),
        ))
        .await
        .unwrap();

    let reply = expect_text(&mut socket).await;
    assert!(reply.contains(r#""type":"error""#));
}

async fn expect_text(socket: &mut WsClient) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("socket closed")
            .expect("socket error");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
            return text.to_string();
        }
    }
}
