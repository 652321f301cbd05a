//! Direct channel tests over real loopback QUIC: dial and accept, frame
//! delivery in both directions, the frame ceiling, and teardown.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;

use codedrop_core::TransferError;
use codedrop_core::transport::direct::{self, DirectChannel};
use codedrop_core::transport::{DIRECT_MAX_FRAME, Transport};

fn init() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn loopback_pair() -> (DirectChannel, DirectChannel) {
    let server = direct::make_server_endpoint(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = direct::make_client_endpoint().unwrap();
    let (dialed, accepted) = tokio::join!(
        direct::connect(&client, server_addr, Duration::from_secs(2)),
        direct::accept(&server),
    );
    (
        DirectChannel::new(client, dialed.unwrap()),
        DirectChannel::new(server, accepted.unwrap()),
    )
}

async fn recv_frame(channel: &mut DirectChannel) -> Option<Bytes> {
    tokio::time::timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
}

#[tokio::test]
async fn frames_cross_the_loopback_in_both_directions() {
    init();
    let (mut sender, mut receiver) = loopback_pair().await;

    for i in 0..5u8 {
        sender
            .send(Bytes::from(vec![i; 1000 + i as usize]))
            .await
            .unwrap();
    }
    // One stream per frame, so arrival order is not guaranteed.
    let mut got = Vec::new();
    for _ in 0..5 {
        got.push(recv_frame(&mut receiver).await.unwrap());
    }
    got.sort_by_key(Bytes::len);
    for (i, frame) in got.iter().enumerate() {
        assert_eq!(frame.len(), 1000 + i);
        assert!(frame.iter().all(|b| *b == i as u8));
    }

    receiver.send(Bytes::from_static(b"pong")).await.unwrap();
    let back = recv_frame(&mut sender).await.unwrap();
    assert_eq!(&back[..], b"pong");

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn oversized_frame_is_rejected_without_touching_the_wire() {
    init();
    let (mut sender, mut receiver) = loopback_pair().await;

    let result = sender
        .send(Bytes::from(vec![0u8; DIRECT_MAX_FRAME + 1]))
        .await;
    assert!(matches!(result, Err(TransferError::SendBufferFull)));

    // The channel itself is untouched and keeps working.
    sender
        .send(Bytes::from_static(b"still alive"))
        .await
        .unwrap();
    let frame = recv_frame(&mut receiver).await.unwrap();
    assert_eq!(&frame[..], b"still alive");

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn closing_one_end_finishes_the_peer_recv() {
    init();
    let (mut sender, mut receiver) = loopback_pair().await;

    sender.send(Bytes::from_static(b"last words")).await.unwrap();
    let frame = recv_frame(&mut receiver).await.unwrap();
    assert_eq!(&frame[..], b"last words");

    sender.close().await;
    assert!(recv_frame(&mut receiver).await.is_none());
}

#[tokio::test]
async fn frames_sent_just_before_close_still_arrive() {
    init();
    let (mut sender, mut receiver) = loopback_pair().await;

    for i in 0..8u8 {
        sender.send(Bytes::from(vec![i; 32 * 1024])).await.unwrap();
    }
    // Close on the heels of the last send; nothing may go missing.
    sender.close().await;

    let mut got = Vec::new();
    for _ in 0..8 {
        got.push(recv_frame(&mut receiver).await.unwrap());
    }
    got.sort_by_key(|frame| frame[0]);
    for (i, frame) in got.iter().enumerate() {
        assert_eq!(frame.len(), 32 * 1024);
        assert!(frame.iter().all(|b| *b == i as u8));
    }
    assert!(recv_frame(&mut receiver).await.is_none());
}
