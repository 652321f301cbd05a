//! Peer data channels.
//!
//! Two transports carry chunk frames: a direct QUIC channel and a relayed
//! path through the signal server's WebSocket. Which one a session gets is
//! decided once, at open time; after that everything upstream talks to the
//! [`Transport`] contract and does not care.

pub mod direct;
pub mod relay;

use std::time::Duration;

use bytes::Bytes;

pub use direct::DirectChannel;
pub use relay::RelayChannel;

use crate::chunker::ChunkPolicy;
use crate::error::TransferError;

/// Ceiling on one encoded frame over the direct channel. One frame rides
/// one QUIC stream, so this also bounds per-stream memory on the receiver.
pub const DIRECT_MAX_FRAME: usize = 64 * 1024;
/// Ceiling on one encoded frame over the relayed channel.
pub const RELAY_MAX_FRAME: usize = 1024 * 1024;

/// How long a send may wait for buffer space before it comes back as
/// `SendBufferFull` for the chunker to shrink against.
pub(crate) const SEND_BLOCK_WINDOW: Duration = Duration::from_secs(2);

/// One open data channel to the peer.
///
/// `send` takes a whole encoded frame and either queues it or fails fast;
/// blocking forever on a congested channel is the one thing it must not
/// do. `recv` yields whole encoded frames regardless of how the transport
/// segmented them in flight.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError>;

    /// `None` once the channel is closed or broken.
    async fn recv(&mut self) -> Option<Bytes>;

    async fn close(&mut self);

    fn max_frame_size(&self) -> usize;

    /// The chunk sizing that suits this transport.
    fn default_chunk_policy(&self) -> ChunkPolicy;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Direct,
    Relayed,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Direct => write!(f, "direct"),
            ChannelKind::Relayed => write!(f, "relayed"),
        }
    }
}

/// The channel variant a session ended up with.
#[derive(Debug)]
pub enum PeerChannel {
    Direct(DirectChannel),
    Relayed(RelayChannel),
}

impl PeerChannel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            PeerChannel::Direct(_) => ChannelKind::Direct,
            PeerChannel::Relayed(_) => ChannelKind::Relayed,
        }
    }
}

impl Transport for PeerChannel {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        match self {
            PeerChannel::Direct(channel) => channel.send(frame).await,
            PeerChannel::Relayed(channel) => channel.send(frame).await,
        }
    }

    async fn recv(&mut self) -> Option<Bytes> {
        match self {
            PeerChannel::Direct(channel) => channel.recv().await,
            PeerChannel::Relayed(channel) => channel.recv().await,
        }
    }

    async fn close(&mut self) {
        match self {
            PeerChannel::Direct(channel) => channel.close().await,
            PeerChannel::Relayed(channel) => channel.close().await,
        }
    }

    fn max_frame_size(&self) -> usize {
        match self {
            PeerChannel::Direct(channel) => channel.max_frame_size(),
            PeerChannel::Relayed(channel) => channel.max_frame_size(),
        }
    }

    fn default_chunk_policy(&self) -> ChunkPolicy {
        match self {
            PeerChannel::Direct(channel) => channel.default_chunk_policy(),
            PeerChannel::Relayed(channel) => channel.default_chunk_policy(),
        }
    }
}
