//! Wire formats: signaling envelopes and the chunk frame codec.
//!
//! Signaling messages are JSON texts on the WebSocket. Chunk frames are
//! binary and self-delimiting, so the same encoding works on the direct
//! channel (one frame per stream) and on the relayed byte stream (frames
//! split back out by [`FrameDecoder`]).

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransferError;

/// Ceiling on an encoded frame header. Anything bigger is a garbage length
/// prefix, not a real header.
pub const MAX_HEADER_LEN: usize = 4 * 1024;
/// Ceiling on a single frame payload on any transport.
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

/// Stable prefix of the error message the server sends when a code's role
/// slot is already taken. Clients match on it to recover the typed error.
pub const CODE_CONFLICT_PREFIX: &str = "code conflict";

/// Which side of the transfer a connection registered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// Every JSON message that crosses the signaling socket, in both directions.
///
/// The server consumes the first four and relays `offer`, `answer` and
/// `ice-candidate` verbatim; the last three only ever originate from the
/// server. Negotiation payloads stay opaque `Value`s here because the server
/// never needs to look inside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Join { code: String, data: JoinData },
    Offer { code: String, data: serde_json::Value },
    Answer { code: String, data: serde_json::Value },
    IceCandidate { code: String, data: serde_json::Value },
    ConnectionSuccess,
    JoinSuccess { code: String },
    Error { message: String },
}

impl Envelope {
    /// The transfer code this envelope is addressed to, if it carries one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Envelope::Join { code, .. }
            | Envelope::Offer { code, .. }
            | Envelope::Answer { code, .. }
            | Envelope::IceCandidate { code, .. }
            | Envelope::JoinSuccess { code } => Some(code),
            Envelope::ConnectionSuccess | Envelope::Error { .. } => None,
        }
    }

    /// The wire name of this envelope, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Join { .. } => "join",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidate { .. } => "ice-candidate",
            Envelope::ConnectionSuccess => "connection-success",
            Envelope::JoinSuccess { .. } => "join-success",
            Envelope::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinData {
    pub role: Role,
}

/// `offer.data`: opens a negotiation attempt. A fresh session id is minted
/// per attempt so stale answers can be told apart after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    pub session: Uuid,
}

/// `answer.data`: accepts the offer and carries the receiver's first batch
/// of direct-channel candidates. An empty list means relay only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub session: Uuid,
    pub candidates: Vec<String>,
}

/// `ice-candidate.data`: one trickled `ip:port` candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub session: Uuid,
    pub addr: String,
}

/// What the receiving side knows about a transfer, rebuilt from headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub total_chunks: u64,
}

/// Header carried by every chunk frame.
///
/// `total_chunks` is repeated on purpose: adaptive sizing may re-split the
/// unsent tail, and the receiver trusts the count carried by the
/// highest-indexed chunk it has seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub total_chunks: u64,
    pub chunk_index: u64,
    pub checksum: String,
}

/// One chunk as it travels: header plus raw payload bytes.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

/// Checksum of one chunk payload, as carried in the header.
pub fn chunk_checksum(payload: &[u8]) -> String {
    blake3::hash(payload).to_hex().to_string()
}

/// Encodes a frame as `[u32 header len][header JSON][u32 payload len][payload]`,
/// both lengths big-endian.
pub fn encode_frame(frame: &ChunkFrame) -> Result<Bytes, TransferError> {
    let header = serde_json::to_vec(&frame.header)?;
    let mut buf = BytesMut::with_capacity(8 + header.len() + frame.payload.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_u32(frame.payload.len() as u32);
    buf.put_slice(&frame.payload);
    Ok(buf.freeze())
}

/// Decodes exactly one frame. Trailing or missing bytes are an error; for
/// streams use [`FrameDecoder`].
pub fn decode_frame(bytes: &[u8]) -> Result<ChunkFrame, TransferError> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(bytes);
    match decoder.next_frame()? {
        Some(frame) if decoder.is_empty() => Ok(frame),
        Some(_) => Err(TransferError::MalformedMessage(
            "trailing bytes after chunk frame".to_string(),
        )),
        None => Err(TransferError::MalformedMessage(
            "truncated chunk frame".to_string(),
        )),
    }
}

/// Incremental frame splitter for byte-stream transports.
///
/// Feed it arbitrary segments with [`extend`](Self::extend) and pop complete
/// frames off the front. Splitting never depends on how the stream was
/// segmented in flight.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Splits off the next complete encoded frame without parsing the header.
    pub fn next_frame_bytes(&mut self) -> Result<Option<Bytes>, TransferError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let header_len = read_u32(&self.buf[0..4]);
        if header_len > MAX_HEADER_LEN {
            return Err(TransferError::MalformedMessage(format!(
                "frame header of {} bytes exceeds the {} byte cap",
                header_len, MAX_HEADER_LEN
            )));
        }
        if self.buf.len() < 4 + header_len + 4 {
            return Ok(None);
        }
        let payload_len = read_u32(&self.buf[4 + header_len..8 + header_len]);
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(TransferError::MalformedMessage(format!(
                "frame payload of {} bytes exceeds the {} byte cap",
                payload_len, MAX_PAYLOAD_LEN
            )));
        }
        let frame_len = 8 + header_len + payload_len;
        if self.buf.len() < frame_len {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(frame_len).freeze()))
    }

    /// Like [`next_frame_bytes`](Self::next_frame_bytes), but parsed.
    pub fn next_frame(&mut self) -> Result<Option<ChunkFrame>, TransferError> {
        match self.next_frame_bytes()? {
            Some(encoded) => Ok(Some(parse_frame(&encoded)?)),
            None => Ok(None),
        }
    }
}

fn parse_frame(encoded: &[u8]) -> Result<ChunkFrame, TransferError> {
    let header_len = read_u32(&encoded[0..4]);
    let header: ChunkHeader = serde_json::from_slice(&encoded[4..4 + header_len])?;
    let payload_len = read_u32(&encoded[4 + header_len..8 + header_len]);
    let payload = Bytes::copy_from_slice(&encoded[8 + header_len..8 + header_len + payload_len]);
    Ok(ChunkFrame { header, payload })
}

fn read_u32(bytes: &[u8]) -> usize {
    let mut buf = bytes;
    buf.get_u32() as usize
}
