//! Relayed peer channel over the signaling socket.
//!
//! Binary WebSocket messages are forwarded verbatim by the signal server,
//! which makes this an ordered byte stream between the peers. Frames are
//! recovered with the shared [`FrameDecoder`], so nothing here depends on
//! how the bytes were grouped into messages along the way.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::chunker::ChunkPolicy;
use crate::error::TransferError;
use crate::transport::{RELAY_MAX_FRAME, SEND_BLOCK_WINDOW, Transport};
use crate::wire::FrameDecoder;

/// Data path through the signal server.
///
/// Holds a clone of the rendezvous writer queue and the binary half of its
/// reader. Closing the channel does not close the signaling socket; that
/// stays up until the session disconnects.
#[derive(Debug)]
pub struct RelayChannel {
    out_tx: mpsc::Sender<Message>,
    data_rx: mpsc::Receiver<Bytes>,
    decoder: FrameDecoder,
    closed: bool,
}

impl RelayChannel {
    pub fn new(out_tx: mpsc::Sender<Message>, data_rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            out_tx,
            data_rx,
            decoder: FrameDecoder::new(),
            closed: false,
        }
    }
}

impl Transport for RelayChannel {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        if self.closed {
            return Err(TransferError::SendFailed("relay channel closed".to_string()));
        }
        if frame.len() > RELAY_MAX_FRAME {
            return Err(TransferError::SendBufferFull);
        }
        match tokio::time::timeout(SEND_BLOCK_WINDOW, self.out_tx.send(Message::Binary(frame)))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransferError::SendFailed(
                "signaling connection closed".to_string(),
            )),
            Err(_) => Err(TransferError::SendBufferFull),
        }
    }

    async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.decoder.next_frame_bytes() {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("relay byte stream corrupted: {}", e);
                    return None;
                }
            }
            let blob = self.data_rx.recv().await?;
            self.decoder.extend(&blob);
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.data_rx.close();
    }

    fn max_frame_size(&self) -> usize {
        RELAY_MAX_FRAME
    }

    fn default_chunk_policy(&self) -> ChunkPolicy {
        ChunkPolicy::for_relay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ChunkFrame, ChunkHeader, chunk_checksum, encode_frame};
    use uuid::Uuid;

    fn encoded_frame(index: u64, payload: &[u8]) -> Bytes {
        let payload = Bytes::copy_from_slice(payload);
        encode_frame(&ChunkFrame {
            header: ChunkHeader {
                transfer_id: Uuid::nil(),
                file_name: "x.bin".to_string(),
                mime_type: "application/octet-stream".to_string(),
                total_size: 64,
                total_chunks: 8,
                chunk_index: index,
                checksum: chunk_checksum(&payload),
            },
            payload,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn frames_survive_arbitrary_message_boundaries() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (data_tx, data_rx) = mpsc::channel(16);
        let mut channel = RelayChannel::new(out_tx, data_rx);

        let first = encoded_frame(0, b"aaaa");
        let second = encoded_frame(1, b"bbbb");
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        // Deliver the two frames as three lopsided messages.
        let cut_a = first.len() - 3;
        let cut_b = first.len() + 5;
        data_tx.send(Bytes::copy_from_slice(&stream[..cut_a])).await.unwrap();
        data_tx
            .send(Bytes::copy_from_slice(&stream[cut_a..cut_b]))
            .await
            .unwrap();
        data_tx.send(Bytes::copy_from_slice(&stream[cut_b..])).await.unwrap();

        assert_eq!(channel.recv().await.unwrap(), first);
        assert_eq!(channel.recv().await.unwrap(), second);
    }

    #[tokio::test]
    async fn send_after_close_is_refused() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (_data_tx, data_rx) = mpsc::channel(16);
        let mut channel = RelayChannel::new(out_tx, data_rx);

        channel.close().await;
        assert!(matches!(
            channel.send(Bytes::from_static(b"frame")).await,
            Err(TransferError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frames_report_buffer_pressure() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (_data_tx, data_rx) = mpsc::channel(16);
        let mut channel = RelayChannel::new(out_tx, data_rx);

        let huge = Bytes::from(vec![0u8; RELAY_MAX_FRAME + 1]);
        assert!(matches!(
            channel.send(huge).await,
            Err(TransferError::SendBufferFull)
        ));
    }
}
