//! Receiving-side chunk reassembly.
//!
//! Chunks arrive keyed by index, in whatever order the transport delivers
//! them, possibly more than once. The assembler buffers them per transfer,
//! decides completeness, and only concatenates once every index in
//! `[0, total)` is present and every checksum holds.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::chunker::MAX_CHUNK_COUNT;
use crate::error::TransferError;
use crate::wire::{ChunkFrame, TransferMetadata, chunk_checksum};

/// What [`Assembler::add_chunk`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Stored,
    /// The index was already buffered; the frame was dropped.
    Duplicate,
}

#[derive(Debug)]
struct StoredChunk {
    payload: Bytes,
    checksum: String,
}

#[derive(Debug)]
struct TransferBuffer {
    file_name: String,
    mime_type: String,
    total_size: u64,
    /// Authoritative count: whatever the highest-indexed chunk seen so far
    /// claims. Adaptive sizing re-splits the unsent tail, so older chunks
    /// may carry a stale count.
    total_chunks: u64,
    max_index: u64,
    chunks: BTreeMap<u64, StoredChunk>,
    last_activity: Instant,
}

impl TransferBuffer {
    fn new(frame: &ChunkFrame) -> Self {
        Self {
            file_name: frame.header.file_name.clone(),
            mime_type: frame.header.mime_type.clone(),
            total_size: frame.header.total_size,
            total_chunks: frame.header.total_chunks,
            max_index: frame.header.chunk_index,
            chunks: BTreeMap::new(),
            last_activity: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() as u64 == self.total_chunks
            && (0..self.total_chunks).all(|i| self.chunks.contains_key(&i))
    }

    fn metadata(&self) -> TransferMetadata {
        TransferMetadata {
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            total_size: self.total_size,
            total_chunks: self.total_chunks,
        }
    }
}

/// Buffers for every in-flight incoming transfer.
#[derive(Debug, Default)]
pub struct Assembler {
    buffers: HashMap<Uuid, TransferBuffer>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores one received frame. The first frame of a
    /// transfer id creates its buffer; re-delivered indices are dropped
    /// without effect.
    pub fn add_chunk(&mut self, frame: ChunkFrame) -> Result<AddOutcome, TransferError> {
        let header = &frame.header;
        if header.total_chunks == 0 || header.total_chunks > MAX_CHUNK_COUNT {
            return Err(TransferError::MalformedMessage(format!(
                "chunk claims {} total chunks",
                header.total_chunks
            )));
        }
        if header.chunk_index >= header.total_chunks {
            return Err(TransferError::MalformedMessage(format!(
                "chunk index {} out of range for {} chunks",
                header.chunk_index, header.total_chunks
            )));
        }

        let buffer = self
            .buffers
            .entry(header.transfer_id)
            .or_insert_with(|| TransferBuffer::new(&frame));
        if header.file_name != buffer.file_name || header.total_size != buffer.total_size {
            return Err(TransferError::MalformedMessage(format!(
                "chunk metadata changed mid-transfer for {}",
                header.transfer_id
            )));
        }
        buffer.last_activity = Instant::now();

        if header.chunk_index >= buffer.max_index {
            buffer.max_index = header.chunk_index;
            buffer.total_chunks = header.total_chunks;
        }
        if buffer.chunks.contains_key(&header.chunk_index) {
            tracing::debug!(
                "dropping duplicate chunk {} of transfer {}",
                header.chunk_index,
                header.transfer_id
            );
            return Ok(AddOutcome::Duplicate);
        }
        buffer.chunks.insert(
            header.chunk_index,
            StoredChunk {
                payload: frame.payload,
                checksum: frame.header.checksum,
            },
        );
        Ok(AddOutcome::Stored)
    }

    /// True only when every index in `[0, total)` is buffered.
    pub fn is_complete(&self, transfer_id: Uuid) -> bool {
        self.buffers
            .get(&transfer_id)
            .is_some_and(TransferBuffer::is_complete)
    }

    /// `(received, total)` chunk counts, for progress reporting.
    pub fn progress(&self, transfer_id: Uuid) -> (u64, u64) {
        match self.buffers.get(&transfer_id) {
            Some(buffer) => (buffer.chunks.len() as u64, buffer.total_chunks),
            None => (0, 0),
        }
    }

    pub fn metadata(&self, transfer_id: Uuid) -> Option<TransferMetadata> {
        self.buffers.get(&transfer_id).map(TransferBuffer::metadata)
    }

    /// Verifies every checksum and concatenates the payloads in index
    /// order. The buffer is released on success and kept otherwise, so a
    /// failed call can be followed by [`remove`](Self::remove).
    pub fn assemble(&mut self, transfer_id: Uuid) -> Result<(TransferMetadata, Bytes), TransferError> {
        let buffer = match self.buffers.get(&transfer_id) {
            Some(buffer) => buffer,
            None => return Err(TransferError::IncompleteTransfer { received: 0, total: 0 }),
        };
        if !buffer.is_complete() {
            return Err(TransferError::IncompleteTransfer {
                received: buffer.chunks.len() as u64,
                total: buffer.total_chunks,
            });
        }
        for (index, chunk) in &buffer.chunks {
            if chunk_checksum(&chunk.payload) != chunk.checksum {
                return Err(TransferError::ChecksumMismatch { index: *index });
            }
        }

        let buffer = match self.buffers.remove(&transfer_id) {
            Some(buffer) => buffer,
            None => return Err(TransferError::IncompleteTransfer { received: 0, total: 0 }),
        };
        let metadata = buffer.metadata();
        let mut assembled = BytesMut::with_capacity(buffer.total_size as usize);
        for (_, chunk) in buffer.chunks {
            assembled.extend_from_slice(&chunk.payload);
        }
        Ok((metadata, assembled.freeze()))
    }

    /// Drops one transfer's buffer, complete or not.
    pub fn remove(&mut self, transfer_id: Uuid) {
        self.buffers.remove(&transfer_id);
    }

    /// Drops every partial buffer. Called on cancellation and disconnect.
    pub fn clear_incomplete(&mut self) {
        let before = self.buffers.len();
        self.buffers.retain(|_, buffer| buffer.is_complete());
        let dropped = before - self.buffers.len();
        if dropped > 0 {
            tracing::info!("cleared {} incomplete transfer buffer(s)", dropped);
        }
    }

    /// Drops buffers that have not seen a chunk for `max_age`. Returns how
    /// many were removed.
    pub fn sweep_stale(&mut self, max_age: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|id, buffer| {
                let stale = buffer.last_activity.elapsed() > max_age;
                if stale {
                    tracing::debug!("sweeping stale transfer {}", id);
                }
                !stale
            });
        before - self.buffers.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ChunkHeader;

    fn frame(id: Uuid, index: u64, total: u64, payload: &[u8]) -> ChunkFrame {
        let payload = Bytes::copy_from_slice(payload);
        ChunkFrame {
            header: ChunkHeader {
                transfer_id: id,
                file_name: "notes.txt".to_string(),
                mime_type: "text/plain".to_string(),
                total_size: 12,
                total_chunks: total,
                chunk_index: index,
                checksum: chunk_checksum(&payload),
            },
            payload,
        }
    }

    #[test]
    fn out_of_order_chunks_assemble_in_index_order() {
        let id = Uuid::new_v4();
        let mut assembler = Assembler::new();

        for (index, payload) in [(0u64, b"red!".as_slice()), (2, b"blu!"), (1, b"grn!")] {
            assembler.add_chunk(frame(id, index, 3, payload)).unwrap();
        }
        assert!(assembler.is_complete(id));

        let (metadata, bytes) = assembler.assemble(id).unwrap();
        assert_eq!(bytes.as_ref(), b"red!grn!blu!");
        assert_eq!(metadata.total_chunks, 3);
        assert!(assembler.is_empty());
    }

    #[test]
    fn completeness_needs_all_of_two_before_one() {
        let id = Uuid::new_v4();
        let mut assembler = Assembler::new();

        assembler.add_chunk(frame(id, 0, 3, b"aaaa")).unwrap();
        assembler.add_chunk(frame(id, 2, 3, b"cccc")).unwrap();
        assert!(!assembler.is_complete(id));
        assert_eq!(assembler.progress(id), (2, 3));

        assembler.add_chunk(frame(id, 1, 3, b"bbbb")).unwrap();
        assert!(assembler.is_complete(id));
    }

    #[test]
    fn duplicates_are_dropped_without_double_counting() {
        let id = Uuid::new_v4();
        let mut assembler = Assembler::new();

        assert_eq!(
            assembler.add_chunk(frame(id, 1, 3, b"bbbb")).unwrap(),
            AddOutcome::Stored
        );
        assert_eq!(
            assembler.add_chunk(frame(id, 1, 3, b"bbbb")).unwrap(),
            AddOutcome::Duplicate
        );
        assert_eq!(assembler.progress(id), (1, 3));
    }

    #[test]
    fn assemble_before_complete_is_refused() {
        let id = Uuid::new_v4();
        let mut assembler = Assembler::new();
        assembler.add_chunk(frame(id, 0, 2, b"aaaa")).unwrap();

        match assembler.assemble(id) {
            Err(TransferError::IncompleteTransfer { received, total }) => {
                assert_eq!((received, total), (1, 2));
            }
            other => panic!("expected IncompleteTransfer, got {:?}", other.map(|_| ())),
        }
        // The buffer survives a refused assembly.
        assert_eq!(assembler.progress(id), (1, 2));
    }

    #[test]
    fn corrupted_chunk_fails_with_its_index() {
        let id = Uuid::new_v4();
        let mut assembler = Assembler::new();
        assembler.add_chunk(frame(id, 0, 2, b"aaaa")).unwrap();

        let mut bad = frame(id, 1, 2, b"bbbb");
        bad.header.checksum = chunk_checksum(b"something else");
        assembler.add_chunk(bad).unwrap();

        assert!(assembler.is_complete(id));
        match assembler.assemble(id) {
            Err(TransferError::ChecksumMismatch { index }) => assert_eq!(index, 1),
            other => panic!("expected ChecksumMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn out_of_range_index_is_malformed() {
        let id = Uuid::new_v4();
        let mut assembler = Assembler::new();
        assert!(matches!(
            assembler.add_chunk(frame(id, 3, 3, b"dddd")),
            Err(TransferError::MalformedMessage(_))
        ));
        assert!(matches!(
            assembler.add_chunk(frame(id, 0, 0, b"")),
            Err(TransferError::MalformedMessage(_))
        ));
    }

    #[test]
    fn highest_index_owns_the_chunk_count() {
        let id = Uuid::new_v4();
        let mut assembler = Assembler::new();

        // First two chunks were cut before a shrink, claiming 3 in total.
        assembler.add_chunk(frame(id, 0, 3, b"aaaa")).unwrap();
        assembler.add_chunk(frame(id, 1, 3, b"bbbb")).unwrap();
        // The re-split tail claims 4; chunk 3 has the highest index.
        assembler.add_chunk(frame(id, 3, 4, b"dd")).unwrap();
        assert_eq!(assembler.progress(id), (3, 4));
        assert!(!assembler.is_complete(id));

        assembler.add_chunk(frame(id, 2, 4, b"cc")).unwrap();
        assert!(assembler.is_complete(id));
    }

    #[test]
    fn unknown_transfer_reports_nothing_received() {
        let mut assembler = Assembler::new();
        assert!(matches!(
            assembler.assemble(Uuid::new_v4()),
            Err(TransferError::IncompleteTransfer { received: 0, total: 0 })
        ));
        assert!(!assembler.is_complete(Uuid::new_v4()));
    }

    #[test]
    fn clear_incomplete_keeps_finished_buffers() {
        let done = Uuid::new_v4();
        let partial = Uuid::new_v4();
        let mut assembler = Assembler::new();
        assembler.add_chunk(frame(done, 0, 1, b"whole")).unwrap();
        assembler.add_chunk(frame(partial, 0, 2, b"half")).unwrap();

        assembler.clear_incomplete();
        assert_eq!(assembler.len(), 1);
        assert!(assembler.is_complete(done));
    }

    #[test]
    fn stale_buffers_are_swept() {
        let id = Uuid::new_v4();
        let mut assembler = Assembler::new();
        assembler.add_chunk(frame(id, 0, 2, b"aaaa")).unwrap();

        assert_eq!(assembler.sweep_stale(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(assembler.sweep_stale(Duration::ZERO), 1);
        assert!(assembler.is_empty());
    }
}
