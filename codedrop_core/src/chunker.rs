//! File splitting and the sending loop.
//!
//! A [`Chunker`] lazily cuts a file into checksummed frames at whatever
//! size the transport is currently sustaining. The split is not
//! restartable: delivered chunk boundaries are final, and only the unsent
//! tail is re-cut when the size adapts. [`send_file`] drives a whole file
//! through a transport with one chunk in flight at a time.

use std::path::Path;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TransferError;
use crate::retry::{Backoff, RetryPolicy};
use crate::transport::Transport;
use crate::wire::{ChunkFrame, ChunkHeader, TransferMetadata, chunk_checksum, encode_frame};
use crate::{EngineEvent, TransferControl};

/// Default chunk size on the direct channel.
pub const DIRECT_CHUNK_SIZE: usize = 16 * 1024;
/// Default chunk size on the relayed channel.
pub const RELAY_CHUNK_SIZE: usize = 256 * 1024;
/// Adaptive sizing never goes below this.
pub const MIN_CHUNK_SIZE: usize = 1024;
/// Ceiling on chunks per transfer; bounds receiver bookkeeping.
pub const MAX_CHUNK_COUNT: u64 = 1 << 20;

const PROGRESS_UPDATE_INTERVAL_MS: u128 = 100;

/// Sizing bounds and adaptation rates for one transport.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    /// Starting size, and the cap growth may climb back to.
    pub initial: usize,
    pub floor: usize,
    /// Multiplier applied on every recorded send failure.
    pub shrink_factor: f64,
    /// Consecutive successes needed before the size doubles again.
    pub grow_after: u32,
}

impl ChunkPolicy {
    pub fn for_direct() -> Self {
        Self {
            initial: DIRECT_CHUNK_SIZE,
            floor: MIN_CHUNK_SIZE,
            shrink_factor: 0.5,
            grow_after: 4,
        }
    }

    pub fn for_relay() -> Self {
        Self {
            initial: RELAY_CHUNK_SIZE,
            floor: MIN_CHUNK_SIZE,
            shrink_factor: 0.5,
            grow_after: 4,
        }
    }
}

/// Live chunk size for one transfer.
#[derive(Debug)]
pub struct AdaptiveSize {
    policy: ChunkPolicy,
    current: usize,
    success_streak: u32,
}

impl AdaptiveSize {
    pub fn new(policy: ChunkPolicy) -> Self {
        Self {
            policy,
            current: policy.initial,
            success_streak: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn at_floor(&self) -> bool {
        self.current <= self.policy.floor
    }

    /// Shrinks by the policy factor, clamped to the floor.
    pub fn record_failure(&mut self) {
        self.success_streak = 0;
        let shrunk = (self.current as f64 * self.policy.shrink_factor) as usize;
        self.current = shrunk.max(self.policy.floor);
    }

    /// After enough consecutive successes, doubles back toward the
    /// starting size but never past it.
    pub fn record_success(&mut self) {
        self.success_streak += 1;
        if self.success_streak >= self.policy.grow_after && self.current < self.policy.initial {
            self.current = (self.current * 2).min(self.policy.initial);
            self.success_streak = 0;
        }
    }
}

/// Lazy, forward-only splitter for one file.
#[derive(Debug)]
pub struct Chunker {
    file: File,
    file_name: String,
    mime_type: String,
    total_size: u64,
    transfer_id: Uuid,
    /// Bytes already handed out in cut chunks.
    consumed: u64,
    /// Bytes read from the file but not yet cut, after a push-back.
    staged: BytesMut,
    next_index: u64,
    total_chunks: u64,
    size: AdaptiveSize,
}

impl Chunker {
    /// Opens `path` and sizes the split. Fails with `FileTooLarge` when
    /// even floor-sized chunks could not cover the file within the
    /// chunk-count ceiling.
    pub async fn open(
        path: &Path,
        mime_type: Option<String>,
        policy: ChunkPolicy,
    ) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        let total_size = file.metadata().await?.len();

        let worst_case = total_size.div_ceil(policy.floor.max(1) as u64);
        if worst_case > MAX_CHUNK_COUNT {
            return Err(TransferError::FileTooLarge {
                total_chunks: worst_case,
                limit: MAX_CHUNK_COUNT,
            });
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed.bin".to_string());
        let mime_type = mime_type.unwrap_or_else(|| mime_for_path(path).to_string());

        Ok(Self {
            file,
            file_name,
            mime_type,
            total_size,
            transfer_id: Uuid::new_v4(),
            consumed: 0,
            staged: BytesMut::new(),
            next_index: 0,
            total_chunks: chunk_count(total_size, policy.initial),
            size: AdaptiveSize::new(policy),
        })
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn chunk_size(&self) -> usize {
        self.size.current()
    }

    pub fn at_floor(&self) -> bool {
        self.size.at_floor()
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn metadata(&self) -> TransferMetadata {
        TransferMetadata {
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            total_size: self.total_size,
            total_chunks: self.total_chunks,
        }
    }

    /// Cuts the next chunk at the current size. `None` once the file is
    /// exhausted. Empty files still yield one empty chunk so the receiver
    /// learns the metadata.
    pub async fn next_chunk(&mut self) -> Result<Option<ChunkFrame>, TransferError> {
        if self.consumed >= self.total_size && self.next_index > 0 {
            return Ok(None);
        }

        let want = self
            .size
            .current()
            .min((self.total_size - self.consumed) as usize);
        if self.staged.len() < want {
            let missing = want - self.staged.len();
            let mut buf = vec![0u8; missing];
            self.file.read_exact(&mut buf).await?;
            self.staged.extend_from_slice(&buf);
        }
        let payload = self.staged.split_to(want).freeze();

        let header = ChunkHeader {
            transfer_id: self.transfer_id,
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            total_size: self.total_size,
            total_chunks: self.total_chunks,
            chunk_index: self.next_index,
            checksum: chunk_checksum(&payload),
        };
        self.consumed += want as u64;
        self.next_index += 1;
        Ok(Some(ChunkFrame { header, payload }))
    }

    /// Returns an undelivered chunk to the front of the split so the same
    /// bytes are re-cut, usually at a smaller size, under the same index.
    pub fn push_back(&mut self, frame: ChunkFrame) {
        let mut reclaimed = BytesMut::with_capacity(frame.payload.len() + self.staged.len());
        reclaimed.extend_from_slice(&frame.payload);
        reclaimed.extend_from_slice(&self.staged);
        self.staged = reclaimed;
        self.consumed -= frame.payload.len() as u64;
        self.next_index = frame.header.chunk_index;
    }

    /// Shrinks the chunk size and recounts the unsent tail.
    pub fn record_send_failure(&mut self) {
        self.size.record_failure();
        self.retotal();
    }

    pub fn record_send_success(&mut self) {
        let before = self.size.current();
        self.size.record_success();
        if self.size.current() != before {
            tracing::debug!(
                "chunk size grew back to {} bytes after a clean streak",
                self.size.current()
            );
            self.retotal();
        }
    }

    fn retotal(&mut self) {
        let remaining = self.total_size - self.consumed;
        if remaining == 0 {
            return;
        }
        self.total_chunks = self.next_index + remaining.div_ceil(self.size.current() as u64);
    }
}

fn chunk_count(total_size: u64, chunk_size: usize) -> u64 {
    total_size.div_ceil(chunk_size as u64).max(1)
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.to_string_lossy().as_ref() {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Streams a whole file through `transport`.
///
/// One chunk is in flight at a time. Transient rejections push the chunk
/// back, shrink the size and go through the shared backoff; the next cut
/// retransmits the same bytes under the same index. Pause, resume and
/// cancellation are honored between chunks.
pub async fn send_file<T: Transport>(
    transport: &mut T,
    path: &Path,
    mime_type: Option<String>,
    policy: ChunkPolicy,
    retry_policy: RetryPolicy,
    cancel: &CancellationToken,
    control_rx: &mut mpsc::Receiver<TransferControl>,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<TransferMetadata, TransferError> {
    let mut chunker = Chunker::open(path, mime_type, policy).await?;
    let file_name = chunker.metadata().file_name;
    let total_size = chunker.metadata().total_size;
    tracing::info!(
        "sending {} ({} bytes in ~{} chunks of {} bytes)",
        file_name,
        total_size,
        chunker.total_chunks(),
        chunker.chunk_size()
    );

    let mut backoff = Backoff::new(retry_policy, "chunk send");
    let started = Instant::now();
    let mut last_progress = Instant::now();
    let mut sent_bytes: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::TransferCancelled);
        }
        wait_if_paused(control_rx, cancel, event_tx, &file_name).await?;

        let frame = match chunker.next_chunk().await? {
            Some(frame) => frame,
            None => break,
        };
        let encoded = encode_frame(&frame)?;

        // A cut that cannot fit the transport's frame ceiling is shrunk
        // before it ever touches the wire.
        if encoded.len() > transport.max_frame_size() && !chunker.at_floor() {
            chunker.push_back(frame);
            chunker.record_send_failure();
            continue;
        }

        match transport.send(encoded).await {
            Ok(()) => {
                sent_bytes += frame.payload.len() as u64;
                chunker.record_send_success();
                backoff.reset();

                let done = sent_bytes >= total_size;
                if done || last_progress.elapsed().as_millis() >= PROGRESS_UPDATE_INTERVAL_MS {
                    let percent = if total_size == 0 {
                        100.0
                    } else {
                        (sent_bytes as f32 / total_size as f32) * 100.0
                    };
                    let elapsed = started.elapsed().as_secs_f64();
                    let bps = if elapsed > 0.0 {
                        sent_bytes as f64 / elapsed
                    } else {
                        0.0
                    };
                    let _ = event_tx
                        .send(EngineEvent::TransferProgress {
                            file_name: file_name.clone(),
                            percent,
                            speed: format_speed(bps),
                            is_sending: true,
                        })
                        .await;
                    last_progress = Instant::now();
                }
            }
            Err(err) => {
                tracing::debug!(
                    "chunk {} rejected at {} bytes: {}",
                    frame.header.chunk_index,
                    frame.payload.len(),
                    err
                );
                chunker.push_back(frame);
                chunker.record_send_failure();
                backoff.step(cancel, err).await?;
            }
        }
    }

    tracing::info!(
        "sent {} in {} chunks",
        file_name,
        chunker.total_chunks()
    );
    Ok(chunker.metadata())
}

async fn wait_if_paused(
    control_rx: &mut mpsc::Receiver<TransferControl>,
    cancel: &CancellationToken,
    event_tx: &mpsc::Sender<EngineEvent>,
    file_name: &str,
) -> Result<(), TransferError> {
    while let Ok(control) = control_rx.try_recv() {
        match control {
            TransferControl::Resume => {}
            TransferControl::Pause => {
                let _ = event_tx
                    .send(EngineEvent::TransferPaused {
                        file_name: file_name.to_string(),
                    })
                    .await;
                tracing::info!("transfer of {} paused", file_name);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::TransferCancelled),
                        control = control_rx.recv() => match control {
                            Some(TransferControl::Resume) => {
                                let _ = event_tx
                                    .send(EngineEvent::TransferResumed {
                                        file_name: file_name.to_string(),
                                    })
                                    .await;
                                tracing::info!("transfer of {} resumed", file_name);
                                break;
                            }
                            Some(TransferControl::Pause) => {}
                            None => return Err(TransferError::TransferCancelled),
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_000_000.0 {
        format!("{:.1} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec >= 1_000.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn test_policy(initial: usize) -> ChunkPolicy {
        ChunkPolicy {
            initial,
            floor: MIN_CHUNK_SIZE,
            shrink_factor: 0.5,
            grow_after: 4,
        }
    }

    #[tokio::test]
    async fn ten_thousand_bytes_split_into_three_chunks() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let file = temp_file(&data);
        let mut chunker = Chunker::open(file.path(), None, test_policy(4096))
            .await
            .unwrap();

        assert_eq!(chunker.total_chunks(), 3);
        let mut sizes = Vec::new();
        let mut joined = Vec::new();
        while let Some(frame) = chunker.next_chunk().await.unwrap() {
            assert_eq!(frame.header.total_chunks, 3);
            assert_eq!(frame.header.chunk_index, sizes.len() as u64);
            assert_eq!(frame.header.checksum, chunk_checksum(&frame.payload));
            sizes.push(frame.payload.len());
            joined.extend_from_slice(&frame.payload);
        }
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn empty_file_yields_one_empty_chunk() {
        let file = temp_file(b"");
        let mut chunker = Chunker::open(file.path(), None, test_policy(4096))
            .await
            .unwrap();

        let frame = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(frame.header.total_chunks, 1);
        assert!(frame.payload.is_empty());
        assert!(chunker.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_up_front() {
        let data = vec![7u8; (MAX_CHUNK_COUNT + 1) as usize];
        let file = temp_file(&data);
        let mut policy = test_policy(4096);
        policy.floor = 1;

        match Chunker::open(file.path(), None, policy).await {
            Err(TransferError::FileTooLarge { total_chunks, limit }) => {
                assert_eq!(total_chunks, MAX_CHUNK_COUNT + 1);
                assert_eq!(limit, MAX_CHUNK_COUNT);
            }
            other => panic!("expected FileTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn pushed_back_chunk_is_recut_smaller_under_the_same_index() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 239) as u8).collect();
        let file = temp_file(&data);
        let mut chunker = Chunker::open(file.path(), None, test_policy(4096))
            .await
            .unwrap();

        let first = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.payload.len(), 4096);
        let original = first.payload.clone();

        chunker.push_back(first);
        chunker.record_send_failure();
        assert_eq!(chunker.chunk_size(), 2048);
        assert_eq!(chunker.total_chunks(), 4);

        let recut = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(recut.header.chunk_index, 0);
        assert_eq!(recut.header.total_chunks, 4);
        assert_eq!(recut.payload, original.slice(0..2048));

        // The rest of the file still comes out intact.
        let mut joined = recut.payload.to_vec();
        while let Some(frame) = chunker.next_chunk().await.unwrap() {
            joined.extend_from_slice(&frame.payload);
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn shrink_is_floor_clamped_and_growth_is_capped() {
        let mut size = AdaptiveSize::new(test_policy(16 * 1024));

        size.record_failure();
        size.record_failure();
        size.record_failure();
        assert_eq!(size.current(), 2048);

        for _ in 0..20 {
            size.record_failure();
        }
        assert_eq!(size.current(), MIN_CHUNK_SIZE);

        // Four clean sends per doubling, never past the starting size.
        for _ in 0..4 {
            size.record_success();
        }
        assert_eq!(size.current(), 2048);
        for _ in 0..100 {
            size.record_success();
        }
        assert_eq!(size.current(), 16 * 1024);
    }

    #[test]
    fn mime_guesses_cover_common_extensions() {
        assert_eq!(mime_for_path(Path::new("a.png")), "image/png");
        assert_eq!(mime_for_path(Path::new("b.tar.GZ")), "application/octet-stream");
        assert_eq!(mime_for_path(Path::new("notes.TXT")), "text/plain");
        assert_eq!(mime_for_path(Path::new("no_extension")), "application/octet-stream");
    }
}
