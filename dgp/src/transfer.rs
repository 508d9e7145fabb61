//! File-transfer state machines. The sender drives a file through compress -> chunk ->
//! send -> await-completion; the receiver accumulates chunks keyed by index and answers
//! the completion handshake with either an ack, a SACK-bitmap nack, or a plain nack.

use crate::compression::{self, Algorithm, FILE_DECOMPRESS_CAP};
use crate::error::TransferError;
use crate::filemeta::FileMeta;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const COMPLETION_REQUEST_INTERVAL: Duration = Duration::from_secs(2);

/// Sender-side transfer phases.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SenderState {
    AwaitingAcceptance,
    Sending,
    AwaitingCompletion,
    Completed,
    Failed,
}

pub struct OutboundTransfer {
    pub meta: FileMeta,
    pub chunks: Vec<Vec<u8>>,
    pub state: SenderState,
    pub last_completion_request: Option<Instant>,
}

impl OutboundTransfer {
    /// Prepares a transfer: computes the SHA-256 of the original bytes, optionally
    /// compresses the whole file as one unit, and splits the result into fixed-size
    /// chunks. Falls back to uncompressed (`Algorithm::None`) if compression doesn't
    /// actually shrink the payload.
    pub fn prepare(
        filename: String,
        original: &[u8],
        chunk_size: u32,
        preferred: Option<Algorithm>,
    ) -> Result<OutboundTransfer, TransferError> {
        let sha256: [u8; 32] = Sha256::digest(original).into();

        let (algorithm, body) = match preferred {
            Some(algorithm) if algorithm != Algorithm::None => {
                match compression::compress(algorithm, original) {
                    Ok(compressed) if compressed.len() < original.len() => (algorithm, compressed),
                    _ => (Algorithm::None, original.to_vec()),
                }
            }
            _ => (Algorithm::None, original.to_vec()),
        };

        let chunks: Vec<Vec<u8>> = body.chunks(chunk_size as usize).map(|c| c.to_vec()).collect();
        let meta = FileMeta {
            filename,
            original_size: original.len() as u32,
            sha256,
            chunk_size,
            total_chunks: chunks.len() as u32,
            compression: algorithm,
        };

        Ok(OutboundTransfer { meta, chunks, state: SenderState::AwaitingAcceptance, last_completion_request: None })
    }

    pub fn accept(&mut self) {
        if self.state == SenderState::AwaitingAcceptance {
            self.state = SenderState::Sending;
        }
    }

    pub fn reject(&mut self) {
        self.state = SenderState::Failed;
    }

    /// Called once every chunk has been handed to the session's pending queue.
    pub fn all_chunks_queued(&mut self, now: Instant) {
        self.state = SenderState::AwaitingCompletion;
        self.last_completion_request = Some(now);
    }

    pub fn should_send_completion_request(&self, now: Instant) -> bool {
        self.state == SenderState::AwaitingCompletion
            && self
                .last_completion_request
                .map_or(true, |last| now.duration_since(last) >= COMPLETION_REQUEST_INTERVAL)
    }

    pub fn mark_completion_request_sent(&mut self, now: Instant) {
        self.last_completion_request = Some(now);
    }

    pub fn on_completion_ack(&mut self) {
        self.state = SenderState::Completed;
    }

    pub fn on_completion_nack_without_sack(&mut self) {
        self.state = SenderState::Failed;
    }

    /// Returns chunk indices this transfer must resend given the peer's SACK bitmap.
    pub fn missing_from_sack(&self, sack: &SackBitmap) -> Vec<u32> {
        sack.missing_chunks(self.meta.total_chunks)
    }
}

/// Receiver-side state for one in-flight incoming transfer.
pub struct InboundTransfer {
    pub meta: FileMeta,
    pub received: BTreeMap<u32, Vec<u8>>,
    pub started_at: Instant,
    pub completed_at: Option<Instant>,
}

impl InboundTransfer {
    pub fn new(meta: FileMeta, now: Instant) -> InboundTransfer {
        InboundTransfer { meta, received: BTreeMap::new(), started_at: now, completed_at: None }
    }

    /// Stores a chunk if its CRC32 matches; a mismatching chunk is silently dropped and
    /// remains "missing" for the SACK loop to pick up later. Re-receiving an already-held
    /// index is a no-op.
    pub fn receive_chunk(&mut self, index: u32, data: Vec<u8>, expected_crc: u32) {
        if self.received.contains_key(&index) {
            return;
        }
        let actual_crc = crc32fast::hash(&data);
        if actual_crc != expected_crc {
            return;
        }
        self.received.insert(index, data);
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.meta.total_chunks
    }

    pub fn sack_bitmap(&self) -> SackBitmap {
        SackBitmap::from_received(&self.received, self.meta.total_chunks)
    }

    /// Reassembles, decompresses (if needed) and verifies the SHA-256 of a complete
    /// transfer. Only valid once [`is_complete`] is true.
    pub fn finalize(&self) -> Result<Vec<u8>, TransferError> {
        let mut body = Vec::with_capacity((self.meta.chunk_size as usize) * self.received.len());
        for (_, chunk) in self.received.iter() {
            body.extend_from_slice(chunk);
        }
        let original = if self.meta.compression == Algorithm::None {
            body
        } else {
            compression::decompress(
                self.meta.compression,
                &body,
                self.meta.original_size as usize,
                FILE_DECOMPRESS_CAP,
            )
            .map_err(|_| TransferError::HashMismatch)?
        };

        let digest: [u8; 32] = Sha256::digest(&original).into();
        if digest != self.meta.sha256 {
            return Err(TransferError::HashMismatch);
        }
        Ok(original)
    }
}

/// Selective-acknowledgement bitmap: bit `k` (LSB-first within each byte) means chunk
/// index `k` has been received.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SackBitmap(Vec<u8>);

impl SackBitmap {
    pub fn from_received(received: &BTreeMap<u32, Vec<u8>>, total_chunks: u32) -> SackBitmap {
        let num_bytes = (total_chunks as usize + 7) / 8;
        let mut bytes = vec![0u8; num_bytes];
        for &index in received.keys() {
            set_bit(&mut bytes, index);
        }
        SackBitmap(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> SackBitmap {
        SackBitmap(bytes)
    }

    pub fn is_received(&self, index: u32) -> bool {
        get_bit(&self.0, index)
    }

    /// Chunk indices in `[0, up_to)` not marked received.
    pub fn missing_chunks(&self, up_to: u32) -> Vec<u32> {
        (0..up_to).filter(|&i| !self.is_received(i)).collect()
    }
}

fn set_bit(bytes: &mut [u8], index: u32) {
    let byte = (index / 8) as usize;
    let bit = index % 8;
    if byte < bytes.len() {
        bytes[byte] |= 1 << bit;
    }
}

fn get_bit(bytes: &[u8], index: u32) -> bool {
    let byte = (index / 8) as usize;
    let bit = index % 8;
    bytes.get(byte).map_or(false, |b| b & (1 << bit) != 0)
}

/// Sanitizes a peer-supplied filename to a safe basename, then appends a numeric suffix
/// on collision with `exists`. Defends against path traversal via `..` or embedded
/// separators in a filename we didn't choose ourselves.
pub fn sanitize_and_dedupe_filename<F: Fn(&str) -> bool>(requested: &str, exists: F) -> String {
    let base = requested
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(requested)
        .replace("..", "_");
    let base = if base.is_empty() { "download".to_string() } else { base };

    if !exists(&base) {
        return base;
    }

    let (stem, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => (base[..idx].to_string(), base[idx..].to_string()),
        _ => (base.clone(), String::new()),
    };

    for suffix in 1.. {
        let candidate = format!("{}-{}{}", stem, suffix, ext);
        if !exists(&candidate) {
            return candidate;
        }
    }
    unreachable!("exists() must eventually return false for a bounded directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(total_chunks: u32, size: u32) -> FileMeta {
        FileMeta {
            filename: "test.bin".to_string(),
            original_size: size,
            sha256: Sha256::digest(&vec![0u8; size as usize]).into(),
            chunk_size: 128,
            total_chunks,
            compression: Algorithm::None,
        }
    }

    #[test]
    fn sack_bitmap_round_trips_received_set() {
        let mut received = BTreeMap::new();
        received.insert(0, vec![]);
        received.insert(1, vec![]);
        received.insert(2, vec![]);
        received.insert(4, vec![]);
        received.insert(5, vec![]);
        let sack = SackBitmap::from_received(&received, 6);
        assert_eq!(sack.missing_chunks(6), vec![3]);
    }

    #[test]
    fn chunk_with_bad_crc_is_silently_dropped() {
        let mut transfer = InboundTransfer::new(meta(2, 10), Instant::now());
        transfer.receive_chunk(0, vec![1, 2, 3], 0xDEADBEEF);
        assert!(!transfer.received.contains_key(&0));
    }

    #[test]
    fn duplicate_chunk_receive_is_a_no_op() {
        let mut transfer = InboundTransfer::new(meta(1, 3), Instant::now());
        let data = vec![9, 9, 9];
        let crc = crc32fast::hash(&data);
        transfer.receive_chunk(0, data.clone(), crc);
        transfer.receive_chunk(0, vec![1, 1, 1], crc);
        assert_eq!(transfer.received.get(&0), Some(&data));
    }

    #[test]
    fn completion_iff_all_chunks_received() {
        let mut transfer = InboundTransfer::new(meta(2, 6), Instant::now());
        let data = vec![1, 2, 3];
        let crc = crc32fast::hash(&data);
        transfer.receive_chunk(0, data.clone(), crc);
        assert!(!transfer.is_complete());
        transfer.receive_chunk(1, data, crc);
        assert!(transfer.is_complete());
    }

    #[test]
    fn filename_sanitization_strips_traversal_and_separators() {
        let name = sanitize_and_dedupe_filename("../../etc/passwd", |_| false);
        assert!(!name.contains(".."));
        assert!(!name.contains('/'));
    }

    #[test]
    fn filename_collision_appends_numeric_suffix() {
        let taken = ["photo.jpg", "photo-1.jpg"];
        let name = sanitize_and_dedupe_filename("photo.jpg", |candidate| taken.contains(&candidate));
        assert_eq!(name, "photo-2.jpg");
    }

    #[test]
    fn whole_file_transfer_round_trips_through_chunking_and_reassembly() {
        let original = b"the quick brown fox jumps over the lazy dog".to_vec();
        let outbound = OutboundTransfer::prepare("msg.txt".to_string(), &original, 8, None).unwrap();
        let mut inbound = InboundTransfer::new(outbound.meta.clone(), Instant::now());
        for (index, chunk) in outbound.chunks.iter().enumerate() {
            let crc = crc32fast::hash(chunk);
            inbound.receive_chunk(index as u32, chunk.clone(), crc);
        }
        assert!(inbound.is_complete());
        assert_eq!(inbound.finalize().unwrap(), original);
    }
}
