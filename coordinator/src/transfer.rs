//! Drives the file-transfer engine on top of [`dgp::OutboundTransfer`] /
//! [`dgp::InboundTransfer`]: turns UI-level "send this file" / "accept this transfer"
//! calls into the message sequence the spec's sender/receiver state machines describe,
//! including the completion-request loop and SACK-based selective retransmit.

use dgp::transfer::sanitize_and_dedupe_filename;
use dgp::{
    Algorithm, DgpMessage, FileMeta, InboundTransfer, MessageType, OutboundTransfer, SackBitmap, SenderState,
    TransferError,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const COMPLETION_REQUEST_ID: u32 = dgp::COMPLETION_REQUEST_ID;
pub const COMPLETION_ACK_ID: u32 = dgp::COMPLETION_ACK_ID;

/// One chunk message ready to hand to the AX.25 session's pending queue.
pub struct ChunkToSend {
    pub index: u32,
    pub message: DgpMessage,
}

pub struct TransferDriver {
    outbound: HashMap<u32, OutboundTransfer>,
    inbound: HashMap<u32, InboundTransfer>,
    downloads_dir: PathBuf,
}

impl TransferDriver {
    pub fn new(downloads_dir: PathBuf) -> TransferDriver {
        TransferDriver { outbound: HashMap::new(), inbound: HashMap::new(), downloads_dir }
    }

    /// Prepares an outbound transfer (compress, chunk, hash) and returns the FileMeta
    /// message to send. The transfer sits in `AwaitingAcceptance` until the peer ACKs.
    pub fn start_outbound(
        &mut self,
        dgp_session: u32,
        message_id: u32,
        filename: String,
        bytes: &[u8],
        chunk_size: u32,
        preferred: Option<Algorithm>,
    ) -> Result<DgpMessage, TransferError> {
        let transfer = OutboundTransfer::prepare(filename, bytes, chunk_size, preferred)
            .map_err(|_| TransferError::TooLarge)?;
        let meta = transfer.meta.clone();
        self.outbound.insert(dgp_session, transfer);
        Ok(meta_message(dgp_session, message_id, &meta))
    }

    /// Peer accepted: every chunk is now handed to the caller to queue on the AX.25
    /// session, and the transfer moves to `AwaitingCompletion` once they're all queued.
    pub fn on_accept(&mut self, dgp_session: u32, now: Instant) -> Vec<ChunkToSend> {
        let transfer = match self.outbound.get_mut(&dgp_session) {
            Some(t) => t,
            None => return Vec::new(),
        };
        transfer.accept();
        let chunks: Vec<ChunkToSend> = transfer
            .chunks
            .iter()
            .enumerate()
            .map(|(index, data)| ChunkToSend {
                index: index as u32,
                message: chunk_message(dgp_session, index as u32, index as u32, data),
            })
            .collect();
        transfer.all_chunks_queued(now);
        chunks
    }

    pub fn on_reject(&mut self, dgp_session: u32) {
        if let Some(transfer) = self.outbound.get_mut(&dgp_session) {
            transfer.reject();
        }
    }

    /// Called once per coordinator tick: returns a completion-request message for every
    /// outbound transfer due to re-probe (every 2 s while `AwaitingCompletion`).
    pub fn due_completion_requests(&mut self, now: Instant) -> Vec<(u32, DgpMessage)> {
        let mut out = Vec::new();
        for (&session, transfer) in self.outbound.iter_mut() {
            if transfer.should_send_completion_request(now) {
                transfer.mark_completion_request_sent(now);
                out.push((session, DgpMessage::new(MessageType::Ack, session, COMPLETION_REQUEST_ID)));
            }
        }
        out
    }

    pub fn on_completion_ack(&mut self, dgp_session: u32) {
        if let Some(transfer) = self.outbound.get_mut(&dgp_session) {
            transfer.on_completion_ack();
        }
    }

    /// Completion NACK carrying a SACK bitmap: resend exactly the missing chunks.
    pub fn on_completion_nack_with_sack(&mut self, dgp_session: u32, sack_bytes: Vec<u8>) -> Vec<ChunkToSend> {
        let transfer = match self.outbound.get(&dgp_session) {
            Some(t) => t,
            None => return Vec::new(),
        };
        let sack = SackBitmap::from_bytes(sack_bytes);
        transfer
            .missing_from_sack(&sack)
            .into_iter()
            .filter_map(|index| {
                transfer.chunks.get(index as usize).map(|data| ChunkToSend {
                    index,
                    message: chunk_message(dgp_session, index, index, data),
                })
            })
            .collect()
    }

    pub fn on_completion_nack_without_sack(&mut self, dgp_session: u32) {
        if let Some(transfer) = self.outbound.get_mut(&dgp_session) {
            transfer.on_completion_nack_without_sack();
        }
    }

    pub fn outbound_state(&self, dgp_session: u32) -> Option<SenderState> {
        self.outbound.get(&dgp_session).map(|t| t.state)
    }

    pub fn forget_outbound(&mut self, dgp_session: u32) {
        self.outbound.remove(&dgp_session);
    }

    // --- Receiver side -------------------------------------------------------------

    pub fn on_file_meta(&mut self, dgp_session: u32, meta: FileMeta, now: Instant) {
        self.inbound.insert(dgp_session, InboundTransfer::new(meta, now));
    }

    pub fn on_file_chunk(&mut self, dgp_session: u32, index: u32, data: Vec<u8>, crc: u32) {
        if let Some(transfer) = self.inbound.get_mut(&dgp_session) {
            transfer.receive_chunk(index, data, crc);
        }
    }

    /// Answers a completion request: reassembles and saves on success, or reports what's
    /// still missing via a SACK bitmap. Returns the response message plus the finished
    /// file's bytes and on-disk path when the transfer just completed.
    pub fn on_completion_request(
        &mut self,
        dgp_session: u32,
        message_id: u32,
    ) -> (DgpMessage, Option<(String, Vec<u8>)>) {
        let transfer = match self.inbound.get(&dgp_session) {
            Some(t) => t,
            None => return (DgpMessage::new(MessageType::Nack, dgp_session, message_id), None),
        };

        if !transfer.is_complete() {
            let sack = transfer.sack_bitmap();
            let message = DgpMessage::new(MessageType::Nack, dgp_session, COMPLETION_ACK_ID)
                .with_tlv(dgp::tlv::Tlv::new(dgp::tlv::TYPE_SACK_BITMAP, sack.bytes().to_vec()));
            return (message, None);
        }

        match transfer.finalize() {
            Ok(bytes) => match self.save(&transfer.meta.filename, &bytes) {
                Ok(saved_name) => {
                    let ack = DgpMessage::new(MessageType::Ack, dgp_session, COMPLETION_ACK_ID);
                    self.inbound.remove(&dgp_session);
                    (ack, Some((saved_name, bytes)))
                }
                Err(_) => (DgpMessage::new(MessageType::Nack, dgp_session, COMPLETION_ACK_ID), None),
            },
            Err(_) => (DgpMessage::new(MessageType::Nack, dgp_session, COMPLETION_ACK_ID), None),
        }
    }

    pub fn inbound_meta(&self, dgp_session: u32) -> Option<&FileMeta> {
        self.inbound.get(&dgp_session).map(|t| &t.meta)
    }

    /// `(chunks received so far, total chunks)` for an in-flight inbound transfer.
    pub fn inbound_progress(&self, dgp_session: u32) -> Option<(u32, u32)> {
        self.inbound.get(&dgp_session).map(|t| (t.received.len() as u32, t.meta.total_chunks))
    }

    pub fn forget_inbound(&mut self, dgp_session: u32) {
        self.inbound.remove(&dgp_session);
    }

    fn save(&self, requested_name: &str, bytes: &[u8]) -> std::io::Result<String> {
        fs::create_dir_all(&self.downloads_dir)?;
        let dir = self.downloads_dir.clone();
        let name = sanitize_and_dedupe_filename(requested_name, |candidate| {
            Path::new(&dir).join(candidate).exists()
        });
        fs::write(self.downloads_dir.join(&name), bytes)?;
        Ok(name)
    }
}

fn meta_message(dgp_session: u32, message_id: u32, meta: &FileMeta) -> DgpMessage {
    DgpMessage::new(MessageType::FileMeta, dgp_session, message_id)
        .with_tlv(dgp::tlv::Tlv::new(dgp::tlv::TYPE_METADATA, meta.encode()))
}

fn chunk_message(dgp_session: u32, message_id: u32, index: u32, data: &[u8]) -> DgpMessage {
    DgpMessage::new(MessageType::FileChunk, dgp_session, message_id)
        .with_tlv(dgp::tlv::Tlv::u32(dgp::tlv::TYPE_CHUNK_INDEX, index))
        .with_tlv(dgp::tlv::Tlv::new(dgp::tlv::TYPE_PAYLOAD, data.to_vec()))
        .with_tlv(dgp::tlv::Tlv::u32(dgp::tlv::TYPE_PAYLOAD_CRC32, crc32fast::hash(data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_stub::TempDir;

    #[test]
    fn outbound_transfer_reaches_awaiting_completion_after_accept() {
        let mut driver = TransferDriver::new(TempDir::new().path().to_path_buf());
        let meta_msg = driver
            .start_outbound(1, 1, "note.txt".to_string(), b"hello world", 4, None)
            .unwrap();
        assert!(matches!(meta_msg.message_type, MessageType::FileMeta));

        let now = Instant::now();
        let chunks = driver.on_accept(1, now);
        assert!(!chunks.is_empty());
        assert_eq!(driver.outbound_state(1), Some(SenderState::AwaitingCompletion));
    }

    #[test]
    fn full_transfer_round_trips_through_the_driver() {
        let dir = TempDir::new();
        let mut sender = TransferDriver::new(dir.path().to_path_buf());
        let mut receiver = TransferDriver::new(dir.path().to_path_buf());
        let now = Instant::now();

        let meta_msg = sender.start_outbound(7, 1, "greeting.txt".to_string(), b"hello there friend", 8, None).unwrap();
        let meta_tlv = meta_msg.find(dgp::tlv::TYPE_METADATA).unwrap();
        let meta = FileMeta::decode(&meta_tlv.value).unwrap();
        receiver.on_file_meta(7, meta, now);

        for chunk in sender.on_accept(7, now) {
            let index_tlv = chunk.message.find(dgp::tlv::TYPE_CHUNK_INDEX).unwrap().as_u32().unwrap();
            let payload = chunk.message.find(dgp::tlv::TYPE_PAYLOAD).unwrap().value.clone();
            let crc = chunk.message.find(dgp::tlv::TYPE_PAYLOAD_CRC32).unwrap().as_u32().unwrap();
            receiver.on_file_chunk(7, index_tlv, payload, crc);
        }

        let (response, saved) = receiver.on_completion_request(7, 99);
        assert!(matches!(response.message_type, MessageType::Ack));
        let (name, bytes) = saved.unwrap();
        assert_eq!(bytes, b"hello there friend");
        assert!(dir.path().join(&name).exists());
    }
}

#[cfg(test)]
mod tempfile_stub {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    /// A minimal scratch-directory helper for tests, since this workspace does not
    /// otherwise depend on the `tempfile` crate: creates a uniquely-named directory under
    /// the system temp dir and removes it on drop.
    pub struct TempDir(PathBuf);

    impl TempDir {
        pub fn new() -> TempDir {
            let id = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!("coordinator-transfer-test-{}-{}", std::process::id(), id));
            std::fs::create_dir_all(&path).expect("create temp dir");
            TempDir(path)
        }

        pub fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}
