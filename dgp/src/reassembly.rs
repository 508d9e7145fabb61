//! Extracts framed DGP messages out of the in-order byte stream the AX.25 session
//! delivers. One [`Reassembler`] per (source, path) -- out-of-window frames never reach
//! here, so the buffer only ever needs to handle strictly sequential bytes.

use crate::message::DgpMessage;

pub const MAX_BUFFER: usize = 65_536;

pub struct Reassembler {
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler { buffer: Vec::new() }
    }

    /// Appends newly delivered bytes and extracts every complete message now available.
    /// Plain-text traffic (a buffer that never starts with MAGIC) is discarded rather than
    /// accumulated forever.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DgpMessage> {
        self.buffer.extend_from_slice(bytes);

        if !self.buffer.starts_with(&crate::message::MAGIC) {
            match find_magic(&self.buffer) {
                Some(offset) => {
                    self.buffer.drain(0..offset);
                }
                None => {
                    self.buffer.clear();
                    return Vec::new();
                }
            }
        }

        let mut messages = Vec::new();
        loop {
            if !self.buffer.starts_with(&crate::message::MAGIC) {
                break;
            }
            match DgpMessage::decode(&self.buffer) {
                Ok((message, consumed)) => {
                    self.buffer.drain(0..consumed);
                    messages.push(message);
                }
                Err(_) => break,
            }
        }

        if self.buffer.len() > MAX_BUFFER {
            self.buffer.clear();
        }

        messages
    }

    /// Discards any partial message in flight. Called when the owning session
    /// disconnects, so stale bytes can't corrupt a future session to the same peer.
    pub fn flush(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler::new()
    }
}

fn find_magic(buffer: &[u8]) -> Option<usize> {
    let magic = &crate::message::MAGIC;
    if buffer.len() < magic.len() {
        return None;
    }
    buffer.windows(magic.len()).position(|window| window == magic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn extracts_one_complete_message() {
        let msg = DgpMessage::new(MessageType::Chat, 1, 1);
        let mut reassembler = Reassembler::new();
        let decoded = reassembler.feed(&msg.encode());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].session_id, 1);
    }

    #[test]
    fn incomplete_message_waits_for_more_bytes() {
        let msg = DgpMessage::new(MessageType::Chat, 1, 1);
        let wire = msg.encode();
        let (first, second) = wire.split_at(wire.len() - 2);
        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed(first).is_empty());
        let decoded = reassembler.feed(second);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn plain_text_traffic_with_no_magic_is_discarded() {
        let mut reassembler = Reassembler::new();
        let decoded = reassembler.feed(b"hello there, human\r\n");
        assert!(decoded.is_empty());
        assert!(reassembler.buffer.is_empty());
    }

    #[test]
    fn extracts_two_messages_delivered_in_a_single_feed() {
        let first = DgpMessage::new(MessageType::Chat, 1, 1);
        let second = DgpMessage::new(MessageType::Chat, 1, 2);
        let mut wire = first.encode();
        wire.extend_from_slice(&second.encode());

        let mut reassembler = Reassembler::new();
        let decoded = reassembler.feed(&wire);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].message_id, 1);
        assert_eq!(decoded[1].message_id, 2);
        assert!(reassembler.buffer.is_empty());
    }

    #[test]
    fn resyncs_past_garbage_prefix() {
        let msg = DgpMessage::new(MessageType::Ping, 2, 3);
        let mut wire = b"garbage-before-magic-".to_vec();
        wire.extend_from_slice(&msg.encode());
        let mut reassembler = Reassembler::new();
        let decoded = reassembler.feed(&wire);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].session_id, 2);
    }

    #[test]
    fn overflow_past_hard_cap_drops_the_buffer() {
        let mut reassembler = Reassembler::new();
        let mut garbage = crate::message::MAGIC.to_vec();
        garbage.extend(vec![0u8; MAX_BUFFER + 10]);
        reassembler.feed(&garbage);
        assert!(reassembler.buffer.len() <= MAX_BUFFER || reassembler.buffer.is_empty());
    }

    #[test]
    fn flush_clears_partial_state() {
        let msg = DgpMessage::new(MessageType::Chat, 1, 1);
        let wire = msg.encode();
        let mut reassembler = Reassembler::new();
        reassembler.feed(&wire[..wire.len() - 1]);
        reassembler.flush();
        assert!(reassembler.buffer.is_empty());
    }
}
