//! The DGP wire message: `MAGIC || TLV*`. Required TLVs (MessageType, SessionId,
//! MessageId) are always emitted first, in that order; everything else is optional and
//! round-trips opaquely when this crate doesn't recognize it.

use crate::error::DecodeError;
use crate::tlv::{self, Tlv, TYPE_MESSAGE_ID, TYPE_MESSAGE_TYPE, TYPE_SESSION_ID};

pub const MAGIC: [u8; 4] = [0x41, 0x58, 0x54, 0x31];

/// Sentinel message ids reserved for the file-transfer completion handshake; they must
/// never be reused as an ordinary chunk/message id.
pub const COMPLETION_REQUEST_ID: u32 = 0xFFFF_FFFE;
pub const COMPLETION_ACK_ID: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageType {
    Chat,
    FileMeta,
    FileChunk,
    Ack,
    Nack,
    Ping,
    Pong,
    PeerEnabled,
    PeerDisabled,
}

impl MessageType {
    fn to_u8(self) -> u8 {
        match self {
            MessageType::Chat => 0,
            MessageType::FileMeta => 1,
            MessageType::FileChunk => 2,
            MessageType::Ack => 3,
            MessageType::Nack => 4,
            MessageType::Ping => 5,
            MessageType::Pong => 6,
            MessageType::PeerEnabled => 7,
            MessageType::PeerDisabled => 8,
        }
    }

    fn from_u8(byte: u8) -> Option<MessageType> {
        Some(match byte {
            0 => MessageType::Chat,
            1 => MessageType::FileMeta,
            2 => MessageType::FileChunk,
            3 => MessageType::Ack,
            4 => MessageType::Nack,
            5 => MessageType::Ping,
            6 => MessageType::Pong,
            7 => MessageType::PeerEnabled,
            8 => MessageType::PeerDisabled,
            _ => return None,
        })
    }
}

/// A decoded DGP message: the three required fields pulled out, plus every TLV (including
/// the required ones) preserved verbatim in `tlvs` so re-encoding is lossless.
#[derive(Debug, Clone)]
pub struct DgpMessage {
    pub message_type: MessageType,
    pub session_id: u32,
    pub message_id: u32,
    pub tlvs: Vec<Tlv>,
}

impl DgpMessage {
    pub fn new(message_type: MessageType, session_id: u32, message_id: u32) -> DgpMessage {
        DgpMessage { message_type, session_id, message_id, tlvs: Vec::new() }
    }

    pub fn with_tlv(mut self, tlv: Tlv) -> DgpMessage {
        self.tlvs.push(tlv);
        self
    }

    pub fn find(&self, tag: u8) -> Option<&Tlv> {
        tlv::find(&self.tlvs, tag)
    }

    /// Encodes the magic header followed by the three required TLVs (in the fixed order
    /// the wire format mandates) and then every optional TLV that was attached.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.tlvs.iter().map(|t| t.value.len() + 3).sum::<usize>());
        out.extend_from_slice(&MAGIC);
        Tlv::u8(TYPE_MESSAGE_TYPE, self.message_type.to_u8()).encode(&mut out);
        Tlv::u32(TYPE_SESSION_ID, self.session_id).encode(&mut out);
        Tlv::u32(TYPE_MESSAGE_ID, self.message_id).encode(&mut out);
        for tlv in &self.tlvs {
            tlv.encode(&mut out);
        }
        out
    }

    /// Decodes one message from the front of `data`. Returns the message and how many
    /// bytes of `data` it consumed; trailing bytes are left for the caller (reassembly
    /// buffers may hold more than one message back-to-back).
    pub fn decode(data: &[u8]) -> Result<(DgpMessage, usize), DecodeError> {
        if data.len() < MAGIC.len() {
            return Err(DecodeError::Truncated { need: MAGIC.len(), have: data.len() });
        }
        if data[..MAGIC.len()] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let body = &data[MAGIC.len()..];
        // `body` may hold more than just this message -- the reassembler feeds the whole
        // delivered buffer, which can include a second message's magic right after this
        // one's TLVs. `decode_prefix` stops at the first TLV that doesn't fit rather than
        // erroring on it, so the boundary falls out naturally instead of needing a
        // separate length prefix on the wire.
        let (tlvs, consumed_body) = tlv::decode_prefix(body);

        let message_type = tlv::find(&tlvs, TYPE_MESSAGE_TYPE)
            .and_then(Tlv::as_u8)
            .and_then(MessageType::from_u8)
            .ok_or(DecodeError::BadTlv(TYPE_MESSAGE_TYPE))?;
        let session_id = tlv::find(&tlvs, TYPE_SESSION_ID)
            .and_then(Tlv::as_u32)
            .ok_or(DecodeError::BadTlv(TYPE_SESSION_ID))?;
        let message_id = tlv::find(&tlvs, TYPE_MESSAGE_ID)
            .and_then(Tlv::as_u32)
            .ok_or(DecodeError::BadTlv(TYPE_MESSAGE_ID))?;

        let consumed = MAGIC.len() + consumed_body;

        Ok((
            DgpMessage { message_type, session_id, message_id, tlvs },
            consumed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::TYPE_PAYLOAD;

    #[test]
    fn encode_decode_roundtrip() {
        let msg = DgpMessage::new(MessageType::Chat, 7, 99).with_tlv(Tlv::new(TYPE_PAYLOAD, b"hi".to_vec()));
        let (decoded, consumed) = DgpMessage::decode(&msg.encode()).unwrap();
        assert_eq!(consumed, msg.encode().len());
        assert_eq!(decoded.session_id, 7);
        assert_eq!(decoded.message_id, 99);
        assert_eq!(decoded.find(TYPE_PAYLOAD).unwrap().value, b"hi");
    }

    #[test]
    fn required_tlvs_are_emitted_first_in_order() {
        let msg = DgpMessage::new(MessageType::Ping, 1, 2);
        let wire = msg.encode();
        assert_eq!(&wire[0..4], &MAGIC);
        assert_eq!(wire[4], TYPE_MESSAGE_TYPE);
        // MessageType TLV is tag+len+1-byte value = 4 bytes, starting right after magic.
        assert_eq!(wire[8], TYPE_SESSION_ID);
        // SessionId TLV is tag+len+4-byte value = 7 bytes, starting at offset 8.
        assert_eq!(wire[15], TYPE_MESSAGE_ID);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut wire = DgpMessage::new(MessageType::Ping, 1, 2).encode();
        wire[0] = 0x00;
        assert!(matches!(DgpMessage::decode(&wire), Err(DecodeError::BadMagic)));
    }

    #[test]
    fn trailing_bytes_are_left_for_the_caller() {
        let msg = DgpMessage::new(MessageType::Ping, 1, 2);
        let mut wire = msg.encode();
        wire.extend_from_slice(b"next message starts here");
        let (_, consumed) = DgpMessage::decode(&wire).unwrap();
        assert!(consumed < wire.len());
    }

    #[test]
    fn decodes_the_first_of_two_back_to_back_messages() {
        let first = DgpMessage::new(MessageType::Chat, 1, 1).with_tlv(Tlv::new(TYPE_PAYLOAD, b"hi".to_vec()));
        let second = DgpMessage::new(MessageType::Chat, 1, 2).with_tlv(Tlv::new(TYPE_PAYLOAD, b"there".to_vec()));
        let mut wire = first.encode();
        let boundary = wire.len();
        wire.extend_from_slice(&second.encode());

        let (decoded, consumed) = DgpMessage::decode(&wire).unwrap();
        assert_eq!(consumed, boundary);
        assert_eq!(decoded.message_id, 1);
        assert_eq!(decoded.find(TYPE_PAYLOAD).unwrap().value, b"hi");

        let (decoded_second, consumed_second) = DgpMessage::decode(&wire[consumed..]).unwrap();
        assert_eq!(consumed_second, second.encode().len());
        assert_eq!(decoded_second.message_id, 2);
    }
}
