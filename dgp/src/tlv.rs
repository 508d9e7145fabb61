//! TLV primitives shared by every DGP message: `type: u8, length: u16be, value: [u8]`.
//! Unknown types are preserved opaquely rather than rejected, per the wire format's
//! forward-compatibility rule.

use crate::error::DecodeError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const TYPE_MESSAGE_TYPE: u8 = 0x01;
pub const TYPE_SESSION_ID: u8 = 0x02;
pub const TYPE_MESSAGE_ID: u8 = 0x03;
pub const TYPE_CHUNK_INDEX: u8 = 0x04;
pub const TYPE_TOTAL_CHUNKS: u8 = 0x05;
pub const TYPE_PAYLOAD: u8 = 0x06;
pub const TYPE_PAYLOAD_CRC32: u8 = 0x07;
pub const TYPE_SACK_BITMAP: u8 = 0x08;
pub const TYPE_METADATA: u8 = 0x09;
pub const TYPE_CAPABILITIES: u8 = 0x20;
pub const TYPE_ACKED_MESSAGE_ID: u8 = 0x21;
pub const TYPE_COMPRESSION: u8 = 0x30;
pub const TYPE_ORIGINAL_LENGTH: u8 = 0x31;
pub const TYPE_PAYLOAD_COMPRESSED: u8 = 0x32;
pub const TYPE_TRANSFER_METRICS: u8 = 0x40;

/// One decoded type-length-value entry. Callers that recognize `tag` interpret `value`
/// themselves; everyone else just carries it along on re-encode.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Tlv {
    pub tag: u8,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tag: u8, value: Vec<u8>) -> Tlv {
        Tlv { tag, value }
    }

    pub fn u8(tag: u8, value: u8) -> Tlv {
        Tlv { tag, value: vec![value] }
    }

    pub fn u32(tag: u8, value: u32) -> Tlv {
        let mut buf = Vec::with_capacity(4);
        buf.write_u32::<BigEndian>(value).expect("write to Vec");
        Tlv { tag, value: buf }
    }

    pub fn as_u8(&self) -> Option<u8> {
        self.value.first().copied()
    }

    pub fn as_u32(&self) -> Option<u32> {
        if self.value.len() < 4 {
            return None;
        }
        Cursor::new(&self.value).read_u32::<BigEndian>().ok()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_u8(self.tag).expect("write to Vec");
        out.write_u16::<BigEndian>(self.value.len() as u16).expect("write to Vec");
        out.extend_from_slice(&self.value);
    }
}

/// Decodes every TLV from `data`, in order. Stops cleanly at the end of the buffer;
/// returns an error only on a truncated length/value (the value's advertised length runs
/// past the end of `data`).
pub fn decode_all(data: &[u8]) -> Result<Vec<Tlv>, DecodeError> {
    let mut tlvs = Vec::new();
    let mut cursor = Cursor::new(data);
    while (cursor.position() as usize) < data.len() {
        let tag = cursor.read_u8().map_err(|_| DecodeError::Truncated { need: 1, have: 0 })?;
        let len = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| DecodeError::Truncated { need: 2, have: 0 })? as usize;
        let start = cursor.position() as usize;
        let end = start + len;
        if end > data.len() {
            return Err(DecodeError::Truncated { need: len, have: data.len() - start });
        }
        tlvs.push(Tlv::new(tag, data[start..end].to_vec()));
        cursor.set_position(end as u64);
    }
    Ok(tlvs)
}

pub fn find<'a>(tlvs: &'a [Tlv], tag: u8) -> Option<&'a Tlv> {
    tlvs.iter().find(|t| t.tag == tag)
}

/// Decodes as many complete TLVs as fit at the front of `data`, stopping (without error) at
/// the first one that doesn't fully fit. Unlike [`decode_all`], this never fails on
/// trailing bytes -- callers pass it a buffer that may hold a whole message followed by
/// more of the stream (the next message's magic, or bytes not yet delivered), and "the next
/// TLV doesn't fit" is exactly how the end of the current message is found. Returns the
/// TLVs found plus how many bytes they consumed.
pub fn decode_prefix(data: &[u8]) -> (Vec<Tlv>, usize) {
    let mut tlvs = Vec::new();
    let mut pos = 0usize;
    loop {
        if pos + 3 > data.len() {
            break;
        }
        let tag = data[pos];
        let len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        let start = pos + 3;
        let end = start + len;
        if end > data.len() {
            break;
        }
        tlvs.push(Tlv::new(tag, data[start..end].to_vec()));
        pos = end;
    }
    (tlvs, pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let tlvs = vec![Tlv::u8(TYPE_MESSAGE_TYPE, 5), Tlv::u32(TYPE_SESSION_ID, 42)];
        let mut out = Vec::new();
        for tlv in &tlvs {
            tlv.encode(&mut out);
        }
        let decoded = decode_all(&out).unwrap();
        assert_eq!(decoded, tlvs);
    }

    #[test]
    fn unknown_tag_is_preserved_opaquely() {
        let tlv = Tlv::new(0xEE, vec![1, 2, 3]);
        let mut out = Vec::new();
        tlv.encode(&mut out);
        let decoded = decode_all(&out).unwrap();
        assert_eq!(decoded[0], tlv);
    }

    #[test]
    fn truncated_value_is_an_error() {
        let mut out = Vec::new();
        out.write_u8(TYPE_PAYLOAD).unwrap();
        out.write_u16::<BigEndian>(10).unwrap();
        out.extend_from_slice(&[1, 2, 3]);
        assert!(decode_all(&out).is_err());
    }

    #[test]
    fn decode_prefix_stops_cleanly_at_trailing_bytes_that_do_not_fit() {
        let mut out = Vec::new();
        Tlv::u8(TYPE_MESSAGE_TYPE, 5).encode(&mut out);
        let boundary = out.len();
        // Bytes that look like the start of a TLV but whose advertised length overruns
        // the buffer -- exactly what the next message's magic looks like.
        out.extend_from_slice(&[0x41, 0x58, 0x54]);
        let (tlvs, consumed) = decode_prefix(&out);
        assert_eq!(tlvs, vec![Tlv::u8(TYPE_MESSAGE_TYPE, 5)]);
        assert_eq!(consumed, boundary);
    }
}
