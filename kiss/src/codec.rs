//! KISS byte-level framing: `FEND` (0xC0) delimits frames; inside a frame, 0xC0 and 0xDB
//! are escaped as `FESC TFEND` / `FESC TFESC`. The first byte of a decoded frame is
//! `port<<4 | cmd`.

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

pub const CMD_DATA: u8 = 0x00;
pub const CMD_TX_DELAY: u8 = 0x01;
pub const CMD_PERSISTENCE: u8 = 0x02;
pub const CMD_SLOT_TIME: u8 = 0x03;
pub const CMD_DUPLEX: u8 = 0x05;
pub const CMD_VENDOR_HW: u8 = 0x06;
pub const CMD_RESET: u8 = 0xFF;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum KissError {
    #[error("frame contains an unescaped FEND byte")]
    UnescapedFend,
    #[error("frame ends with a dangling escape byte")]
    DanglingEscape,
    #[error("frame is empty")]
    Empty,
}

/// A decoded KISS frame: which TNC port it targets, which command, and the (already
/// unescaped) payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KissFrame {
    pub port: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl KissFrame {
    pub fn data(port: u8, payload: Vec<u8>) -> KissFrame {
        KissFrame { port, command: CMD_DATA, payload }
    }

    pub fn control(port: u8, command: u8, payload: Vec<u8>) -> KissFrame {
        KissFrame { port, command, payload }
    }
}

/// Encodes one KISS frame, including the leading and trailing `FEND` delimiters.
pub fn encode(frame: &KissFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.payload.len() + 4);
    out.push(FEND);
    escape_byte(&mut out, (frame.port << 4) | (frame.command & 0x0F));
    for &byte in &frame.payload {
        escape_byte(&mut out, byte);
    }
    out.push(FEND);
    out
}

#[inline]
fn escape_byte(out: &mut Vec<u8>, byte: u8) {
    match byte {
        FEND => {
            out.push(FESC);
            out.push(TFEND);
        }
        FESC => {
            out.push(FESC);
            out.push(TFESC);
        }
        other => out.push(other),
    }
}

/// Unescapes and splits the header byte off the body of a single already-delimited frame
/// (the body between two `FEND`s, exclusive).
fn decode_body(body: &[u8]) -> Result<KissFrame, KissError> {
    let mut unescaped = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(byte) = iter.next() {
        match byte {
            FEND => return Err(KissError::UnescapedFend),
            FESC => match iter.next() {
                Some(TFEND) => unescaped.push(FEND),
                Some(TFESC) => unescaped.push(FESC),
                Some(other) => unescaped.push(other),
                None => return Err(KissError::DanglingEscape),
            },
            other => unescaped.push(other),
        }
    }
    if unescaped.is_empty() {
        return Err(KissError::Empty);
    }
    let header = unescaped[0];
    Ok(KissFrame {
        port: header >> 4,
        command: header & 0x0F,
        payload: unescaped[1..].to_vec(),
    })
}

/// Incrementally deframes a byte stream into complete [`KissFrame`]s. Bytes are fed in as
/// they arrive from the transport; `feed` returns any frames that became complete.
/// Repeated `FEND`s (common as keepalive/idle padding) are silently collapsed rather than
/// yielding empty-frame errors.
#[derive(Debug, Default)]
pub struct Deframer {
    current: Vec<u8>,
    in_frame: bool,
}

impl Deframer {
    pub fn new() -> Deframer {
        Deframer::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<KissFrame, KissError>> {
        let mut out = Vec::new();
        for &byte in bytes {
            if byte == FEND {
                if self.in_frame && !self.current.is_empty() {
                    out.push(decode_body(&self.current));
                }
                self.current.clear();
                self.in_frame = true;
            } else if self.in_frame {
                self.current.push(byte);
            }
            // Bytes arriving before the first FEND are noise preceding synchronization;
            // they are dropped rather than buffered forever.
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_on_plain_payload() {
        let frame = KissFrame::data(0, b"hello".to_vec());
        let wire = encode(&frame);
        let mut deframer = Deframer::new();
        let decoded = deframer.feed(&wire);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap(), &frame);
    }

    #[test]
    fn encode_decode_roundtrip_with_fend_and_fesc_bytes_in_payload() {
        let frame = KissFrame::data(1, vec![0xC0, 0xDB, 0x00, 0xC0, 0xDB]);
        let wire = encode(&frame);
        let mut deframer = Deframer::new();
        let decoded = deframer.feed(&wire);
        assert_eq!(decoded.len(), 1);
        let recovered = decoded[0].as_ref().unwrap();
        assert_eq!(recovered.payload, frame.payload);
        assert_eq!(recovered.port, 1);
    }

    #[test]
    fn repeated_fend_bytes_do_not_yield_empty_frames() {
        let mut deframer = Deframer::new();
        let decoded = deframer.feed(&[FEND, FEND, FEND]);
        assert!(decoded.is_empty());
    }

    #[test]
    fn dangling_escape_is_reported() {
        let mut deframer = Deframer::new();
        // FEND, header byte, FESC with nothing after it, FEND
        let decoded = deframer.feed(&[FEND, 0x00, FESC, FEND]);
        assert_eq!(decoded, vec![Err(KissError::DanglingEscape)]);
    }

    #[test]
    fn frames_split_across_multiple_feed_calls() {
        let frame = KissFrame::data(0, b"split".to_vec());
        let wire = encode(&frame);
        let (first, second) = wire.split_at(wire.len() / 2);
        let mut deframer = Deframer::new();
        let mut decoded = deframer.feed(first);
        decoded.extend(deframer.feed(second));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap(), &frame);
    }

    #[test]
    fn command_byte_encodes_port_and_command_nibbles() {
        let frame = KissFrame::control(2, CMD_TX_DELAY, vec![50]);
        let wire = encode(&frame);
        // wire[0] is FEND, wire[1] is the header byte
        assert_eq!(wire[1], (2 << 4) | CMD_TX_DELAY);
    }
}
