//! AX.25 frame codec: address field encoding, control byte discrimination between
//! I/S/U frames, and the handful of fixed U-frame control patterns connected mode relies
//! on (SABM/UA/DISC/DM/FRMR) plus UI for connectionless traffic.

use crate::address::{Ax25Address, DigiPath};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

/// Default PID value meaning "no layer 3 protocol", used on every I-frame and UI-frame
/// this stack emits.
pub const PID_NO_LAYER3: u8 = 0xF0;

const SABM: u8 = 0x2F;
const SABME: u8 = 0x6F;
const DISC: u8 = 0x43;
const DM: u8 = 0x0F;
const UA: u8 = 0x63;
const UI: u8 = 0x03;
const FRMR: u8 = 0x87;

const S_RR: u8 = 0b0000_0001;
const S_RNR: u8 = 0b0000_0101;
const S_REJ: u8 = 0b0000_1001;
const S_SREJ: u8 = 0b0000_1101;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated, need at least {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("malformed address field")]
    BadAddress,
    #[error("unrecognized U-frame control byte 0x{0:02x}")]
    BadControl(u8),
    #[error("digipeater path too long")]
    PathTooLong,
}

/// A parsed supervisory/information/unnumbered control field.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Control {
    Information { ns: u8, nr: u8, pf: bool },
    Supervisory { kind: SKind, nr: u8, pf: bool },
    Unnumbered { kind: UKind, pf: bool },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SKind {
    Rr,
    Rnr,
    Rej,
    Srej,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UKind {
    Sabm,
    Sabme,
    Disc,
    Dm,
    Ua,
    Ui,
    Frmr,
}

impl Control {
    pub fn decode(byte: u8) -> Result<Control, DecodeError> {
        if byte & 0x01 == 0 {
            // I-frame: NNN P SSS 0
            let ns = (byte >> 1) & 0x07;
            let pf = (byte & 0x10) != 0;
            let nr = (byte >> 5) & 0x07;
            Ok(Control::Information { ns, nr, pf })
        } else if byte & 0x02 == 0 {
            // S-frame: NNN P TT 0 1
            let kind = match (byte >> 2) & 0x03 {
                0b00 => SKind::Rr,
                0b01 => SKind::Rnr,
                0b10 => SKind::Rej,
                0b11 => SKind::Srej,
                _ => unreachable!(),
            };
            let pf = (byte & 0x10) != 0;
            let nr = (byte >> 5) & 0x07;
            Ok(Control::Supervisory { kind, nr, pf })
        } else {
            let pf = (byte & 0x10) != 0;
            let stripped = byte & !0x10;
            let kind = match stripped {
                SABM => UKind::Sabm,
                SABME => UKind::Sabme,
                DISC => UKind::Disc,
                DM => UKind::Dm,
                UA => UKind::Ua,
                UI => UKind::Ui,
                FRMR => UKind::Frmr,
                _ => return Err(DecodeError::BadControl(byte)),
            };
            Ok(Control::Unnumbered { kind, pf })
        }
    }

    pub fn encode(self) -> u8 {
        match self {
            Control::Information { ns, nr, pf } => {
                ((nr & 0x07) << 5) | (if pf { 0x10 } else { 0 }) | ((ns & 0x07) << 1)
            }
            Control::Supervisory { kind, nr, pf } => {
                let tt = match kind {
                    SKind::Rr => 0b00,
                    SKind::Rnr => 0b01,
                    SKind::Rej => 0b10,
                    SKind::Srej => 0b11,
                };
                ((nr & 0x07) << 5) | (if pf { 0x10 } else { 0 }) | (tt << 2) | 0b01
            }
            Control::Unnumbered { kind, pf } => {
                let base = match kind {
                    UKind::Sabm => SABM,
                    UKind::Sabme => SABME,
                    UKind::Disc => DISC,
                    UKind::Dm => DM,
                    UKind::Ua => UA,
                    UKind::Ui => UI,
                    UKind::Frmr => FRMR,
                };
                base | (if pf { 0x10 } else { 0 })
            }
        }
    }
}

/// A decoded (or to-be-encoded) AX.25 frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub destination: Ax25Address,
    pub source: Ax25Address,
    pub path: DigiPath,
    pub control: Control,
    /// Present on I-frames and UI-frames only.
    pub pid: Option<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encodes the address field: 7 bytes per station (destination, source, then the
    /// digipeater path), each callsign character left-shifted by one and padded with a
    /// shifted space, followed by an SSID byte. The end-of-address bit (LSB) is set only
    /// on the final address in the header.
    fn encode_addresses<W: Write>(mut out: W, dest: &Ax25Address, src: &Ax25Address, path: &DigiPath) -> io::Result<()> {
        let all: Vec<&Ax25Address> = std::iter::once(dest)
            .chain(std::iter::once(src))
            .chain(path.stations().iter())
            .collect();
        let last = all.len() - 1;
        for (idx, addr) in all.iter().enumerate() {
            let call_bytes = addr.call().as_bytes();
            for i in 0..6 {
                let ch = *call_bytes.get(i).unwrap_or(&b' ');
                out.write_u8(ch << 1)?;
            }
            let mut ssid_byte = 0x60 | (addr.ssid() << 1);
            if idx == last {
                ssid_byte |= 0x01;
            }
            out.write_u8(ssid_byte)?;
        }
        Ok(())
    }

    fn decode_addresses(data: &[u8]) -> Result<(Ax25Address, Ax25Address, DigiPath, usize), DecodeError> {
        let mut stations = Vec::new();
        let mut offset = 0;
        loop {
            if data.len() < offset + 7 {
                return Err(DecodeError::BadAddress);
            }
            let block = &data[offset..offset + 7];
            let call_chars: String = block[..6]
                .iter()
                .map(|b| (b >> 1) as char)
                .collect::<String>()
                .trim_end()
                .to_string();
            let ssid_byte = block[6];
            let ssid = (ssid_byte >> 1) & 0x0F;
            let addr = Ax25Address::new(&call_chars, ssid).map_err(|_| DecodeError::BadAddress)?;
            stations.push(addr);
            offset += 7;
            if ssid_byte & 0x01 != 0 {
                break;
            }
            if stations.len() > 2 + DigiPath::MAX_LEN {
                return Err(DecodeError::PathTooLong);
            }
        }
        if stations.len() < 2 {
            return Err(DecodeError::BadAddress);
        }
        let destination = stations.remove(0);
        let source = stations.remove(0);
        let path = DigiPath::new(stations).map_err(|_| DecodeError::PathTooLong)?;
        Ok((destination, source, path, offset))
    }

    /// Serializes this frame to wire bytes (no KISS framing applied).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        Self::encode_addresses(&mut out, &self.destination, &self.source, &self.path)
            .expect("writing to a Vec cannot fail");
        out.write_u8(self.control.encode()).expect("write to Vec");
        if let Some(pid) = self.pid {
            out.write_u8(pid).expect("write to Vec");
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses a complete AX.25 frame (address field, control byte, optional PID, payload)
    /// from `data`. `data` is expected to be exactly one deframed packet; there is no
    /// length prefix in AX.25 itself.
    pub fn decode(data: &[u8]) -> Result<Frame, DecodeError> {
        if data.len() < 15 {
            return Err(DecodeError::Truncated {
                need: 15,
                have: data.len(),
            });
        }
        let (destination, source, path, addr_len) = Self::decode_addresses(data)?;
        let mut cursor = Cursor::new(&data[addr_len..]);
        let control_byte = cursor
            .read_u8()
            .map_err(|_| DecodeError::Truncated { need: 1, have: 0 })?;
        let control = Control::decode(control_byte)?;

        let carries_pid = matches!(
            control,
            Control::Information { .. } | Control::Unnumbered { kind: UKind::Ui, .. }
        );

        let pid = if carries_pid {
            Some(
                cursor
                    .read_u8()
                    .map_err(|_| DecodeError::Truncated { need: 1, have: 0 })?,
            )
        } else {
            None
        };

        let mut payload = Vec::new();
        cursor.read_to_end(&mut payload).expect("read from slice cannot fail");

        Ok(Frame {
            destination,
            source,
            path,
            control,
            pid,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(call: &str, ssid: u8) -> Ax25Address {
        Ax25Address::new(call, ssid).unwrap()
    }

    #[test]
    fn control_byte_roundtrip_i_frame() {
        let ctrl = Control::Information { ns: 3, nr: 5, pf: true };
        let byte = ctrl.encode();
        assert_eq!(Control::decode(byte).unwrap(), ctrl);
    }

    #[test]
    fn control_byte_roundtrip_s_frame() {
        for kind in [SKind::Rr, SKind::Rnr, SKind::Rej, SKind::Srej] {
            let ctrl = Control::Supervisory { kind, nr: 4, pf: false };
            assert_eq!(Control::decode(ctrl.encode()).unwrap(), ctrl);
        }
    }

    #[test]
    fn u_frame_fixed_patterns() {
        assert_eq!(Control::Unnumbered { kind: UKind::Sabm, pf: true }.encode(), 0x2F | 0x10);
        assert_eq!(Control::Unnumbered { kind: UKind::Ua, pf: true }.encode(), 0x63 | 0x10);
        assert_eq!(Control::Unnumbered { kind: UKind::Disc, pf: true }.encode(), 0x43 | 0x10);
        assert_eq!(Control::Unnumbered { kind: UKind::Dm, pf: false }.encode(), 0x0F);
    }

    #[test]
    fn frame_roundtrip_i_frame_with_payload() {
        let frame = Frame {
            destination: addr("N0BBB", 2),
            source: addr("N0AAA", 1),
            path: DigiPath::direct(),
            control: Control::Information { ns: 0, nr: 0, pf: true },
            pid: Some(PID_NO_LAYER3),
            payload: b"hi\r".to_vec(),
        };
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.destination, frame.destination);
        assert_eq!(decoded.source, frame.source);
        assert_eq!(decoded.control, frame.control);
        assert_eq!(decoded.pid, frame.pid);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn frame_roundtrip_with_digipeater_path() {
        let frame = Frame {
            destination: addr("N0BBB", 0),
            source: addr("N0AAA", 0),
            path: DigiPath::new(vec![addr("WIDE1", 1), addr("WIDE2", 2)]).unwrap(),
            control: Control::Unnumbered { kind: UKind::Ui, pf: false },
            pid: Some(PID_NO_LAYER3),
            payload: b"AXDP?\r".to_vec(),
        };
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.path, frame.path);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn end_of_address_bit_set_on_final_station_only() {
        let frame = Frame {
            destination: addr("N0BBB", 0),
            source: addr("N0AAA", 0),
            path: DigiPath::new(vec![addr("WIDE1", 1)]).unwrap(),
            control: Control::Unnumbered { kind: UKind::Ui, pf: false },
            pid: Some(PID_NO_LAYER3),
            payload: vec![],
        };
        let encoded = frame.encode();
        // destination SSID byte (offset 6) must not have end-of-address set
        assert_eq!(encoded[6] & 0x01, 0);
        // source SSID byte (offset 13) must not have end-of-address set (digi follows)
        assert_eq!(encoded[13] & 0x01, 0);
        // final digi SSID byte (offset 20) must have end-of-address set
        assert_eq!(encoded[20] & 0x01, 1);
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        assert!(Frame::decode(&[0u8; 5]).is_err());
    }
}
