//! `FileMeta`: the nested TLV describing an incoming file transfer before any chunk data
//! arrives. Encoded as its own small TLV stream so it can be carried as the value of the
//! outer `Metadata` TLV.

use crate::compression::Algorithm;
use crate::error::DecodeError;
use crate::tlv::{self, Tlv};

const FIELD_FILENAME: u8 = 0x01;
const FIELD_ORIGINAL_SIZE: u8 = 0x02;
const FIELD_SHA256: u8 = 0x03;
const FIELD_CHUNK_SIZE: u8 = 0x04;
const FIELD_TOTAL_CHUNKS: u8 = 0x05;
const FIELD_COMPRESSION: u8 = 0x06;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileMeta {
    pub filename: String,
    pub original_size: u32,
    pub sha256: [u8; 32],
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub compression: Algorithm,
}

impl FileMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        Tlv::new(FIELD_FILENAME, self.filename.as_bytes().to_vec()).encode(&mut out);
        Tlv::u32(FIELD_ORIGINAL_SIZE, self.original_size).encode(&mut out);
        Tlv::new(FIELD_SHA256, self.sha256.to_vec()).encode(&mut out);
        Tlv::u32(FIELD_CHUNK_SIZE, self.chunk_size).encode(&mut out);
        Tlv::u32(FIELD_TOTAL_CHUNKS, self.total_chunks).encode(&mut out);
        Tlv::u8(FIELD_COMPRESSION, self.compression.to_u8()).encode(&mut out);
        out
    }

    pub fn decode(data: &[u8]) -> Result<FileMeta, DecodeError> {
        let fields = tlv::decode_all(data)?;

        let filename = tlv::find(&fields, FIELD_FILENAME)
            .map(|t| String::from_utf8_lossy(&t.value).into_owned())
            .ok_or(DecodeError::BadTlv(FIELD_FILENAME))?;
        let original_size = tlv::find(&fields, FIELD_ORIGINAL_SIZE)
            .and_then(Tlv::as_u32)
            .ok_or(DecodeError::BadTlv(FIELD_ORIGINAL_SIZE))?;
        let sha_tlv = tlv::find(&fields, FIELD_SHA256).ok_or(DecodeError::BadTlv(FIELD_SHA256))?;
        let mut sha256 = [0u8; 32];
        if sha_tlv.value.len() != 32 {
            return Err(DecodeError::BadTlv(FIELD_SHA256));
        }
        sha256.copy_from_slice(&sha_tlv.value);
        let chunk_size = tlv::find(&fields, FIELD_CHUNK_SIZE)
            .and_then(Tlv::as_u32)
            .ok_or(DecodeError::BadTlv(FIELD_CHUNK_SIZE))?;
        let total_chunks = tlv::find(&fields, FIELD_TOTAL_CHUNKS)
            .and_then(Tlv::as_u32)
            .ok_or(DecodeError::BadTlv(FIELD_TOTAL_CHUNKS))?;
        let compression = tlv::find(&fields, FIELD_COMPRESSION)
            .and_then(Tlv::as_u8)
            .and_then(Algorithm::from_u8)
            .ok_or(DecodeError::BadTlv(FIELD_COMPRESSION))?;

        Ok(FileMeta { filename, original_size, sha256, chunk_size, total_chunks, compression })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let meta = FileMeta {
            filename: "photo.jpg".to_string(),
            original_size: 600,
            sha256: [7u8; 32],
            chunk_size: 128,
            total_chunks: 5,
            compression: Algorithm::None,
        };
        let decoded = FileMeta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }
}
