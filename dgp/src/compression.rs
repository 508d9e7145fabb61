//! Whole-file compression and the decompression-bomb guards that gate it. A transfer is
//! compressed once, as a single unit, before chunking -- there is no per-chunk
//! compression.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Per-message decompression cap (applies to DGP payloads that aren't file transfers).
pub const MESSAGE_DECOMPRESS_CAP: usize = 4 * 1024;
/// Whole-file decompression cap; file transfers are allowed to be much larger.
pub const FILE_DECOMPRESS_CAP: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Algorithm {
    None,
    Lz4,
    Zstd,
    Deflate,
}

impl Algorithm {
    pub fn to_u8(self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Lz4 => 1,
            Algorithm::Zstd => 2,
            Algorithm::Deflate => 3,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Algorithm> {
        Some(match byte {
            0 => Algorithm::None,
            1 => Algorithm::Lz4,
            2 => Algorithm::Zstd,
            3 => Algorithm::Deflate,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compressed stream error: {0}")]
    Io(#[from] io::Error),
    #[error("decompressed output exceeds declared original length")]
    ExceedsOriginalLength,
    #[error("decompressed output exceeds the absolute safety cap")]
    ExceedsAbsoluteCap,
}

/// Compresses `data` whole, choosing `algorithm`. Returns the compressed bytes.
pub fn compress(algorithm: Algorithm, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match algorithm {
        Algorithm::None => Ok(data.to_vec()),
        Algorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Algorithm::Zstd => zstd::encode_all(data, 0).map_err(CompressionError::Io),
        Algorithm::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish().map_err(CompressionError::Io)
        }
    }
}

/// Decompresses `data`, refusing to produce more than `min(original_length, cap)` bytes.
/// `original_length` is the value the sender declared in `FileMeta`/`OriginalLength`; an
/// attacker lying about it only hurts themselves, since the smaller of the two numbers
/// always wins.
pub fn decompress(
    algorithm: Algorithm,
    data: &[u8],
    original_length: usize,
    cap: usize,
) -> Result<Vec<u8>, CompressionError> {
    let limit = std::cmp::min(original_length, cap);
    if original_length > cap {
        return Err(CompressionError::ExceedsAbsoluteCap);
    }
    match algorithm {
        Algorithm::None => {
            if data.len() > limit {
                return Err(CompressionError::ExceedsOriginalLength);
            }
            Ok(data.to_vec())
        }
        Algorithm::Lz4 => {
            let decoded = lz4_flex::decompress_size_prepended(data)
                .map_err(|e| CompressionError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            bounded(decoded, limit)
        }
        Algorithm::Zstd => {
            let mut reader = zstd::Decoder::new(data)?;
            read_bounded(&mut reader, limit)
        }
        Algorithm::Deflate => {
            let mut reader = DeflateDecoder::new(data);
            read_bounded(&mut reader, limit)
        }
    }
}

fn bounded(data: Vec<u8>, limit: usize) -> Result<Vec<u8>, CompressionError> {
    if data.len() > limit {
        Err(CompressionError::ExceedsOriginalLength)
    } else {
        Ok(data)
    }
}

/// Reads at most `limit + 1` bytes from `reader`; if that succeeds in reading `limit + 1`
/// bytes, the stream decompresses to more than declared and we bail instead of trusting
/// it further.
fn read_bounded<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(std::cmp::min(limit, 1 << 16));
    let mut take = reader.take((limit + 1) as u64);
    take.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(CompressionError::ExceedsOriginalLength);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let compressed = compress(Algorithm::Deflate, &data).unwrap();
        let decompressed = decompress(Algorithm::Deflate, &compressed, data.len(), FILE_DECOMPRESS_CAP).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn lz4_roundtrip() {
        let data = vec![42u8; 2048];
        let compressed = compress(Algorithm::Lz4, &data).unwrap();
        let decompressed = decompress(Algorithm::Lz4, &compressed, data.len(), FILE_DECOMPRESS_CAP).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn decompression_bomb_rejected_by_original_length_cap() {
        let bomb_source = vec![0u8; 1024 * 1024];
        let compressed = compress(Algorithm::Deflate, &bomb_source).unwrap();
        // Sender declares a tiny original length; real decompressed size blows past it.
        let result = decompress(Algorithm::Deflate, &compressed, 2048, FILE_DECOMPRESS_CAP);
        assert!(result.is_err());
    }

    #[test]
    fn declared_length_exceeding_the_absolute_cap_is_rejected_outright() {
        let result = decompress(Algorithm::None, &[], FILE_DECOMPRESS_CAP + 1, FILE_DECOMPRESS_CAP);
        assert!(matches!(result, Err(CompressionError::ExceedsAbsoluteCap)));
    }

    #[test]
    fn uncompressed_passthrough_still_enforces_the_cap() {
        let data = vec![1u8; 16];
        let result = decompress(Algorithm::None, &data, 8, FILE_DECOMPRESS_CAP);
        assert!(result.is_err());
    }
}
