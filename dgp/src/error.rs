#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated DGP message, need at least {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad magic header")]
    BadMagic,
    #[error("malformed TLV of type {0}")]
    BadTlv(u8),
    #[error("checksum mismatch")]
    BadChecksum,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer was rejected by the peer")]
    Rejected,
    #[error("chunk checksum mismatch")]
    ChecksumMismatch,
    #[error("reassembled file hash did not match FileMeta")]
    HashMismatch,
    #[error("failed to save received file: {0}")]
    SaveFailed(String),
    #[error("transfer was cancelled locally")]
    Cancelled,
    #[error("transfer was cancelled by the peer")]
    PeerCancelled,
    #[error("transfer exceeds configured size limits")]
    TooLarge,
}
