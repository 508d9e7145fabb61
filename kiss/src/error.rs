#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("device path {0:?} not found")]
    DeviceNotFound(String),
    #[error("device path {0:?} is already claimed by another transport")]
    AlreadyClaimed(String),
    #[error("open failed, errno {0}")]
    OpenFailed(i32),
    #[error("blocking open timed out after {0:?}")]
    OpenTimeout(std::time::Duration),
    #[error("failed to configure device: {0}")]
    ConfigFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("transport is not open")]
    NotOpen,
}

impl TransportError {
    /// Write errors signalling the device itself vanished (unplugged dongle, dead
    /// Bluetooth link) should trigger disconnect + reconnect rather than just being
    /// reported with the port left open.
    pub fn indicates_lost_device(&self) -> bool {
        match self {
            TransportError::WriteFailed(io_err) => matches!(
                io_err.raw_os_error(),
                Some(code) if code == libc::ENXIO || code == libc::EIO
            ),
            _ => false,
        }
    }
}
