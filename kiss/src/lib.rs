//! KISS serial transport: byte framing plus the serial-port open/reconnect state machine
//! described for a host<->TNC link. Carries no knowledge of AX.25 framing above the byte
//! level; the coordinator crate is the one that feeds `TransportEvent::FrameReceived`
//! payloads into the AX.25 frame decoder.

pub mod codec;
pub mod error;
pub mod registry;
pub mod transport;

pub use codec::{Deframer, KissError, KissFrame};
pub use error::TransportError;
pub use transport::{BaudRate, KissConfig, KissTransport, TransportEvent, TransportState, VendorConfig};
