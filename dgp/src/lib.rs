//! The Datagram Protocol (DGP): a TLV/magic-header application layer carried over AX.25
//! I-frames (reassembled from the in-order byte stream) or UI frames (connectionless).
//! Provides capability negotiation, whole-file compression with per-chunk CRC32 and
//! selective-ACK recovery, and chat messages. This crate has no notion of AX.25 or the
//! serial transport beneath it -- the coordinator crate is the one that feeds delivered
//! bytes in and pulls [`message::DgpMessage`]s and outbound frames out.

pub mod capability;
pub mod compression;
pub mod dedupe;
pub mod error;
pub mod filemeta;
pub mod message;
pub mod reassembly;
pub mod tlv;
pub mod transfer;

pub use capability::{Capabilities, CapabilityStore, PeerStatus};
pub use compression::Algorithm;
pub use dedupe::{Dedupe, MessageKey};
pub use error::{DecodeError, TransferError};
pub use filemeta::FileMeta;
pub use message::{DgpMessage, MessageType, COMPLETION_ACK_ID, COMPLETION_REQUEST_ID, MAGIC};
pub use reassembly::Reassembler;
pub use tlv::Tlv;
pub use transfer::{InboundTransfer, OutboundTransfer, SackBitmap, SenderState};
