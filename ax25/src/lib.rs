//! AX.25 connected-mode link layer: addressing, frame codec, adaptive RTO estimation and
//! the per-peer session state machine. This crate has no notion of a serial port or an
//! event loop -- [`session::Session`] is a pure state machine driven by [`session::Event`]
//! and producing [`session::Action`]s for a caller (the coordinator crate) to execute.

pub mod address;
pub mod frame;
pub mod rto;
pub mod session;

pub use address::{Ax25Address, AddressError, DigiPath, DigiPathError};
pub use frame::{Control, DecodeError, Frame, SKind, UKind, PID_NO_LAYER3};
pub use rto::RtoEstimator;
pub use session::{Action, Event, Session, SessionConfig, SessionError, SessionId, SessionKey, State, T1_GRACE};
