//! `SessionEvent`: the single outward-facing event type the coordinator publishes, in
//! place of the separate `onSendFrame` / `onDataDelivered` / `onSessionStateChanged`
//! callbacks the source kept as distinct hooks. A caller (the `dgpd` daemon loop, or a
//! test) drains these the same way [`kiss::TransportEvent`] is drained from the serial
//! transport.

use ax25::{Frame, SessionId, State};
use dgp::DgpMessage;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged { session: SessionId, state: State },
    DataDelivered { session: SessionId, payload: Vec<u8> },
    LinkFailure { session: SessionId },
    FrameToSend(Frame),
    DgpMessageReceived { session: SessionId, message: DgpMessage },
    CapabilityConfirmed { peer: String },
    TransferAcceptRequest { session: SessionId, dgp_session: u32, filename: String, size: u32 },
    TransferProgress { session: SessionId, dgp_session: u32, received_chunks: u32, total_chunks: u32 },
    TransferCompleted { session: SessionId, dgp_session: u32, filename: String, bytes: Vec<u8> },
    TransferFailed { session: SessionId, dgp_session: u32, reason: String },
    Error(String),
}
