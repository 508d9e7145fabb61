//! Wires the AX.25 session engine, the KISS-delivered/UI-delivered frame traffic, and the
//! DGP application layer together. [`Coordinator`] owns the session table and every piece
//! of per-peer bookkeeping (reassembly, dedup, capability negotiation, file transfers,
//! adaptive parameters); callers feed it inbound frames and timer ticks and drain
//! [`SessionEvent`]s in return, the same drive-and-drain shape [`ax25::Session::handle`]
//! and [`kiss::KissTransport::sync`] already use.

pub mod adaptive;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod timers;
pub mod transfer;

pub use adaptive::{AdaptiveCache, LinkSample, RouteKey};
pub use dispatch::SessionTable;
pub use error::CoordinatorError;
pub use events::SessionEvent;
pub use negotiation::NegotiationDriver;
pub use timers::{TimerKind, TimerWheel};
pub use transfer::TransferDriver;

use ax25::{Action, Ax25Address, Control, DigiPath, Event, SKind, Session, SessionConfig, SessionId, SessionKey, State, UKind, PID_NO_LAYER3};
use dgp::capability::Capabilities;
use dgp::tlv::{self, Tlv};
use dgp::{Algorithm, Dedupe, DgpMessage, FileMeta, MessageKey, MessageType, Reassembler, COMPLETION_ACK_ID, COMPLETION_REQUEST_ID};
use flux::logging::{self, Logger};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Default)]
struct LinkStats {
    frames_sent: u32,
    retransmissions: u32,
}

pub struct Coordinator {
    local: Ax25Address,
    channel: u16,
    base_config: SessionConfig,
    auto_negotiate: bool,
    local_capabilities: Capabilities,

    sessions: SessionTable,
    timers: TimerWheel,
    negotiation: NegotiationDriver,
    transfers: TransferDriver,
    adaptive: AdaptiveCache,

    reassemblers: HashMap<SessionId, Reassembler>,
    dedupe: Dedupe,
    link_stats: HashMap<SessionId, LinkStats>,
    message_ids: HashMap<SessionId, u32>,

    logger: Logger,
    events: Vec<SessionEvent>,
}

impl Coordinator {
    pub fn new(local: Ax25Address, channel: u16, base_config: SessionConfig, downloads_dir: PathBuf, auto_negotiate: bool, logger: Logger) -> Coordinator {
        Coordinator {
            local,
            channel,
            base_config,
            auto_negotiate,
            local_capabilities: Capabilities { proto_max: 1, feature_bits: 0 },
            sessions: SessionTable::new(),
            timers: TimerWheel::new(),
            negotiation: NegotiationDriver::new(),
            transfers: TransferDriver::new(downloads_dir),
            adaptive: AdaptiveCache::new(),
            reassemblers: HashMap::new(),
            dedupe: Dedupe::default(),
            link_stats: HashMap::new(),
            message_ids: HashMap::new(),
            logger,
            events: Vec::new(),
        }
    }

    pub fn session_state(&self, session: SessionId) -> Option<State> {
        self.sessions.get(session).map(|s| s.state())
    }

    pub fn sessions_to(&self, destination: &Ax25Address) -> Vec<SessionId> {
        self.sessions.sessions_to(destination)
    }

    /// Drains every [`SessionEvent`] accumulated since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// The nearest pending T1/Grace/T3 deadline across every session, if any. A caller
    /// driving the event loop can block until this (or its own other wakeup sources) fires
    /// instead of ticking on a fixed cadence.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Opens a new outbound connected-mode session, applying whatever adaptive parameters
    /// this route has learned on top of the configured defaults.
    pub fn connect(&mut self, destination: Ax25Address, path: DigiPath, now: Instant) -> SessionId {
        let id = self.sessions.next_session_id();
        let key = SessionKey::new(destination.clone(), &path, self.channel);
        let route = RouteKey::new(&destination.to_string(), &path.signature());
        let config = self.adaptive.resolve(&route, &self.base_config, now);
        let mut session = Session::new(id, key, self.local.clone(), true, config);
        let actions = session.handle(Event::ConnectRequest, now);
        self.sessions.insert(session);
        self.reassemblers.insert(id, Reassembler::new());
        self.link_stats.insert(id, LinkStats::default());
        self.process_actions(id, actions, now);
        id
    }

    pub fn disconnect(&mut self, session: SessionId, now: Instant) -> Result<(), CoordinatorError> {
        self.drive(session, Event::DisconnectRequest, now)
    }

    pub fn force_disconnect(&mut self, session: SessionId, now: Instant) -> Result<(), CoordinatorError> {
        self.drive(session, Event::ForceDisconnect, now)
    }

    fn drive(&mut self, session: SessionId, event: Event, now: Instant) -> Result<(), CoordinatorError> {
        let actions = self
            .sessions
            .get_mut(session)
            .ok_or(CoordinatorError::UnknownSession)?
            .handle(event, now);
        self.process_actions(session, actions, now);
        Ok(())
    }

    pub fn send_chat(&mut self, session: SessionId, text: &str, now: Instant) -> Result<(), CoordinatorError> {
        if self.sessions.get(session).is_none() {
            return Err(CoordinatorError::UnknownSession);
        }
        let dgp_session = dgp_session_for(session);
        let message_id = self.next_message_id(session);
        let message = DgpMessage::new(MessageType::Chat, dgp_session, message_id)
            .with_tlv(Tlv::new(tlv::TYPE_PAYLOAD, text.as_bytes().to_vec()));
        self.send_dgp_message(session, message, now);
        Ok(())
    }

    pub fn start_file_transfer(
        &mut self,
        session: SessionId,
        filename: String,
        bytes: &[u8],
        chunk_size: u32,
        algorithm: Option<Algorithm>,
        now: Instant,
    ) -> Result<(), CoordinatorError> {
        if self.sessions.get(session).is_none() {
            return Err(CoordinatorError::UnknownSession);
        }
        let dgp_session = dgp_session_for(session);
        let message_id = self.next_message_id(session);
        let meta_message = self.transfers.start_outbound(dgp_session, message_id, filename, bytes, chunk_size, algorithm)?;
        self.send_dgp_message(session, meta_message, now);
        Ok(())
    }

    pub fn accept_transfer(&mut self, session: SessionId, now: Instant) -> Result<(), CoordinatorError> {
        if self.sessions.get(session).is_none() {
            return Err(CoordinatorError::UnknownSession);
        }
        let dgp_session = dgp_session_for(session);
        let chunks = self.transfers.on_accept(dgp_session, now);
        for chunk in chunks {
            self.send_dgp_message(session, chunk.message, now);
        }
        Ok(())
    }

    pub fn reject_transfer(&mut self, session: SessionId) {
        self.transfers.on_reject(dgp_session_for(session));
    }

    /// Hands a decoded AX.25 frame to the coordinator: UI traffic is routed straight to
    /// capability negotiation, everything else is matched against the session table and
    /// driven through the owning session's state machine.
    pub fn on_frame_received(&mut self, frame: ax25::Frame, now: Instant) {
        if let Control::Unnumbered { kind: UKind::Ui, .. } = frame.control {
            self.handle_ui_frame(frame, now);
            return;
        }

        let event = match frame.control {
            Control::Unnumbered { kind: UKind::Sabm, .. } | Control::Unnumbered { kind: UKind::Sabme, .. } => Event::InboundSabm,
            Control::Unnumbered { kind: UKind::Ua, .. } => Event::InboundUa,
            Control::Unnumbered { kind: UKind::Dm, .. } => Event::InboundDm,
            Control::Unnumbered { kind: UKind::Disc, .. } => Event::InboundDisc,
            Control::Information { ns, nr, pf } => Event::InboundI { ns, nr, pf, payload: frame.payload.clone() },
            Control::Supervisory { kind: SKind::Rr, nr, pf } => Event::InboundRr { nr, pf },
            Control::Supervisory { kind: SKind::Rej, nr, .. } => Event::InboundRej { nr },
            _ => {
                logging::debug!(self.logger, "ignoring unsupported control field"; "source" => frame.source.to_string());
                return;
            }
        };

        let id = match self.sessions.lookup_inbound(&frame.source, &frame.path, self.channel) {
            Some(id) => id,
            None if matches!(event, Event::InboundSabm) => self.accept_inbound(&frame, now),
            None => return,
        };

        if matches!(event, Event::InboundI { .. }) {
            if let Some(probe) = self.negotiation.on_inbound_iframe(&frame.source, now) {
                self.emit_corrected(probe);
            }
        }

        if let Some(actions) = self.sessions.get_mut(id).map(|s| s.handle(event, now)) {
            self.process_actions(id, actions, now);
        }
    }

    fn accept_inbound(&mut self, frame: &ax25::Frame, now: Instant) -> SessionId {
        let key = SessionKey::new(frame.source.clone(), &frame.path, self.channel);
        let route = RouteKey::new(&frame.source.to_string(), &frame.path.signature());
        let config = self.adaptive.resolve(&route, &self.base_config, now);
        let id = self.sessions.next_session_id();
        let session = Session::new(id, key, self.local.clone(), false, config);
        self.sessions.insert(session);
        self.reassemblers.insert(id, Reassembler::new());
        self.link_stats.insert(id, LinkStats::default());
        id
    }

    fn handle_ui_frame(&mut self, frame: ax25::Frame, now: Instant) {
        let peer = frame.source.clone();
        if frame.payload.starts_with(dgp::capability::PROBE_TEXT) {
            let pong = self.negotiation.build_pong(0, 0, self.local_capabilities);
            self.emit_ui(&peer, pong.encode());
            return;
        }
        if frame.payload.starts_with(&dgp::MAGIC) {
            if let Ok((message, _)) = DgpMessage::decode(&frame.payload) {
                match message.message_type {
                    MessageType::Pong => {
                        if let Some(caps) = message.find(tlv::TYPE_CAPABILITIES).and_then(Capabilities::from_tlv) {
                            let ping = self.negotiation.on_pong_received(&peer, caps, message.session_id, message.message_id);
                            self.emit_ui(&peer, ping.encode());
                            self.events.push(SessionEvent::CapabilityConfirmed { peer: peer.to_string() });
                        }
                    }
                    MessageType::Ping => {
                        if let Some(caps) = message.find(tlv::TYPE_CAPABILITIES).and_then(Capabilities::from_tlv) {
                            self.negotiation.on_ping_received(&peer, caps);
                            self.events.push(SessionEvent::CapabilityConfirmed { peer: peer.to_string() });
                        }
                    }
                    _ => {}
                }
            }
        }
        let _ = now;
    }

    fn emit_ui(&mut self, peer: &Ax25Address, payload: Vec<u8>) {
        self.events.push(SessionEvent::FrameToSend(ax25::Frame {
            destination: peer.clone(),
            source: self.local.clone(),
            path: DigiPath::direct(),
            control: Control::Unnumbered { kind: UKind::Ui, pf: false },
            pid: Some(PID_NO_LAYER3),
            payload,
        }));
    }

    fn emit_corrected(&mut self, mut frame: ax25::Frame) {
        frame.source = self.local.clone();
        self.events.push(SessionEvent::FrameToSend(frame));
    }

    /// Drives every armed timer due at `now`, reprobes unconfirmed peers, and resends any
    /// completion request a file transfer is still waiting on.
    pub fn tick(&mut self, now: Instant) {
        for timer in self.timers.drain_expired(now) {
            let event = match timer.kind {
                TimerKind::T1 => Event::T1Timeout,
                TimerKind::Grace => Event::GraceTimeout,
                TimerKind::T3 => Event::T3Timeout,
            };
            if let Some(actions) = self.sessions.get_mut(timer.session).map(|s| s.handle(event, now)) {
                self.process_actions(timer.session, actions, now);
            }
        }

        let connected_peers: Vec<Ax25Address> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state() == State::Connected)
            .map(|(_, s)| s.key.destination.clone())
            .collect();
        for peer in connected_peers {
            if let Some(probe) = self.negotiation.tick(&peer, now) {
                self.emit_corrected(probe);
            }
        }

        let due = self.transfers.due_completion_requests(now);
        for (dgp_session, message) in due {
            if let Some(session) = self.session_for_dgp(dgp_session) {
                self.send_dgp_message(session, message, now);
            }
        }
    }

    fn session_for_dgp(&self, dgp_session: u32) -> Option<SessionId> {
        self.sessions.iter().map(|(id, _)| *id).find(|id| dgp_session_for(*id) == dgp_session)
    }

    fn send_dgp_message(&mut self, session: SessionId, message: DgpMessage, now: Instant) {
        let bytes = message.encode();
        if let Some(actions) = self
            .sessions
            .get_mut(session)
            .map(|s| s.handle(Event::SendData { payload: bytes, pid: PID_NO_LAYER3, display_hint: None }, now))
        {
            self.process_actions(session, actions, now);
        }
    }

    fn next_message_id(&mut self, session: SessionId) -> u32 {
        loop {
            let counter = self.message_ids.entry(session).or_insert(0);
            let value = *counter;
            *counter = counter.wrapping_add(1);
            if value != COMPLETION_REQUEST_ID && value != COMPLETION_ACK_ID {
                return value;
            }
        }
    }

    fn process_actions(&mut self, session: SessionId, actions: Vec<Action>, now: Instant) {
        for action in actions {
            match action {
                Action::EmitFrame(frame) => {
                    if let Control::Information { .. } = frame.control {
                        if let Some(stats) = self.link_stats.get_mut(&session) {
                            stats.frames_sent += 1;
                        }
                    }
                    self.events.push(SessionEvent::FrameToSend(frame));
                }
                Action::StartT1(delay) => self.timers.arm(session, TimerKind::T1, now, delay),
                Action::RestartT1(delay) => {
                    if let Some(stats) = self.link_stats.get_mut(&session) {
                        stats.retransmissions += 1;
                    }
                    self.timers.arm(session, TimerKind::T1, now, delay);
                }
                Action::StopT1 => self.timers.cancel(session, TimerKind::T1),
                Action::ScheduleGrace => self.timers.arm(session, TimerKind::Grace, now, ax25::T1_GRACE),
                Action::CancelGrace => self.timers.cancel(session, TimerKind::Grace),
                Action::StartT3(delay) => self.timers.arm(session, TimerKind::T3, now, delay),
                Action::StopT3 => self.timers.cancel(session, TimerKind::T3),
                Action::DeliverPayload(bytes) => self.deliver_payload(session, bytes, now),
                Action::StateChanged(state) => self.on_state_changed(session, state, now),
                Action::LinkFailure => self.events.push(SessionEvent::LinkFailure { session }),
            }
        }
    }

    fn on_state_changed(&mut self, session: SessionId, state: State, now: Instant) {
        self.events.push(SessionEvent::StateChanged { session, state });
        match state {
            State::Connected => {
                // A session reused across a disconnect/reconnect cycle (the retained
                // `Session` completing a fresh SABM/UA handshake via the exact-key lookup
                // hit in `lookup_inbound`) never goes through `accept_inbound`, so its
                // reassembler and link stats -- torn down on the previous disconnect --
                // must be recreated here rather than left missing for the session's
                // remaining lifetime.
                self.reassemblers.entry(session).or_insert_with(Reassembler::new);
                self.link_stats.entry(session).or_default();
                if let Some(s) = self.sessions.get(session) {
                    let peer = s.key.destination.clone();
                    let is_initiator = s.is_initiator;
                    self.negotiation.on_session_connected(&peer, is_initiator, self.auto_negotiate, now);
                }
            }
            State::Disconnected | State::Error => {
                self.record_link_sample(session, now);
                if let Some(s) = self.sessions.get(session) {
                    self.negotiation.on_disconnect(&s.key.destination);
                }
                self.reassemblers.remove(&session);
                self.timers.cancel_session(session);
                let dgp_session = dgp_session_for(session);
                self.transfers.forget_outbound(dgp_session);
                self.transfers.forget_inbound(dgp_session);
                self.message_ids.remove(&session);
            }
            State::Connecting | State::Disconnecting => {}
        }
    }

    fn record_link_sample(&mut self, session: SessionId, now: Instant) {
        let stats = match self.link_stats.remove(&session) {
            Some(stats) => stats,
            None => return,
        };
        let destination = match self.sessions.get(session) {
            Some(s) => s.key.destination.clone(),
            None => return,
        };
        let path_signature = self.sessions.get(session).map(|s| s.key.path_signature.clone()).unwrap_or_default();
        let srtt = self.sessions.get(session).map(|s| s.current_rto());
        let sample = LinkSample { frames_sent: stats.frames_sent.max(1), retransmissions: stats.retransmissions, srtt };
        let route = RouteKey::new(&destination.to_string(), &path_signature);
        self.adaptive.record_sample(route, &self.base_config, sample, now);
    }

    fn deliver_payload(&mut self, session: SessionId, bytes: Vec<u8>, now: Instant) {
        let messages = match self.reassemblers.get_mut(&session) {
            Some(reassembler) => reassembler.feed(&bytes),
            None => return,
        };
        for message in messages {
            self.handle_dgp_message(session, message, now);
        }
    }

    fn handle_dgp_message(&mut self, session: SessionId, message: DgpMessage, now: Instant) {
        if let Some(peer) = self.sessions.get(session).map(|s| s.key.destination.clone()) {
            self.negotiation.on_any_dgp_message(&peer);
        }
        let dgp_session = dgp_session_for(session);

        match message.message_type {
            MessageType::Chat => {
                let key = MessageKey { session_id: dgp_session, message_id: message.message_id };
                if self.dedupe.check_and_insert(key) {
                    return;
                }
                self.events.push(SessionEvent::DgpMessageReceived { session, message });
            }
            MessageType::FileMeta => {
                if let Some(meta) = message.find(tlv::TYPE_METADATA).and_then(|t| FileMeta::decode(&t.value).ok()) {
                    let filename = meta.filename.clone();
                    let size = meta.original_size;
                    self.transfers.on_file_meta(dgp_session, meta, now);
                    self.events.push(SessionEvent::TransferAcceptRequest { session, dgp_session, filename, size });
                }
            }
            MessageType::FileChunk => {
                let index = message.find(tlv::TYPE_CHUNK_INDEX).and_then(Tlv::as_u32);
                let crc = message.find(tlv::TYPE_PAYLOAD_CRC32).and_then(Tlv::as_u32);
                let payload = message.find(tlv::TYPE_PAYLOAD).map(|t| t.value.clone());
                if let (Some(index), Some(crc), Some(payload)) = (index, crc, payload) {
                    self.transfers.on_file_chunk(dgp_session, index, payload, crc);
                    if let Some((received, total)) = self.transfers.inbound_progress(dgp_session) {
                        self.events.push(SessionEvent::TransferProgress { session, dgp_session, received_chunks: received, total_chunks: total });
                    }
                }
            }
            MessageType::Ack if message.message_id == COMPLETION_REQUEST_ID => {
                let (response, saved) = self.transfers.on_completion_request(dgp_session, message.message_id);
                self.send_dgp_message(session, response, now);
                if let Some((filename, bytes)) = saved {
                    self.events.push(SessionEvent::TransferCompleted { session, dgp_session, filename, bytes });
                }
            }
            MessageType::Ack if message.message_id == COMPLETION_ACK_ID => {
                self.transfers.on_completion_ack(dgp_session);
            }
            MessageType::Ack => {}
            MessageType::Nack if message.message_id == COMPLETION_ACK_ID => {
                if let Some(sack) = message.find(tlv::TYPE_SACK_BITMAP) {
                    let chunks = self.transfers.on_completion_nack_with_sack(dgp_session, sack.value.clone());
                    for chunk in chunks {
                        self.send_dgp_message(session, chunk.message, now);
                    }
                } else {
                    self.transfers.on_completion_nack_without_sack(dgp_session);
                    self.events.push(SessionEvent::TransferFailed { session, dgp_session, reason: "peer rejected transfer".to_string() });
                }
            }
            MessageType::Nack => {}
            MessageType::Ping | MessageType::Pong => {}
            MessageType::PeerEnabled | MessageType::PeerDisabled => {
                self.events.push(SessionEvent::DgpMessageReceived { session, message });
            }
        }
    }
}

fn dgp_session_for(session: SessionId) -> u32 {
    session.0 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(call: &str, ssid: u8) -> Ax25Address {
        Ax25Address::new(call, ssid).unwrap()
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(
            addr("N0AAA", 1),
            0,
            SessionConfig::default(),
            std::env::temp_dir().join("coordinator-lib-test"),
            true,
            logging::init("test", None),
        )
    }

    #[test]
    fn connect_emits_sabm_and_arms_t1() {
        let mut c = coordinator();
        let now = Instant::now();
        let id = c.connect(addr("N0BBB", 2), DigiPath::direct(), now);
        let events = c.drain_events();
        assert!(events.iter().any(|e| matches!(e, SessionEvent::FrameToSend(f) if matches!(f.control, Control::Unnumbered{kind: UKind::Sabm, ..}))));
        assert_eq!(c.session_state(id), Some(State::Connecting));
    }

    #[test]
    fn ua_reply_completes_connect_and_triggers_probe_fallback_timer() {
        let mut c = coordinator();
        let now = Instant::now();
        let id = c.connect(addr("N0BBB", 2), DigiPath::direct(), now);
        c.drain_events();

        let ua = ax25::Frame {
            destination: addr("N0AAA", 1),
            source: addr("N0BBB", 2),
            path: DigiPath::direct(),
            control: Control::Unnumbered { kind: UKind::Ua, pf: true },
            pid: None,
            payload: vec![],
        };
        c.on_frame_received(ua, now);
        assert_eq!(c.session_state(id), Some(State::Connected));

        let probe = c.tick(now + dgp::capability::PROBE_FALLBACK_DELAY + std::time::Duration::from_millis(1));
        let _ = probe;
        let events = c.drain_events();
        assert!(events.iter().any(|e| matches!(e, SessionEvent::FrameToSend(f) if f.payload.starts_with(dgp::capability::PROBE_TEXT))));
    }

    #[test]
    fn inbound_sabm_creates_a_listening_session_and_replies_ua() {
        let mut c = coordinator();
        let now = Instant::now();
        let sabm = ax25::Frame {
            destination: addr("N0AAA", 1),
            source: addr("N0CCC", 3),
            path: DigiPath::direct(),
            control: Control::Unnumbered { kind: UKind::Sabm, pf: true },
            pid: None,
            payload: vec![],
        };
        c.on_frame_received(sabm, now);
        let events = c.drain_events();
        assert!(events.iter().any(|e| matches!(e, SessionEvent::FrameToSend(f) if matches!(f.control, Control::Unnumbered{kind: UKind::Ua, ..}))));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::StateChanged { state: State::Connected, .. })));
    }

    #[test]
    fn chat_message_round_trips_through_connected_session() {
        let mut c = coordinator();
        let now = Instant::now();
        let id = c.connect(addr("N0BBB", 2), DigiPath::direct(), now);
        c.drain_events();
        let ua = ax25::Frame {
            destination: addr("N0AAA", 1),
            source: addr("N0BBB", 2),
            path: DigiPath::direct(),
            control: Control::Unnumbered { kind: UKind::Ua, pf: true },
            pid: None,
            payload: vec![],
        };
        c.on_frame_received(ua, now);
        c.drain_events();

        c.send_chat(id, "hello", now).unwrap();
        let events = c.drain_events();
        let frame = events.iter().find_map(|e| match e {
            SessionEvent::FrameToSend(f) if matches!(f.control, Control::Information { .. }) => Some(f.clone()),
            _ => None,
        }).expect("chat I-frame emitted");

        // Simulate the far end delivering the same payload straight back to us.
        let dgp_session = dgp_session_for(id);
        let message = DgpMessage::decode(&frame.payload).unwrap().0;
        assert_eq!(message.session_id, dgp_session);
        assert_eq!(message.find(tlv::TYPE_PAYLOAD).unwrap().value, b"hello");
    }

    #[test]
    fn unknown_session_chat_is_rejected() {
        let mut c = coordinator();
        let err = c.send_chat(SessionId(999), "hi", Instant::now());
        assert!(matches!(err, Err(CoordinatorError::UnknownSession)));
    }
}
