//! Per-peer AX.25 connected-mode session state machine: SABM/UA/DISC/DM/I/RR/REJ with
//! modulo-8 sequence numbers, sliding-window flow control, retransmission and adaptive
//! RTO. The session itself never touches a clock or a socket directly -- callers drive
//! it with [`Event`]s carrying whatever time they observed, and consume the [`Action`]s
//! it returns. That keeps the whole thing synchronous and trivially testable, and avoids
//! the session holding a reference back to whatever is scheduling its timers.

use crate::address::{Ax25Address, DigiPath};
use crate::frame::{Control, Frame, SKind, UKind, PID_NO_LAYER3};
use crate::rto::RtoEstimator;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

pub const MODULUS: u8 = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId(pub u64);

/// Identifies one AX.25 connected-mode session. Two sessions to the same peer reached via
/// different digipeater paths are distinct, because the on-air behavior of a path can
/// differ arbitrarily (different digipeaters, different loss characteristics).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SessionKey {
    pub destination: Ax25Address,
    pub path_signature: String,
    pub channel: u16,
}

impl SessionKey {
    pub fn new(destination: Ax25Address, path: &DigiPath, channel: u16) -> SessionKey {
        SessionKey {
            destination,
            path_signature: path.signature(),
            channel,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub window_size: u8,
    pub paclen: u16,
    pub max_retries: u8,
    pub extended: bool,
    pub initial_rto: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    pub t3_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            window_size: 2,
            paclen: 128,
            max_retries: 10,
            extended: false,
            initial_rto: Duration::from_secs(4),
            rto_min: Duration::from_secs(1),
            rto_max: Duration::from_secs(30),
            t3_interval: Duration::from_secs(180),
        }
    }
}

/// Grace period inserted between a T1 firing and the actual retransmit, so a slightly
/// late RR can still suppress a duplicate. See the end-to-end scenario in the spec: T1
/// fires, we arm the grace timer instead of retransmitting immediately, and if an RR
/// accepting the outstanding frames shows up before the grace timer elapses we cancel.
pub const T1_GRACE: Duration = Duration::from_millis(200);

/// Window in which a UA is still accepted as completing a connect after we gave up and
/// moved to Disconnected/Error, expressed as a multiplier on the RTO in force, floored at
/// a fixed absolute minimum.
pub const LATE_UA_FLOOR: Duration = Duration::from_secs(5);
pub const LATE_UA_RTO_MULTIPLE: u32 = 2;

#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub payload: Vec<u8>,
    pub pid: u8,
}

#[derive(Debug, Clone)]
pub struct PendingItem {
    pub payload: Vec<u8>,
    pub pid: u8,
    pub display_hint: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("send window is full")]
    WindowFull,
    #[error("event is not valid in the current state")]
    StateInvalid,
    #[error("maximum retry count exceeded")]
    MaxRetriesExceeded,
}

/// Inbound stimuli driving the state machine. Timer firings are included here rather than
/// observed internally: the session has no notion of wall-clock time of its own.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectRequest,
    DisconnectRequest,
    ForceDisconnect,
    SendData { payload: Vec<u8>, pid: u8, display_hint: Option<String> },
    InboundSabm,
    InboundUa,
    InboundDm,
    InboundDisc,
    InboundI { ns: u8, nr: u8, pf: bool, payload: Vec<u8> },
    InboundRr { nr: u8, pf: bool },
    InboundRej { nr: u8 },
    T1Timeout,
    GraceTimeout,
    T3Timeout,
}

/// Side effects the caller is responsible for carrying out: transmitting frames,
/// (re)arming timers, and delivering data / state changes to the application layer.
#[derive(Debug, Clone)]
pub enum Action {
    EmitFrame(Frame),
    StartT1(Duration),
    RestartT1(Duration),
    StopT1,
    ScheduleGrace,
    CancelGrace,
    StartT3(Duration),
    StopT3,
    DeliverPayload(Vec<u8>),
    StateChanged(State),
    LinkFailure,
}

pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    pub local: Ax25Address,
    pub config: SessionConfig,
    pub is_initiator: bool,

    state: State,
    vs: u8,
    vr: u8,
    va: u8,

    send_buffer: BTreeMap<u8, BufferedFrame>,
    send_time: BTreeMap<u8, Instant>,
    pending: VecDeque<PendingItem>,

    retry_count: u8,
    rto: RtoEstimator,
    t1_armed: bool,
    grace_pending: bool,
    reject_outstanding: bool,

    connecting_since: Option<Instant>,
    disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(id: SessionId, key: SessionKey, local: Ax25Address, is_initiator: bool, config: SessionConfig) -> Session {
        let rto = RtoEstimator::new(config.initial_rto, config.rto_min, config.rto_max);
        Session {
            id,
            key,
            local,
            config,
            is_initiator,
            state: State::Disconnected,
            vs: 0,
            vr: 0,
            va: 0,
            send_buffer: BTreeMap::new(),
            send_time: BTreeMap::new(),
            pending: VecDeque::new(),
            retry_count: 0,
            rto,
            t1_armed: false,
            grace_pending: false,
            reject_outstanding: false,
            connecting_since: None,
            disconnected_at: None,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.send_buffer.len()
    }

    #[inline]
    pub fn vs(&self) -> u8 {
        self.vs
    }
    #[inline]
    pub fn vr(&self) -> u8 {
        self.vr
    }
    #[inline]
    pub fn va(&self) -> u8 {
        self.va
    }

    /// Current RTO estimate, for callers that adapt other link parameters (window size,
    /// paclen) off of it.
    #[inline]
    pub fn current_rto(&self) -> Duration {
        self.rto.current()
    }

    fn peer(&self) -> &Ax25Address {
        &self.key.destination
    }

    fn u_frame(&self, kind: UKind, pf: bool) -> Frame {
        Frame {
            destination: self.peer().clone(),
            source: self.local.clone(),
            path: path_from_signature(&self.key.path_signature),
            control: Control::Unnumbered { kind, pf },
            pid: None,
            payload: Vec::new(),
        }
    }

    fn s_frame(&self, kind: SKind, pf: bool) -> Frame {
        Frame {
            destination: self.peer().clone(),
            source: self.local.clone(),
            path: path_from_signature(&self.key.path_signature),
            control: Control::Supervisory { kind, nr: self.vr, pf },
            pid: None,
            payload: Vec::new(),
        }
    }

    fn i_frame(&self, ns: u8, payload: &[u8], pid: u8) -> Frame {
        Frame {
            destination: self.peer().clone(),
            source: self.local.clone(),
            path: path_from_signature(&self.key.path_signature),
            control: Control::Information { ns, nr: self.vr, pf: false },
            pid: Some(pid),
            payload: payload.to_vec(),
        }
    }

    fn reset_sequence(&mut self) {
        self.vs = 0;
        self.vr = 0;
        self.va = 0;
        self.send_buffer.clear();
        self.send_time.clear();
        self.retry_count = 0;
        self.reject_outstanding = false;
    }

    fn to_state(&mut self, state: State, actions: &mut Vec<Action>) {
        self.state = state;
        actions.push(Action::StateChanged(state));
    }

    /// Accepts RR(nr)/I-piggyback acknowledgement over the half-open interval
    /// `[va_before, nr)` taken mod 8. `va_before` must be captured *before* `self.va` is
    /// advanced, because the peer's N(S) can reuse low sequence numbers after wraparound:
    /// naively stripping every buffer key less than `nr` corrupts the buffer once that
    /// has happened. Returns the number of frames newly acked and the send time of the
    /// most-recently-acked frame (for RTT sampling), if any were removed.
    fn acknowledge_up_to(&mut self, nr: u8) -> (usize, Option<Instant>) {
        let va_before = self.va;
        let mut removed = 0;
        let mut last_send_time = None;
        let mut seq = va_before;
        while seq != nr {
            if self.send_buffer.remove(&seq).is_some() {
                removed += 1;
            }
            if let Some(sent_at) = self.send_time.remove(&seq) {
                last_send_time = Some(sent_at);
            }
            seq = (seq + 1) % MODULUS;
        }
        self.va = nr;
        (removed, last_send_time)
    }

    /// Whether `ns` looks like a retransmission of a frame already delivered, rather than
    /// a genuine forward gap: true when `ns` falls within the trailing `window_size`
    /// sequence numbers behind V(R), which bounds how far behind the peer's own
    /// unacknowledged frames could still be. A larger backward distance is instead treated
    /// as a frame arriving ahead of V(R) (a real gap), since the peer's window can't hold
    /// more than `window_size` frames it hasn't heard acked.
    fn is_past_duplicate(&self, ns: u8) -> bool {
        let backward = (self.vr + MODULUS - ns) % MODULUS;
        backward != 0 && backward as usize <= self.config.window_size as usize
    }

    fn drain_pending(&mut self, actions: &mut Vec<Action>) {
        while self.send_buffer.len() < self.config.window_size as usize {
            let item = match self.pending.pop_front() {
                Some(item) => item,
                None => break,
            };
            let ns = self.vs;
            let frame = self.i_frame(ns, &item.payload, item.pid);
            self.send_buffer.insert(ns, BufferedFrame { payload: item.payload, pid: item.pid });
            self.send_time.insert(ns, Instant::now());
            self.vs = (self.vs + 1) % MODULUS;
            actions.push(Action::EmitFrame(frame));
        }
        if !self.send_buffer.is_empty() && !self.t1_armed {
            self.t1_armed = true;
            actions.push(Action::StartT1(self.rto.current()));
        }
    }

    fn retransmit_from(&self, from: u8, actions: &mut Vec<Action>) {
        let mut seq = from;
        while seq != self.vs {
            if let Some(buffered) = self.send_buffer.get(&seq) {
                actions.push(Action::EmitFrame(self.i_frame(seq, &buffered.payload, buffered.pid)));
            }
            seq = (seq + 1) % MODULUS;
        }
    }

    /// Drives the state machine. Returns the actions the caller must carry out.
    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        match (self.state, event) {
            (State::Disconnected, Event::ConnectRequest) => {
                self.connecting_since = Some(now);
                self.to_state(State::Connecting, &mut actions);
                actions.push(Action::EmitFrame(self.u_frame(UKind::Sabm, true)));
                actions.push(Action::StartT1(self.rto.current()));
            }
            (State::Disconnected, Event::InboundSabm) => {
                self.reset_sequence();
                self.to_state(State::Connected, &mut actions);
                actions.push(Action::EmitFrame(self.u_frame(UKind::Ua, true)));
                actions.push(Action::StartT3(self.config.t3_interval));
            }
            // Late UA: a timed-out Connecting session that fell to Disconnected/Error can
            // still be salvaged if UA shows up within the late-UA window. The manager is
            // responsible for gating this on elapsed time; here we just accept it.
            (State::Disconnected, Event::InboundUa) | (State::Error, Event::InboundUa) => {
                self.reset_sequence();
                self.to_state(State::Connected, &mut actions);
                actions.push(Action::StopT1);
                actions.push(Action::StartT3(self.config.t3_interval));
                self.drain_pending(&mut actions);
            }

            (State::Connecting, Event::InboundUa) => {
                self.reset_sequence();
                actions.push(Action::StopT1);
                self.to_state(State::Connected, &mut actions);
                actions.push(Action::StartT3(self.config.t3_interval));
                self.drain_pending(&mut actions);
            }
            (State::Connecting, Event::InboundDm) => {
                self.pending.clear();
                actions.push(Action::StopT1);
                self.to_state(State::Disconnected, &mut actions);
            }
            (State::Connecting, Event::T1Timeout) => {
                self.retry_count += 1;
                if self.retry_count > self.config.max_retries {
                    self.to_state(State::Error, &mut actions);
                    actions.push(Action::LinkFailure);
                } else {
                    self.rto.on_timeout();
                    actions.push(Action::EmitFrame(self.u_frame(UKind::Sabm, true)));
                    actions.push(Action::RestartT1(self.rto.current()));
                }
            }

            (State::Connected, Event::SendData { payload, pid, display_hint }) => {
                self.pending.push_back(PendingItem { payload, pid, display_hint });
                self.drain_pending(&mut actions);
            }

            (State::Connected, Event::InboundI { ns, nr, pf, payload }) => {
                if ns == self.vr {
                    self.vr = (self.vr + 1) % MODULUS;
                    self.reject_outstanding = false;
                    actions.push(Action::DeliverPayload(payload));
                    let (removed, last_sent) = self.acknowledge_up_to(nr);
                    if let Some(sent_at) = last_sent {
                        self.rto.on_sample(now.duration_since(sent_at));
                    }
                    let _ = removed;
                    actions.push(Action::EmitFrame(self.s_frame(SKind::Rr, pf)));
                    self.retarm_t1(&mut actions);
                } else if self.is_past_duplicate(ns) {
                    // Retransmission of a frame already delivered (the peer's T1 fired
                    // before our RR reached it): re-ack via RR, never REJ, per the
                    // documented duplicate-I-frame resolution.
                    let (_, last_sent) = self.acknowledge_up_to(nr);
                    if let Some(sent_at) = last_sent {
                        self.rto.on_sample(now.duration_since(sent_at));
                    }
                    actions.push(Action::EmitFrame(self.s_frame(SKind::Rr, pf)));
                } else if !self.reject_outstanding {
                    // Genuine forward gap: reject and demand retransmission from V(R).
                    self.reject_outstanding = true;
                    let (_, last_sent) = self.acknowledge_up_to(nr);
                    if let Some(sent_at) = last_sent {
                        self.rto.on_sample(now.duration_since(sent_at));
                    }
                    actions.push(Action::EmitFrame(self.s_frame(SKind::Rej, pf)));
                    self.retarm_t1(&mut actions);
                } else {
                    // The same gap frame re-arriving while a REJ is already outstanding:
                    // re-ack, don't re-REJ.
                    let (_, last_sent) = self.acknowledge_up_to(nr);
                    if let Some(sent_at) = last_sent {
                        self.rto.on_sample(now.duration_since(sent_at));
                    }
                    actions.push(Action::EmitFrame(self.s_frame(SKind::Rr, pf)));
                }
            }

            (State::Connected, Event::InboundRr { nr, pf }) => {
                let (removed, last_sent) = self.acknowledge_up_to(nr);
                if let Some(sent_at) = last_sent {
                    self.rto.on_sample(now.duration_since(sent_at));
                }
                if pf {
                    actions.push(Action::EmitFrame(Frame {
                        control: Control::Supervisory { kind: SKind::Rr, nr: self.vr, pf: true },
                        ..self.s_frame(SKind::Rr, true)
                    }));
                }
                if self.grace_pending && removed > 0 {
                    self.grace_pending = false;
                    actions.push(Action::CancelGrace);
                }
                if self.send_buffer.is_empty() {
                    self.t1_armed = false;
                    actions.push(Action::StopT1);
                } else {
                    actions.push(Action::RestartT1(self.rto.current()));
                }
                self.drain_pending(&mut actions);
            }

            (State::Connected, Event::InboundRej { nr }) => {
                self.retransmit_from(nr, &mut actions);
                self.retarm_t1(&mut actions);
            }

            (State::Connected, Event::T1Timeout) => {
                // Enter the grace period instead of retransmitting immediately; a late RR
                // can still cancel this.
                self.grace_pending = true;
                actions.push(Action::ScheduleGrace);
            }

            (State::Connected, Event::GraceTimeout) => {
                if self.grace_pending {
                    self.grace_pending = false;
                    self.retry_count += 1;
                    if self.retry_count > self.config.max_retries {
                        self.to_state(State::Error, &mut actions);
                        actions.push(Action::LinkFailure);
                        // Intermediate timeouts must not clear the send buffer; only a
                        // terminal failure (here) or a force-disconnect does.
                        self.send_buffer.clear();
                        self.send_time.clear();
                        self.pending.clear();
                    } else {
                        self.rto.on_timeout();
                        self.retransmit_from(self.va, &mut actions);
                        actions.push(Action::RestartT1(self.rto.current()));
                    }
                }
            }

            (State::Connected, Event::T3Timeout) => {
                actions.push(Action::EmitFrame(Frame {
                    control: Control::Supervisory { kind: SKind::Rr, nr: self.vr, pf: true },
                    ..self.s_frame(SKind::Rr, true)
                }));
                actions.push(Action::StartT3(self.config.t3_interval));
            }

            (State::Connected, Event::DisconnectRequest) => {
                self.to_state(State::Disconnecting, &mut actions);
                actions.push(Action::EmitFrame(self.u_frame(UKind::Disc, true)));
                actions.push(Action::StartT1(self.rto.current()));
            }
            (State::Disconnecting, Event::InboundUa) => {
                self.pending.clear();
                self.send_buffer.clear();
                self.send_time.clear();
                actions.push(Action::StopT1);
                actions.push(Action::StopT3);
                self.disconnected_at = Some(now);
                self.to_state(State::Disconnected, &mut actions);
            }
            (State::Disconnecting, Event::T1Timeout) => {
                self.retry_count += 1;
                if self.retry_count > self.config.max_retries {
                    self.pending.clear();
                    self.send_buffer.clear();
                    self.to_state(State::Disconnected, &mut actions);
                } else {
                    actions.push(Action::EmitFrame(self.u_frame(UKind::Disc, true)));
                    actions.push(Action::RestartT1(self.rto.current()));
                }
            }

            (_, Event::InboundDisc) => {
                actions.push(Action::EmitFrame(self.u_frame(UKind::Ua, true)));
                self.pending.clear();
                self.send_buffer.clear();
                self.send_time.clear();
                actions.push(Action::StopT1);
                actions.push(Action::StopT3);
                self.disconnected_at = Some(now);
                self.to_state(State::Disconnected, &mut actions);
            }

            (_, Event::ForceDisconnect) => {
                self.pending.clear();
                self.send_buffer.clear();
                self.send_time.clear();
                self.t1_armed = false;
                self.grace_pending = false;
                actions.push(Action::StopT1);
                actions.push(Action::StopT3);
                self.disconnected_at = Some(now);
                self.to_state(State::Disconnected, &mut actions);
            }

            // Any other combination is simply not a valid transition; the session is left
            // untouched. Conservative robustness rule from the spec: an unmatched inbound
            // frame is ignored rather than answered with e.g. a gratuitous DM.
            _ => {}
        }
        actions
    }

    /// Whether a UA arriving right now would still be accepted as completing a previously
    /// abandoned connect attempt (spec's "late UA" rule).
    pub fn accepts_late_ua(&self, now: Instant) -> bool {
        match self.disconnected_at.or(self.connecting_since) {
            Some(reference) => {
                let window = std::cmp::max(self.rto.current() * LATE_UA_RTO_MULTIPLE, LATE_UA_FLOOR);
                now.duration_since(reference) <= window
            }
            None => false,
        }
    }

    fn retarm_t1(&mut self, actions: &mut Vec<Action>) {
        if self.send_buffer.is_empty() {
            if self.t1_armed {
                self.t1_armed = false;
                actions.push(Action::StopT1);
            }
        } else {
            actions.push(Action::RestartT1(self.rto.current()));
        }
    }

    /// Records an RTT sample measured externally (e.g. SABM -> UA elapsed, computed by the
    /// manager which owns the wall clock for the initial handshake).
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        self.rto.on_sample(sample);
    }
}

fn path_from_signature(signature: &str) -> DigiPath {
    if signature.is_empty() {
        return DigiPath::direct();
    }
    let stations: Vec<Ax25Address> = signature
        .split(',')
        .filter_map(|part| Ax25Address::parse(part).ok())
        .collect();
    DigiPath::new(stations).unwrap_or_else(|_| DigiPath::direct())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::UKind;

    fn make_session(window: u8) -> Session {
        let key = SessionKey::new(Ax25Address::new("N0BBB", 2).unwrap(), &DigiPath::direct(), 0);
        let local = Ax25Address::new("N0AAA", 1).unwrap();
        let mut config = SessionConfig::default();
        config.window_size = window;
        Session::new(SessionId(1), key, local, true, config)
    }

    #[test]
    fn connect_one_iframe_graceful_disconnect() {
        let mut session = make_session(2);
        let now = Instant::now();

        let actions = session.handle(Event::ConnectRequest, now);
        assert!(matches!(actions[1], Action::EmitFrame(ref f) if matches!(f.control, Control::Unnumbered { kind: UKind::Sabm, pf: true })));

        session.handle(Event::InboundUa, now);
        assert_eq!(session.state(), State::Connected);

        let actions = session.handle(
            Event::SendData { payload: b"hi\r".to_vec(), pid: PID_NO_LAYER3, display_hint: None },
            now,
        );
        let emitted = actions.iter().find_map(|a| match a {
            Action::EmitFrame(f) => Some(f.clone()),
            _ => None,
        }).unwrap();
        assert!(matches!(emitted.control, Control::Information { ns: 0, nr: 0, .. }));

        session.handle(Event::InboundRr { nr: 1, pf: false }, now);
        assert_eq!(session.outstanding(), 0);

        let actions = session.handle(Event::DisconnectRequest, now);
        assert!(actions.iter().any(|a| matches!(a, Action::EmitFrame(f) if matches!(f.control, Control::Unnumbered { kind: UKind::Disc, .. }))));

        session.handle(Event::InboundUa, now);
        assert_eq!(session.state(), State::Disconnected);
    }

    #[test]
    fn t1_timeout_then_late_rr_cancels_grace() {
        let mut session = make_session(2);
        let now = Instant::now();
        session.handle(Event::ConnectRequest, now);
        session.handle(Event::InboundUa, now);
        session.handle(Event::SendData { payload: b"x".to_vec(), pid: PID_NO_LAYER3, display_hint: None }, now);

        let actions = session.handle(Event::T1Timeout, now);
        assert!(actions.iter().any(|a| matches!(a, Action::ScheduleGrace)));

        // RR arrives within the grace window and acks the outstanding frame.
        let actions = session.handle(Event::InboundRr { nr: 1, pf: false }, now);
        assert!(actions.iter().any(|a| matches!(a, Action::CancelGrace)));
        assert_eq!(session.outstanding(), 0);

        // Grace timer eventually fires anyway (race with cancellation) -- no-op since
        // grace_pending was already cleared.
        let actions = session.handle(Event::GraceTimeout, now);
        assert!(actions.is_empty());
    }

    #[test]
    fn rej_retransmits_only_unacked_frames_in_order() {
        let mut session = make_session(3);
        let now = Instant::now();
        session.handle(Event::ConnectRequest, now);
        session.handle(Event::InboundUa, now);
        for i in 0..3u8 {
            session.handle(
                Event::SendData { payload: vec![i], pid: PID_NO_LAYER3, display_hint: None },
                now,
            );
        }
        assert_eq!(session.outstanding(), 3);

        let actions = session.handle(Event::InboundRej { nr: 1 }, now);
        let retransmitted: Vec<u8> = actions
            .iter()
            .filter_map(|a| match a {
                Action::EmitFrame(f) => match f.control {
                    Control::Information { ns, .. } => Some(ns),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(retransmitted, vec![1, 2]);
    }

    #[test]
    fn sequence_wraps_after_eight_frames() {
        let mut session = make_session(7);
        let now = Instant::now();
        session.handle(Event::ConnectRequest, now);
        session.handle(Event::InboundUa, now);
        for i in 0..7u8 {
            session.handle(Event::SendData { payload: vec![i], pid: PID_NO_LAYER3, display_hint: None }, now);
        }
        session.handle(Event::InboundRr { nr: 7, pf: false }, now);
        assert_eq!(session.outstanding(), 0);
        assert_eq!(session.vs(), 7);

        session.handle(Event::SendData { payload: vec![9], pid: PID_NO_LAYER3, display_hint: None }, now);
        session.handle(Event::InboundRr { nr: 0, pf: false }, now);
        assert_eq!(session.vs(), 0);
        assert_eq!(session.va(), 0);
        assert_eq!(session.outstanding(), 0);
    }

    #[test]
    fn window_full_queues_rather_than_sending() {
        let mut session = make_session(1);
        let now = Instant::now();
        session.handle(Event::ConnectRequest, now);
        session.handle(Event::InboundUa, now);
        session.handle(Event::SendData { payload: vec![1], pid: PID_NO_LAYER3, display_hint: None }, now);
        let actions = session.handle(Event::SendData { payload: vec![2], pid: PID_NO_LAYER3, display_hint: None }, now);
        assert!(!actions.iter().any(|a| matches!(a, Action::EmitFrame(_))));
        assert_eq!(session.outstanding(), 1);

        session.handle(Event::InboundRr { nr: 1, pf: false }, now);
        assert_eq!(session.outstanding(), 1);
        assert_eq!(session.vs(), 2);
    }

    #[test]
    fn duplicate_inbound_iframe_is_reacked_with_rr_not_rej() {
        let mut session = make_session(3);
        let now = Instant::now();
        session.handle(Event::ConnectRequest, now);
        session.handle(Event::InboundUa, now);

        let actions = session.handle(
            Event::InboundI { ns: 0, nr: 0, pf: false, payload: vec![1] },
            now,
        );
        assert!(actions.iter().any(|a| matches!(a, Action::DeliverPayload(_))));
        assert_eq!(session.vr(), 1);

        // Peer retransmits ns=0 (its T1 fired before our RR arrived); we've already
        // delivered it, so this must come back as a plain RR re-ack, not a REJ.
        let actions = session.handle(
            Event::InboundI { ns: 0, nr: 0, pf: false, payload: vec![1] },
            now,
        );
        assert!(!actions.iter().any(|a| matches!(a, Action::DeliverPayload(_))));
        assert_eq!(session.vr(), 1);
        let emitted: Vec<&SKind> = actions
            .iter()
            .filter_map(|a| match a {
                Action::EmitFrame(f) => match &f.control {
                    Control::Supervisory { kind, .. } => Some(kind),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(emitted, vec![&SKind::Rr]);

        // A genuine forward gap (ns skips ahead of V(R)) is still rejected normally.
        let actions = session.handle(
            Event::InboundI { ns: 2, nr: 0, pf: false, payload: vec![3] },
            now,
        );
        assert!(actions.iter().any(|a| match a {
            Action::EmitFrame(f) => matches!(&f.control, Control::Supervisory { kind: SKind::Rej, .. }),
            _ => false,
        }));
    }

    #[test]
    fn unmatched_i_frame_outside_connected_state_is_ignored() {
        let mut session = make_session(2);
        let now = Instant::now();
        let actions = session.handle(Event::InboundI { ns: 0, nr: 0, pf: false, payload: vec![] }, now);
        assert!(actions.is_empty());
        assert_eq!(session.state(), State::Disconnected);
    }

    #[test]
    fn intermediate_t1_timeout_does_not_clear_send_buffer() {
        let mut session = make_session(2);
        let now = Instant::now();
        session.handle(Event::ConnectRequest, now);
        session.handle(Event::InboundUa, now);
        session.handle(Event::SendData { payload: vec![1], pid: PID_NO_LAYER3, display_hint: None }, now);
        session.handle(Event::T1Timeout, now);
        session.handle(Event::GraceTimeout, now);
        assert_eq!(session.outstanding(), 1);
    }
}
