//! Drives the capability-negotiation protocol on top of [`dgp::CapabilityStore`]: decides
//! when to send the ASCII text probe, reacts to the binary PONG/PING exchange it
//! provokes, and clears everything on disconnect so a reconnect always re-probes.

use ax25::{Ax25Address, Frame, PID_NO_LAYER3};
use dgp::capability::{Capabilities, PROBE_FALLBACK_DELAY, PROBE_TEXT};
use dgp::{CapabilityStore, DgpMessage, MessageType};
use std::collections::HashMap;
use std::time::Instant;

/// Per-peer bookkeeping between a session reaching Connected and the probe actually being
/// sent: the probe fires on whichever comes first, the peer's first I-frame or the 3 s
/// fallback timer.
struct PendingProbe {
    deadline: Instant,
    fired: bool,
}

pub struct NegotiationDriver {
    store: CapabilityStore,
    pending: HashMap<String, PendingProbe>,
}

impl NegotiationDriver {
    pub fn new() -> NegotiationDriver {
        NegotiationDriver { store: CapabilityStore::new(), pending: HashMap::new() }
    }

    /// Called when an initiator session reaches Connected. Arms the fallback timer if
    /// DGP auto-negotiate is enabled and the peer isn't under a "not supported" TTL.
    pub fn on_session_connected(&mut self, peer: &Ax25Address, is_initiator: bool, auto_negotiate: bool, now: Instant) {
        if !is_initiator || !auto_negotiate {
            return;
        }
        let key = peer.to_string();
        if self.store.should_probe(&key, now) {
            self.pending.insert(key, PendingProbe { deadline: now + PROBE_FALLBACK_DELAY, fired: false });
        }
    }

    pub fn on_disconnect(&mut self, peer: &Ax25Address) {
        let key = peer.to_string();
        self.store.clear(&key);
        self.pending.remove(&key);
    }

    /// The first I-frame received on a freshly-connected initiator session fires the
    /// probe immediately rather than waiting out the fallback timer.
    pub fn on_inbound_iframe(&mut self, peer: &Ax25Address, now: Instant) -> Option<Frame> {
        let key = peer.to_string();
        let fire = matches!(self.pending.get(&key), Some(p) if !p.fired);
        if fire {
            self.fire_probe(peer, now)
        } else {
            None
        }
    }

    /// Called once per coordinator tick; fires any probe whose fallback timer elapsed,
    /// and ages out probes that went unanswered past their timeout.
    pub fn tick(&mut self, peer: &Ax25Address, now: Instant) -> Option<Frame> {
        let key = peer.to_string();
        self.store.expire_probe_if_due(&key, now);
        let due = matches!(self.pending.get(&key), Some(p) if !p.fired && now >= p.deadline);
        if due {
            self.fire_probe(peer, now)
        } else {
            None
        }
    }

    fn fire_probe(&mut self, peer: &Ax25Address, now: Instant) -> Option<Frame> {
        let key = peer.to_string();
        if let Some(entry) = self.pending.get_mut(&key) {
            entry.fired = true;
        }
        self.store.mark_probe_sent(&key, now);
        Some(Frame {
            destination: peer.clone(),
            source: peer.clone(), // overwritten by the caller with the local station address
            path: ax25::DigiPath::direct(),
            control: ax25::Control::Unnumbered { kind: ax25::UKind::Ui, pf: false },
            pid: Some(PID_NO_LAYER3),
            payload: PROBE_TEXT.to_vec(),
        })
    }

    /// A UI frame matching the probe's ASCII prefix was received: reply with a binary
    /// DGP PONG carrying our capabilities, over UI, so a legacy peer never has to parse
    /// anything it doesn't understand as a reply either.
    pub fn build_pong(&self, dgp_session: u32, message_id: u32, local: Capabilities) -> DgpMessage {
        DgpMessage::new(MessageType::Pong, dgp_session, message_id).with_tlv(local.to_tlv())
    }

    /// A PONG arrived: the peer speaks DGP. Mark it confirmed and build the PING that
    /// completes the bidirectional exchange.
    pub fn on_pong_received(&mut self, peer: &Ax25Address, capabilities: Capabilities, dgp_session: u32, message_id: u32) -> DgpMessage {
        let key = peer.to_string();
        self.store.mark_confirmed(&key, capabilities);
        self.pending.remove(&key);
        DgpMessage::new(MessageType::Ping, dgp_session, message_id).with_tlv(capabilities.to_tlv())
    }

    pub fn on_ping_received(&mut self, peer: &Ax25Address, capabilities: Capabilities) {
        let key = peer.to_string();
        self.store.mark_confirmed(&key, capabilities);
        self.pending.remove(&key);
    }

    /// Any other successfully decoded DGP message implicitly confirms the peer, even
    /// without having gone through the explicit PING/PONG round-trip.
    pub fn on_any_dgp_message(&mut self, peer: &Ax25Address) {
        let key = peer.to_string();
        self.store.mark_confirmed_implicit(&key);
        self.pending.remove(&key);
    }

    pub fn is_confirmed(&self, peer: &Ax25Address) -> bool {
        matches!(self.store.status(&peer.to_string()), dgp::capability::PeerStatus::Confirmed(_))
    }
}

impl Default for NegotiationDriver {
    fn default() -> Self {
        NegotiationDriver::new()
    }
}
