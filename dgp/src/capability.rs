//! Capability negotiation: deciding whether a peer speaks DGP at all without sending it
//! binary frames it might echo back as "invalid command". See the module-level protocol
//! description this mirrors on the wire: ASCII text probe first, binary PING/PONG second.

use crate::tlv::{Tlv, TYPE_CAPABILITIES};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const PROBE_TEXT: &[u8] = b"AXDP?\r";
pub const PROBE_FALLBACK_DELAY: Duration = Duration::from_secs(3);
pub const PROBE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(900);
pub const NOT_SUPPORTED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Capabilities {
    pub proto_max: u8,
    pub feature_bits: u16,
}

impl Capabilities {
    pub fn to_tlv(self) -> Tlv {
        let mut value = Vec::with_capacity(3);
        value.push(self.proto_max);
        value.extend_from_slice(&self.feature_bits.to_be_bytes());
        Tlv::new(TYPE_CAPABILITIES, value)
    }

    pub fn from_tlv(tlv: &Tlv) -> Option<Capabilities> {
        if tlv.value.len() < 3 {
            return None;
        }
        Some(Capabilities {
            proto_max: tlv.value[0],
            feature_bits: u16::from_be_bytes([tlv.value[1], tlv.value[2]]),
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerStatus {
    Unknown,
    ProbeSent { at: Instant },
    Confirmed(Capabilities),
    NotSupported { until: Instant },
}

/// Per-destination capability state. Owned by the coordinator; cleared on session
/// disconnect so every reconnect re-probes from scratch.
#[derive(Default)]
pub struct CapabilityStore {
    peers: HashMap<String, PeerStatus>,
}

impl CapabilityStore {
    pub fn new() -> CapabilityStore {
        CapabilityStore::default()
    }

    pub fn status(&self, peer: &str) -> PeerStatus {
        self.peers.get(peer).copied().unwrap_or(PeerStatus::Unknown)
    }

    /// Whether we should attempt a probe right now: unknown, or a previous
    /// "not-supported" marking has aged out of its TTL.
    pub fn should_probe(&self, peer: &str, now: Instant) -> bool {
        match self.status(peer) {
            PeerStatus::Unknown => true,
            PeerStatus::NotSupported { until } => now >= until,
            _ => false,
        }
    }

    pub fn mark_probe_sent(&mut self, peer: &str, now: Instant) {
        self.peers.insert(peer.to_string(), PeerStatus::ProbeSent { at: now });
    }

    pub fn mark_confirmed(&mut self, peer: &str, capabilities: Capabilities) {
        self.peers.insert(peer.to_string(), PeerStatus::Confirmed(capabilities));
    }

    /// Any successfully decoded DGP message from a peer implicitly confirms capability,
    /// even without an explicit PING/PONG round-trip.
    pub fn mark_confirmed_implicit(&mut self, peer: &str) {
        if !matches!(self.status(peer), PeerStatus::Confirmed(_)) {
            self.peers.insert(
                peer.to_string(),
                PeerStatus::Confirmed(Capabilities { proto_max: 1, feature_bits: 0 }),
            );
        }
    }

    /// Expires a still-unanswered probe into a TTL'd "not supported" marking.
    pub fn expire_probe_if_due(&mut self, peer: &str, now: Instant) {
        if let Some(PeerStatus::ProbeSent { at }) = self.peers.get(peer) {
            if now.duration_since(*at) >= PROBE_RESPONSE_TIMEOUT {
                self.peers.insert(peer.to_string(), PeerStatus::NotSupported { until: now + NOT_SUPPORTED_TTL });
            }
        }
    }

    /// Clears all state for a peer, e.g. on session disconnect or manual rediscovery.
    pub fn clear(&mut self, peer: &str) {
        self.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_tlv_roundtrip() {
        let caps = Capabilities { proto_max: 1, feature_bits: 0x00FF };
        let tlv = caps.to_tlv();
        assert_eq!(Capabilities::from_tlv(&tlv), Some(caps));
    }

    #[test]
    fn unknown_peer_should_be_probed() {
        let store = CapabilityStore::new();
        assert!(store.should_probe("N0BBB-2", Instant::now()));
    }

    #[test]
    fn not_supported_marking_blocks_reprobe_until_ttl_elapses() {
        let mut store = CapabilityStore::new();
        let now = Instant::now();
        store.mark_probe_sent("N0BBB-2", now);
        store.expire_probe_if_due("N0BBB-2", now + PROBE_RESPONSE_TIMEOUT);
        assert!(!store.should_probe("N0BBB-2", now + PROBE_RESPONSE_TIMEOUT));
    }

    #[test]
    fn implicit_confirmation_only_applies_once() {
        let mut store = CapabilityStore::new();
        store.mark_confirmed("N0BBB-2", Capabilities { proto_max: 2, feature_bits: 5 });
        store.mark_confirmed_implicit("N0BBB-2");
        assert_eq!(
            store.status("N0BBB-2"),
            PeerStatus::Confirmed(Capabilities { proto_max: 2, feature_bits: 5 })
        );
    }

    #[test]
    fn clear_resets_to_unknown() {
        let mut store = CapabilityStore::new();
        store.mark_confirmed("N0BBB-2", Capabilities { proto_max: 1, feature_bits: 0 });
        store.clear("N0BBB-2");
        assert_eq!(store.status("N0BBB-2"), PeerStatus::Unknown);
    }
}
