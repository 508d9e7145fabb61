//! Per-route adaptive parameter learning (spec §4.8): window size, paclen, retry count
//! and RTO bounds tuned from observed link quality, cached per (destination, path
//! signature) with a TTL so a route that hasn't been heard from in a while falls back to
//! the configured defaults rather than trusting a stale sample. When more than one
//! session is concurrently open to the same destination, callers ask for the *merged
//! conservative* config across all of them so two connections to the same peer never
//! fight over window/paclen mid-transfer.

use ax25::SessionConfig;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

const LOSS_SEVERE: f64 = 0.20;
const LOSS_MODERATE: f64 = 0.10;
const ETX_SEVERE: f64 = 2.0;

/// One link-quality observation fed in after a session's retransmission bookkeeping is
/// updated (typically once per T1 cycle or on disconnect).
#[derive(Debug, Clone, Copy)]
pub struct LinkSample {
    pub frames_sent: u32,
    pub retransmissions: u32,
    pub srtt: Option<Duration>,
}

impl LinkSample {
    pub fn loss_rate(&self) -> f64 {
        if self.frames_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.frames_sent as f64
        }
    }

    /// Expected transmission count: `1 / (1 - loss)^2`. A loss rate of 1.0 (everything
    /// retransmitted at least once) is treated as infinitely bad rather than dividing by
    /// zero.
    pub fn etx(&self) -> f64 {
        let loss = self.loss_rate();
        if loss >= 1.0 {
            f64::INFINITY
        } else {
            1.0 / (1.0 - loss).powi(2)
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RouteKey {
    pub destination: String,
    pub path_signature: String,
}

impl RouteKey {
    pub fn new(destination: &str, path_signature: &str) -> RouteKey {
        RouteKey { destination: destination.to_string(), path_signature: path_signature.to_string() }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveEntry {
    pub window: u8,
    pub paclen: u16,
    pub retries: u8,
    pub rto_min: Duration,
    pub rto_max: Duration,
    pub srtt: Option<Duration>,
    pub reason: String,
    updated_at: Instant,
}

/// Per-route learned configuration, keyed by (canonical destination, path signature).
pub struct AdaptiveCache {
    entries: HashMap<RouteKey, AdaptiveEntry>,
    ttl: Duration,
}

impl AdaptiveCache {
    pub fn new() -> AdaptiveCache {
        AdaptiveCache { entries: HashMap::new(), ttl: DEFAULT_TTL }
    }

    pub fn with_ttl(ttl: Duration) -> AdaptiveCache {
        AdaptiveCache { entries: HashMap::new(), ttl }
    }

    /// Folds a new link sample into the cached entry for `route`, applying the spec's
    /// threshold heuristics against `baseline` (the statically-configured defaults, used
    /// as the starting point for the "stable" case's headroom growth). Returns the
    /// resulting entry.
    pub fn record_sample(&mut self, route: RouteKey, baseline: &SessionConfig, sample: LinkSample, now: Instant) -> &AdaptiveEntry {
        let current = self.get_fresh(&route, now).cloned();
        let base_window = current.as_ref().map_or(baseline.window_size, |e| e.window);
        let base_paclen = current.as_ref().map_or(baseline.paclen, |e| e.paclen);

        let loss = sample.loss_rate();
        let etx = sample.etx();

        let (window, paclen, reason) = if loss > LOSS_SEVERE || etx > ETX_SEVERE {
            (1u8, 64u16, format!("loss {:.0}% / etx {:.2} exceeds severe threshold, dropping to minimum", loss * 100.0, etx))
        } else if loss > LOSS_MODERATE {
            (
                std::cmp::min(base_window, 2),
                std::cmp::min(base_paclen, 128),
                format!("loss {:.0}% in moderate band, holding window/paclen down", loss * 100.0),
            )
        } else {
            (
                std::cmp::min(base_window.saturating_add(1), 4),
                std::cmp::min(base_paclen.saturating_add(64), 256),
                "stable link, easing window/paclen back up".to_string(),
            )
        };

        let (rto_min, rto_max) = match sample.srtt {
            Some(srtt) => (
                std::cmp::max(baseline.rto_min, srtt / 4),
                std::cmp::max(baseline.rto_max, srtt * 4),
            ),
            None => (baseline.rto_min, baseline.rto_max),
        };

        let entry = AdaptiveEntry {
            window: window.max(1),
            paclen: paclen.max(32),
            retries: baseline.max_retries,
            rto_min,
            rto_max,
            srtt: sample.srtt.or_else(|| current.and_then(|e| e.srtt)),
            reason,
            updated_at: now,
        };
        self.entries.insert(route.clone(), entry);
        self.entries.get(&route).expect("just inserted")
    }

    /// Returns the cached entry for `route` if present and not past its TTL; a stale
    /// entry is treated as absent so defaults take over until a fresh sample arrives.
    pub fn get_fresh(&self, route: &RouteKey, now: Instant) -> Option<&AdaptiveEntry> {
        self.entries.get(route).filter(|e| now.duration_since(e.updated_at) <= self.ttl)
    }

    /// Applies the cached (or default, if stale/absent) config for `route` on top of
    /// `baseline`, returning the config a new session to that route should start with.
    pub fn resolve(&self, route: &RouteKey, baseline: &SessionConfig, now: Instant) -> SessionConfig {
        let mut config = baseline.clone();
        if let Some(entry) = self.get_fresh(route, now) {
            config.window_size = entry.window;
            config.paclen = entry.paclen;
            config.max_retries = entry.retries;
            config.rto_min = entry.rto_min;
            config.rto_max = entry.rto_max;
        }
        config
    }

    /// Merges the configs of every session currently open to the same destination into
    /// one conservative config: the smallest window, the smallest paclen, the largest
    /// RTO bounds and the largest retry budget of any of them. Prevents two concurrent
    /// connections to one peer from repeatedly overriding each other's tuning mid-transfer.
    pub fn merge_conservative<'a, I: IntoIterator<Item = &'a SessionConfig>>(configs: I) -> Option<SessionConfig> {
        let mut iter = configs.into_iter();
        let mut merged = iter.next()?.clone();
        for config in iter {
            merged.window_size = std::cmp::min(merged.window_size, config.window_size);
            merged.paclen = std::cmp::min(merged.paclen, config.paclen);
            merged.max_retries = std::cmp::max(merged.max_retries, config.max_retries);
            merged.rto_min = std::cmp::max(merged.rto_min, config.rto_min);
            merged.rto_max = std::cmp::max(merged.rto_max, config.rto_max);
        }
        Some(merged)
    }
}

impl Default for AdaptiveCache {
    fn default() -> Self {
        AdaptiveCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> RouteKey {
        RouteKey::new("N0BBB-2", "")
    }

    #[test]
    fn severe_loss_drops_to_minimum_window_and_paclen() {
        let mut cache = AdaptiveCache::new();
        let baseline = SessionConfig::default();
        let now = Instant::now();
        let sample = LinkSample { frames_sent: 10, retransmissions: 3, srtt: None };
        let entry = cache.record_sample(route(), &baseline, sample, now);
        assert_eq!(entry.window, 1);
        assert_eq!(entry.paclen, 64);
    }

    #[test]
    fn moderate_loss_caps_window_and_paclen_without_dropping_to_minimum() {
        let mut cache = AdaptiveCache::new();
        let mut baseline = SessionConfig::default();
        baseline.window_size = 4;
        baseline.paclen = 256;
        let now = Instant::now();
        let sample = LinkSample { frames_sent: 20, retransmissions: 3, srtt: None };
        let entry = cache.record_sample(route(), &baseline, sample, now);
        assert_eq!(entry.window, 2);
        assert_eq!(entry.paclen, 128);
    }

    #[test]
    fn stable_link_eases_window_and_paclen_upward() {
        let mut cache = AdaptiveCache::new();
        let mut baseline = SessionConfig::default();
        baseline.window_size = 1;
        baseline.paclen = 64;
        let now = Instant::now();
        let sample = LinkSample { frames_sent: 100, retransmissions: 1, srtt: None };
        let entry = cache.record_sample(route(), &baseline, sample, now);
        assert_eq!(entry.window, 2);
        assert_eq!(entry.paclen, 128);
    }

    #[test]
    fn stale_entry_is_treated_as_absent() {
        let mut cache = AdaptiveCache::with_ttl(Duration::from_millis(10));
        let baseline = SessionConfig::default();
        let now = Instant::now();
        cache.record_sample(route(), &baseline, LinkSample { frames_sent: 10, retransmissions: 5, srtt: None }, now);
        let resolved = cache.resolve(&route(), &baseline, now + Duration::from_secs(1));
        assert_eq!(resolved.window_size, baseline.window_size);
    }

    #[test]
    fn merge_conservative_takes_the_tightest_bound_from_each_field() {
        let mut a = SessionConfig::default();
        a.window_size = 4;
        a.paclen = 256;
        a.max_retries = 5;
        let mut b = SessionConfig::default();
        b.window_size = 2;
        b.paclen = 128;
        b.max_retries = 8;
        let merged = AdaptiveCache::merge_conservative([&a, &b]).unwrap();
        assert_eq!(merged.window_size, 2);
        assert_eq!(merged.paclen, 128);
        assert_eq!(merged.max_retries, 8);
    }
}
