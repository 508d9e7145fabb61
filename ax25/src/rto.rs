//! Adaptive retransmission timeout estimation, RFC 6298 (Jacobson/Karels) style: smoothed
//! RTT and RTT variance feed an RTO that backs off exponentially on consecutive timeouts
//! and relaxes back down once fresh samples arrive.

use std::time::Duration;

const ALPHA_NUM: u32 = 1;
const ALPHA_DEN: u32 = 8;
const BETA_NUM: u32 = 1;
const BETA_DEN: u32 = 4;

#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min: Duration,
    max: Duration,
    initial: Duration,
}

impl RtoEstimator {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> RtoEstimator {
        RtoEstimator {
            srtt: None,
            rttvar: Duration::from_secs(0),
            rto: initial,
            min,
            max,
            initial,
        }
    }

    #[inline]
    pub fn current(&self) -> Duration {
        self.rto
    }

    /// Folds in a fresh RTT measurement (e.g. SABM->UA, or an I-frame's send time to its
    /// acknowledging RR).
    pub fn on_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = if sample > srtt { sample - srtt } else { srtt - sample };
                self.rttvar = scale(self.rttvar, BETA_DEN - BETA_NUM, BETA_DEN) + scale(diff, BETA_NUM, BETA_DEN);
                self.srtt = Some(scale(srtt, ALPHA_DEN - ALPHA_NUM, ALPHA_DEN) + scale(sample, ALPHA_NUM, ALPHA_DEN));
            }
        }
        let srtt = self.srtt.unwrap();
        let candidate = srtt + std::cmp::max(self.rttvar * 4, Duration::from_millis(1));
        self.rto = clamp(candidate, self.min, self.max);
    }

    /// Backs the RTO off exponentially after a retransmission timeout fires, per Karn's
    /// algorithm (samples from retransmitted frames must not be trusted, so this does not
    /// touch SRTT/RTTVAR).
    pub fn on_timeout(&mut self) {
        self.rto = clamp(self.rto * 2, self.min, self.max);
    }

    pub fn reset(&mut self) {
        self.srtt = None;
        self.rttvar = Duration::from_secs(0);
        self.rto = self.initial;
    }
}

fn scale(d: Duration, num: u32, den: u32) -> Duration {
    Duration::from_nanos((d.as_nanos() as u64).saturating_mul(num as u64) / den as u64)
}

fn clamp(d: Duration, min: Duration, max: Duration) -> Duration {
    if d < min {
        min
    } else if d > max {
        max
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_srtt_directly() {
        let mut rto = RtoEstimator::new(Duration::from_secs(4), Duration::from_millis(500), Duration::from_secs(30));
        rto.on_sample(Duration::from_millis(200));
        assert!(rto.current() >= Duration::from_millis(200));
        assert!(rto.current() <= Duration::from_secs(30));
    }

    #[test]
    fn timeout_backs_off_exponentially_and_clamps_to_max() {
        let mut rto = RtoEstimator::new(Duration::from_secs(1), Duration::from_millis(500), Duration::from_secs(8));
        rto.on_timeout();
        assert_eq!(rto.current(), Duration::from_secs(2));
        rto.on_timeout();
        assert_eq!(rto.current(), Duration::from_secs(4));
        rto.on_timeout();
        assert_eq!(rto.current(), Duration::from_secs(8));
        rto.on_timeout();
        assert_eq!(rto.current(), Duration::from_secs(8));
    }

    #[test]
    fn stable_low_variance_samples_converge_near_the_rtt() {
        let mut rto = RtoEstimator::new(Duration::from_secs(4), Duration::from_millis(10), Duration::from_secs(30));
        for _ in 0..50 {
            rto.on_sample(Duration::from_millis(100));
        }
        assert!(rto.current() < Duration::from_millis(500));
    }
}
