//! Sample-count and wall-time limits.
//!
//! The gate is consulted before every batch is forwarded. It truncates the
//! batch that crosses the sample limit, so exactly `max_samples` samples ever
//! reach the session feed.

use std::time::{Duration, Instant};

use crate::config::AcquisitionLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    All,
    Truncated(usize),
    Deny,
}

impl Admission {
    /// Number of samples out of `requested` that may be forwarded.
    pub fn admitted(self, requested: usize) -> usize {
        match self {
            Admission::All => requested,
            Admission::Truncated(k) => k,
            Admission::Deny => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimitGate {
    max_samples: Option<u64>,
    max_duration: Option<Duration>,
    accepted: u64,
    started: Option<Instant>,
}

impl LimitGate {
    pub fn new(limits: &AcquisitionLimits) -> Self {
        Self {
            max_samples: limits.max_samples,
            max_duration: limits.max_duration,
            accepted: 0,
            started: None,
        }
    }

    /// Starts the wall clock for the time limit and resets the sample count.
    pub fn start(&mut self, now: Instant) {
        self.started = Some(now);
        self.accepted = 0;
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Samples left before the sample limit, `None` if there is none.
    pub fn remaining_samples(&self) -> Option<u64> {
        self.max_samples
            .map(|max| max.saturating_sub(self.accepted))
    }

    pub fn admit(&mut self, n: usize) -> Admission {
        self.admit_at(n, Instant::now())
    }

    pub fn admit_at(&mut self, n: usize, now: Instant) -> Admission {
        if self.time_elapsed(now) {
            return Admission::Deny;
        }
        let admission = match self.remaining_samples() {
            Some(0) => Admission::Deny,
            Some(remaining) if (n as u64) > remaining => Admission::Truncated(remaining as usize),
            _ => Admission::All,
        };
        self.accepted += admission.admitted(n) as u64;
        admission
    }

    pub fn is_exhausted(&self) -> bool {
        self.is_exhausted_at(Instant::now())
    }

    /// Whether either limit has been reached; the acquisition must stop.
    pub fn is_exhausted_at(&self, now: Instant) -> bool {
        self.remaining_samples() == Some(0) || self.time_elapsed(now)
    }

    fn time_elapsed(&self, now: Instant) -> bool {
        match (self.max_duration, self.started) {
            (Some(limit), Some(started)) => now.saturating_duration_since(started) >= limit,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max_samples: Option<u64>, max_duration: Option<Duration>) -> (LimitGate, Instant) {
        let mut gate = LimitGate::new(&AcquisitionLimits {
            max_samples,
            max_duration,
            capture_ratio: 0,
        });
        let now = Instant::now();
        gate.start(now);
        (gate, now)
    }

    #[test]
    fn test_unlimited_admits_everything() {
        let (mut gate, now) = gate(None, None);
        assert_eq!(gate.admit_at(1_000_000, now), Admission::All);
        assert!(!gate.is_exhausted_at(now));
        assert_eq!(gate.accepted(), 1_000_000);
    }

    #[test]
    fn test_sample_limit_is_exact() {
        for k in [1u64, 39, 40, 41, 100, 159, 160, 1000] {
            let (mut gate, now) = gate(Some(k), None);
            let mut forwarded = 0u64;
            for _ in 0..4 {
                forwarded += gate.admit_at(40, now).admitted(40) as u64;
            }
            assert_eq!(forwarded, k.min(160), "limit {k}");
            assert_eq!(gate.is_exhausted_at(now), k <= 160);
        }
    }

    #[test]
    fn test_truncates_then_denies() {
        let (mut gate, now) = gate(Some(100), None);
        assert_eq!(gate.admit_at(40, now), Admission::All);
        assert_eq!(gate.admit_at(40, now), Admission::All);
        assert_eq!(gate.admit_at(40, now), Admission::Truncated(20));
        assert!(gate.is_exhausted_at(now));
        assert_eq!(gate.admit_at(40, now), Admission::Deny);
        assert_eq!(gate.accepted(), 100);
    }

    #[test]
    fn test_time_limit_denies_once_elapsed() {
        let (mut gate, start) = gate(None, Some(Duration::from_millis(50)));
        assert_eq!(
            gate.admit_at(10, start + Duration::from_millis(49)),
            Admission::All
        );
        assert!(gate.is_exhausted_at(start + Duration::from_millis(50)));
        assert_eq!(
            gate.admit_at(10, start + Duration::from_millis(60)),
            Admission::Deny
        );
        assert_eq!(gate.accepted(), 10);
    }
}
