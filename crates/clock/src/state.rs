use pumplink_types::time_distance;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the clock synchronizer.
#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Largest accepted deviation between pump time and local time.
    pub max_skew: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            max_skew: Duration::from_secs(60),
        }
    }
}

impl ClockConfig {
    pub fn with_max_skew(mut self, max_skew: Duration) -> Self {
        self.max_skew = max_skew;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockStats {
    pub accepted: u64,
    pub rejected: u64,
    pub corrections_started: u64,
    pub corrections_failed: u64,
}

/// Tracks trust in the pump clock.
///
/// At most one correction is pending or in flight at a time. A correction
/// that fails is logged and not retried; the next rejected timestamp asks
/// for a new one.
#[derive(Debug)]
pub struct ClockSync {
    correction_due: bool,
    correction_in_flight: bool,
    last_skew: Option<Duration>,
    stats: ClockStats,
    now: Duration,
    config: ClockConfig,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    pub fn new() -> Self {
        Self::with_config(ClockConfig::default())
    }

    pub fn with_config(config: ClockConfig) -> Self {
        Self {
            correction_due: false,
            correction_in_flight: false,
            last_skew: None,
            stats: ClockStats::default(),
            now: Duration::ZERO,
            config,
        }
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn max_skew(&self) -> Duration {
        self.config.max_skew
    }

    pub fn stats(&self) -> ClockStats {
        self.stats
    }

    /// Skew observed by the most recent rejection.
    pub fn last_skew(&self) -> Option<Duration> {
        self.last_skew
    }

    /// Whether `candidate` is within `max_skew` of `local`.
    pub fn is_trustworthy(candidate: Duration, local: Duration, max_skew: Duration) -> bool {
        time_distance(candidate, local) <= max_skew
    }

    /// Check a pump-reported timestamp against local time.
    ///
    /// Returns `false` if the timestamp must not be trusted. In that case a
    /// clock correction becomes due unless one is already in flight.
    pub fn assert_clock(&mut self, candidate: Duration) -> bool {
        if Self::is_trustworthy(candidate, self.now, self.config.max_skew) {
            self.stats.accepted += 1;
            return true;
        }

        let skew = time_distance(candidate, self.now);
        self.stats.rejected += 1;
        self.last_skew = Some(skew);

        if self.correction_in_flight {
            warn!(
                skew_secs = skew.as_secs(),
                "Pump clock untrustworthy, correction already in flight"
            );
        } else {
            warn!(
                skew_secs = skew.as_secs(),
                "Pump clock untrustworthy, scheduling correction"
            );
            self.correction_due = true;
        }
        false
    }

    pub fn correction_due(&self) -> bool {
        self.correction_due && !self.correction_in_flight
    }

    /// Claim the pending correction. Returns `true` if the caller should
    /// now run a clock-set session.
    pub fn take_correction(&mut self) -> bool {
        if !self.correction_due() {
            return false;
        }
        self.correction_due = false;
        self.correction_in_flight = true;
        self.stats.corrections_started += 1;
        true
    }

    pub fn is_correcting(&self) -> bool {
        self.correction_in_flight
    }

    /// Record the end of a clock-set session, or the failure to start one.
    ///
    /// `result` carries the pump clock read back after setting.
    pub fn on_correction_finished(&mut self, result: Result<Duration, String>) {
        self.correction_in_flight = false;
        match result {
            Ok(pump_clock) if Self::is_trustworthy(pump_clock, self.now, self.config.max_skew) => {
                info!("Pump clock corrected");
                self.last_skew = None;
            }
            Ok(pump_clock) => {
                self.stats.corrections_failed += 1;
                warn!(
                    skew_secs = time_distance(pump_clock, self.now).as_secs(),
                    "Pump clock still off after correction"
                );
            }
            Err(error) => {
                self.stats.corrections_failed += 1;
                warn!(%error, "Pump clock correction failed");
            }
        }
        debug!(stats = ?self.stats, "Clock correction finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const NOW: Duration = Duration::from_secs(1_700_000_000);

    fn sync() -> ClockSync {
        let mut sync = ClockSync::new();
        sync.set_time(NOW);
        sync
    }

    #[test]
    fn test_accepts_within_skew() {
        let mut sync = sync();
        assert!(sync.assert_clock(NOW + Duration::from_secs(60)));
        assert!(sync.assert_clock(NOW - Duration::from_secs(59)));
        assert!(!sync.correction_due());
        assert_eq!(sync.stats().accepted, 2);
    }

    #[traced_test]
    #[test]
    fn test_rejection_schedules_one_correction() {
        let mut sync = sync();
        assert!(!sync.assert_clock(NOW + Duration::from_secs(61)));
        assert!(logs_contain("scheduling correction"));
        assert!(sync.correction_due());

        assert!(sync.take_correction());
        assert!(!sync.take_correction());

        // Further rejections while correcting do not queue another.
        assert!(!sync.assert_clock(NOW - Duration::from_secs(3600)));
        assert!(!sync.correction_due());
        assert_eq!(sync.last_skew(), Some(Duration::from_secs(3600)));
    }

    #[traced_test]
    #[test]
    fn test_failed_correction_is_not_retried() {
        let mut sync = sync();
        sync.assert_clock(NOW + Duration::from_secs(600));
        assert!(sync.take_correction());

        sync.on_correction_finished(Err("relay busy".into()));
        assert!(logs_contain("Pump clock correction failed"));
        assert!(!sync.is_correcting());
        assert!(!sync.correction_due());
        assert_eq!(sync.stats().corrections_failed, 1);

        // A new rejection asks again.
        sync.assert_clock(NOW + Duration::from_secs(600));
        assert!(sync.correction_due());
    }

    #[test]
    fn test_successful_correction_clears_skew() {
        let mut sync = sync();
        sync.assert_clock(NOW + Duration::from_secs(600));
        sync.take_correction();
        sync.on_correction_finished(Ok(NOW));
        assert_eq!(sync.last_skew(), None);
        assert_eq!(sync.stats().corrections_failed, 0);
    }
}
