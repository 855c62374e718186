//! Bolus preflight decision.

use crate::DeliveryConfig;
use pumplink_core::Preflight;
use pumplink_freshness::FreshnessTracker;
use pumplink_reservoir::ReservoirMonitor;
use pumplink_types::DataIntegrityError;
use std::time::Duration;

/// Decide whether a bolus must read fresh status before sending.
///
/// Returns the preflight and, when a read is required, the reason. The read
/// happens inside the delivery session, so the clock check and the volume
/// check are atomic with the decision to deliver.
pub fn plan_preflight(
    freshness: &FreshnessTracker,
    reservoir: &ReservoirMonitor,
    max_clock_skew: Duration,
    config: &DeliveryConfig,
) -> (Preflight, Option<DataIntegrityError>) {
    let read_first = Preflight::ReadFirst { max_clock_skew };

    if let Some(consumed) = reservoir.last_consumption() {
        if consumed < -config.non_monotonic_tolerance {
            return (
                read_first,
                Some(DataIntegrityError::NonMonotonicReservoir {
                    increase: -consumed,
                }),
            );
        }
    }

    if reservoir.latest().is_none() || freshness.is_reservoir_stale(config.reservoir_recency) {
        return (
            read_first,
            Some(DataIntegrityError::StaleReservoir {
                age: freshness.reservoir_age(),
            }),
        );
    }

    (Preflight::Skip, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumplink_types::{ReservoirSample, ReservoirUpdate};

    const NOW: Duration = Duration::from_secs(1_700_000_000);
    const SKEW: Duration = Duration::from_secs(60);

    fn sample(units: f64, at: Duration) -> ReservoirSample {
        ReservoirSample {
            units,
            timestamp: at,
            minutes_to_empty: None,
        }
    }

    fn tracked(previous: f64, units: f64, at: Duration) -> (FreshnessTracker, ReservoirMonitor) {
        let mut freshness = FreshnessTracker::new();
        freshness.set_time(NOW);
        freshness.record_reservoir(at);
        let mut reservoir = ReservoirMonitor::new();
        reservoir.on_sample_stored(&ReservoirUpdate {
            new: sample(units, at),
            previous: Some(sample(previous, at - Duration::from_secs(300))),
            is_continuous: true,
        });
        (freshness, reservoir)
    }

    #[test]
    fn test_no_reading_forces_read() {
        let mut freshness = FreshnessTracker::new();
        freshness.set_time(NOW);
        let reservoir = ReservoirMonitor::new();

        let (preflight, reason) =
            plan_preflight(&freshness, &reservoir, SKEW, &DeliveryConfig::default());
        assert_eq!(preflight, Preflight::ReadFirst { max_clock_skew: SKEW });
        assert_eq!(reason, Some(DataIntegrityError::StaleReservoir { age: None }));
    }

    #[test]
    fn test_old_reading_forces_read() {
        let (freshness, reservoir) = tracked(50.0, 49.0, NOW - Duration::from_secs(6 * 60));
        let (preflight, reason) =
            plan_preflight(&freshness, &reservoir, SKEW, &DeliveryConfig::default());
        assert!(matches!(preflight, Preflight::ReadFirst { .. }));
        assert!(matches!(
            reason,
            Some(DataIntegrityError::StaleReservoir { age: Some(_) })
        ));
    }

    #[test]
    fn test_volume_increase_forces_read() {
        let (freshness, reservoir) = tracked(49.0, 49.5, NOW - Duration::from_secs(60));
        let (preflight, reason) =
            plan_preflight(&freshness, &reservoir, SKEW, &DeliveryConfig::default());
        assert!(matches!(preflight, Preflight::ReadFirst { .. }));
        assert!(matches!(
            reason,
            Some(DataIntegrityError::NonMonotonicReservoir { .. })
        ));
    }

    #[test]
    fn test_fresh_monotonic_reading_skips() {
        let (freshness, reservoir) = tracked(50.0, 49.0, NOW - Duration::from_secs(60));
        let (preflight, reason) =
            plan_preflight(&freshness, &reservoir, SKEW, &DeliveryConfig::default());
        assert_eq!(preflight, Preflight::Skip);
        assert_eq!(reason, None);
    }
}
