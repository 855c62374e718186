//! ReservoirMonitor sub-state machine.

use crate::battery::BatteryChemistry;
use pumplink_core::{Action, Event, SubStateMachine};
use pumplink_types::{
    time_distance, BatteryReading, DomainEvent, Notification, ReservoirSample, ReservoirUpdate,
    UploadRecord,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for reservoir and battery monitoring.
#[derive(Debug, Clone)]
pub struct ReservoirConfig {
    /// Low-reservoir thresholds in units, any order.
    pub low_thresholds: Vec<u32>,
    /// Volume increase above which a rewind is assumed.
    pub rewind_delta: f64,
    /// Charge fraction jump treated as a battery replacement.
    pub battery_replacement_jump: f64,
    pub chemistry: BatteryChemistry,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            low_thresholds: vec![30, 20, 10],
            rewind_delta: 1.0,
            battery_replacement_jump: 0.5,
            chemistry: BatteryChemistry::Alkaline,
        }
    }
}

impl ReservoirConfig {
    pub fn with_chemistry(mut self, chemistry: BatteryChemistry) -> Self {
        self.chemistry = chemistry;
        self
    }

    pub fn with_low_thresholds(mut self, thresholds: Vec<u32>) -> Self {
        self.low_thresholds = thresholds;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservoirStats {
    pub samples: u64,
    pub low_events: u64,
    pub empty_events: u64,
    pub rewinds: u64,
    pub battery_replacements: u64,
}

/// Reservoir/battery monitor.
///
/// Handles `Event::ReservoirSampleStored` and emits notifications for low and
/// empty reservoir. Battery readings are fed in by the node from trusted
/// snapshots.
#[derive(Debug)]
pub struct ReservoirMonitor {
    /// Latest stored sample.
    latest: Option<ReservoirSample>,

    /// Units consumed between the last two continuous samples. Negative means
    /// the volume went up.
    last_consumption: Option<f64>,

    battery_fraction: Option<f64>,

    stats: ReservoirStats,
    now: Duration,
    config: ReservoirConfig,
}

impl Default for ReservoirMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservoirMonitor {
    pub fn new() -> Self {
        Self::with_config(ReservoirConfig::default())
    }

    pub fn with_config(mut config: ReservoirConfig) -> Self {
        config.low_thresholds.sort_unstable_by(|a, b| b.cmp(a));
        config.low_thresholds.dedup();
        Self {
            latest: None,
            last_consumption: None,
            battery_fraction: None,
            stats: ReservoirStats::default(),
            now: Duration::ZERO,
            config,
        }
    }

    pub fn latest(&self) -> Option<&ReservoirSample> {
        self.latest.as_ref()
    }

    pub fn last_consumption(&self) -> Option<f64> {
        self.last_consumption
    }

    pub fn battery_fraction(&self) -> Option<f64> {
        self.battery_fraction
    }

    pub fn stats(&self) -> ReservoirStats {
        self.stats
    }

    /// Build the sample for a trusted reading, estimating time to empty from
    /// the previous sample's consumption rate.
    pub fn sample_at(&self, units: f64, timestamp: Duration) -> ReservoirSample {
        let minutes_to_empty = self.latest.and_then(|previous| {
            let minutes = timestamp.checked_sub(previous.timestamp)?.as_secs_f64() / 60.0;
            let rate = (previous.units - units) / minutes;
            (minutes > 0.0 && rate > 0.0).then(|| units.max(0.0) / rate)
        });
        ReservoirSample {
            units,
            timestamp,
            minutes_to_empty,
        }
    }

    /// Domain events for a new sample given the previous one.
    ///
    /// Without a previous sample nothing can have been crossed. Only the
    /// lowest newly crossed threshold fires, and none fire alongside the
    /// empty event.
    pub fn observe(
        &self,
        sample: &ReservoirSample,
        previous: Option<&ReservoirSample>,
    ) -> Vec<DomainEvent> {
        let Some(previous) = previous else {
            return vec![];
        };
        let mut events = Vec::new();

        if sample.units > previous.units + self.config.rewind_delta {
            events.push(DomainEvent::ReservoirRewound {
                previous: previous.units,
                current: sample.units,
            });
            return events;
        }

        if previous.units > 0.0 && sample.units <= 0.0 {
            events.push(DomainEvent::ReservoirEmpty);
            return events;
        }

        let crossed = self
            .config
            .low_thresholds
            .iter()
            .copied()
            .filter(|t| previous.units > f64::from(*t) && sample.units <= f64::from(*t))
            .min();
        if let Some(threshold) = crossed {
            events.push(DomainEvent::ReservoirLow {
                threshold,
                units: sample.units,
            });
        }
        events
    }

    /// Record a stored sample and translate its events into notifications.
    pub fn on_sample_stored(&mut self, update: &ReservoirUpdate) -> Vec<Action> {
        self.stats.samples += 1;

        // Only a continuous pair says anything about the trend.
        self.last_consumption = match (update.is_continuous, update.previous) {
            (true, Some(previous)) => Some(previous.units - update.new.units),
            _ => None,
        };
        self.latest = Some(update.new);

        let events = self.observe(&update.new, update.previous.as_ref());
        let mut actions = Vec::new();
        for event in events {
            match event {
                DomainEvent::ReservoirEmpty => {
                    self.stats.empty_events += 1;
                    warn!("Reservoir empty");
                    actions.push(Action::Notify(Notification::EmptyReservoir));
                }
                DomainEvent::ReservoirLow { threshold, units } => {
                    self.stats.low_events += 1;
                    info!(threshold, units, "Reservoir low");
                    actions.push(Action::Notify(Notification::LowReservoir {
                        units,
                        threshold,
                    }));
                }
                DomainEvent::ReservoirRewound { previous, current } => {
                    self.stats.rewinds += 1;
                    info!(previous, current, "Reservoir volume rose, assuming rewind");
                    actions.push(Action::Upload(UploadRecord::DeviceEvent {
                        at: update.new.timestamp,
                        event,
                    }));
                }
                DomainEvent::BatteryEmpty | DomainEvent::BatteryReplaced { .. } => {}
            }
        }

        debug!(
            units = update.new.units,
            continuous = update.is_continuous,
            minutes_to_empty = ?update.new.minutes_to_empty,
            age_secs = time_distance(self.now, update.new.timestamp).as_secs(),
            "Reservoir sample stored"
        );
        actions
    }

    /// Update the battery level from a trusted reading.
    pub fn observe_battery(&mut self, reading: &BatteryReading) -> Vec<DomainEvent> {
        let Some(current) = self.config.chemistry.fraction(reading) else {
            return vec![];
        };
        let previous = self.battery_fraction.replace(current);

        let mut events = Vec::new();
        if let Some(previous) = previous {
            if previous > 0.0 && current <= 0.0 {
                events.push(DomainEvent::BatteryEmpty);
            } else if current - previous >= self.config.battery_replacement_jump {
                self.stats.battery_replacements += 1;
                info!(previous, current, "Battery replaced");
                events.push(DomainEvent::BatteryReplaced { previous, current });
            }
        }
        events
    }

    /// Battery events as actions: a notification when empty, an upload when
    /// the battery was replaced.
    pub fn on_battery(&mut self, reading: &BatteryReading) -> Vec<Action> {
        self.observe_battery(reading)
            .into_iter()
            .filter_map(|event| match event {
                DomainEvent::BatteryEmpty => {
                    warn!("Battery empty");
                    Some(Action::Notify(Notification::LowBattery))
                }
                DomainEvent::BatteryReplaced { .. } => {
                    Some(Action::Upload(UploadRecord::DeviceEvent { at: self.now, event }))
                }
                _ => None,
            })
            .collect()
    }
}

impl SubStateMachine for ReservoirMonitor {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::ReservoirSampleStored { result: Ok(update) } => {
                Some(self.on_sample_stored(update))
            }
            Event::ReservoirSampleStored { result: Err(error) } => {
                warn!(%error, "Reservoir sample was not stored");
                Some(vec![])
            }
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}
