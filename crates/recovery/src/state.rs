use pumplink_core::{Action, Event, SubStateMachine, TimerId};
use pumplink_types::time_distance;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for link recovery.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Silence on either source that triggers a reset.
    pub silence_threshold: Duration,
    /// Minimum spacing between resets.
    pub reset_interval: Duration,
    /// How long the radio stays powered off.
    pub power_off_duration: Duration,
    /// Period of the link health timer.
    pub check_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_secs(30 * 60),
            reset_interval: Duration::from_secs(30 * 60),
            power_off_duration: Duration::from_secs(5),
            check_interval: Duration::from_secs(60),
        }
    }
}

impl RecoveryConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

/// Last fresh observation of each source, plus the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkSilenceRecord {
    pub last_pump_data: Option<Duration>,
    pub last_glucose: Option<Duration>,
    pub last_reset: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub resets_started: u64,
    pub resets_failed: u64,
    pub resets_suppressed: u64,
}

/// Link health recovery state machine.
///
/// Sources never observed count as silent since the machine started.
#[derive(Debug)]
pub struct LinkRecovery {
    record: LinkSilenceRecord,
    started_at: Option<Duration>,
    reset_in_flight: bool,
    stats: RecoveryStats,
    now: Duration,
    config: RecoveryConfig,
}

impl Default for LinkRecovery {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRecovery {
    pub fn new() -> Self {
        Self::with_config(RecoveryConfig::default())
    }

    pub fn with_config(config: RecoveryConfig) -> Self {
        Self {
            record: LinkSilenceRecord::default(),
            started_at: None,
            reset_in_flight: false,
            stats: RecoveryStats::default(),
            now: Duration::ZERO,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn record(&self) -> &LinkSilenceRecord {
        &self.record
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }

    pub fn record_pump_data(&mut self, at: Duration) {
        self.record.last_pump_data = Some(at);
    }

    pub fn record_glucose(&mut self, at: Duration) {
        // Out-of-order observations never move the record backwards.
        if self.record.last_glucose.map_or(true, |last| at > last) {
            self.record.last_glucose = Some(at);
        }
    }

    fn silence_of(&self, last: Option<Duration>) -> Duration {
        let since = last.or(self.started_at).unwrap_or(self.now);
        time_distance(self.now, since)
    }

    pub fn pump_silence(&self) -> Duration {
        self.silence_of(self.record.last_pump_data)
    }

    pub fn glucose_silence(&self) -> Duration {
        self.silence_of(self.record.last_glucose)
    }

    /// Check both sources and reset the link if either is silent too long.
    pub fn check(&mut self) -> Vec<Action> {
        let threshold = self.config.silence_threshold;
        let pump = self.pump_silence();
        let glucose = self.glucose_silence();

        if pump >= threshold {
            return self.maybe_reset_link("pump data silent");
        }
        if glucose >= threshold {
            return self.maybe_reset_link("glucose data silent");
        }
        vec![]
    }

    /// Power cycle the radio unless a reset fired within `reset_interval`.
    pub fn maybe_reset_link(&mut self, reason: &'static str) -> Vec<Action> {
        if let Some(last) = self.record.last_reset {
            if time_distance(self.now, last) < self.config.reset_interval {
                self.stats.resets_suppressed += 1;
                debug!(reason, "Link reset suppressed: reset fired recently");
                return vec![];
            }
        }
        if self.reset_in_flight {
            self.stats.resets_suppressed += 1;
            return vec![];
        }

        self.record.last_reset = Some(self.now);
        self.reset_in_flight = true;
        self.stats.resets_started += 1;
        info!(
            reason,
            pump_silence_secs = self.pump_silence().as_secs(),
            glucose_silence_secs = self.glucose_silence().as_secs(),
            "Resetting radio link"
        );
        vec![Action::ResetRadioPower {
            off_for: self.config.power_off_duration,
        }]
    }

    pub fn on_reset_completed(&mut self, result: &Result<(), String>) {
        self.reset_in_flight = false;
        match result {
            Ok(()) => debug!("Radio power cycle completed"),
            Err(error) => {
                self.stats.resets_failed += 1;
                warn!(%error, "Radio power cycle failed");
            }
        }
    }
}

impl SubStateMachine for LinkRecovery {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::LinkHealthTimer => {
                let mut actions = vec![Action::SetTimer {
                    id: TimerId::LinkHealth,
                    duration: self.config.check_interval,
                }];
                actions.extend(self.check());
                Some(actions)
            }
            Event::GlucoseObserved { timestamp } => {
                self.record_glucose(*timestamp);
                Some(vec![])
            }
            Event::LinkResetCompleted { result } => {
                self.on_reset_completed(result);
                Some(vec![])
            }
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }
}
