//! FreshnessTracker state.

use pumplink_core::{Action, PumpStatus, SessionPlan, SessionTicket};
use pumplink_dispatch::{Dispatcher, Troubleshooting};
use pumplink_types::{time_distance, RelayId, UploadRecord};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration for staleness and polling.
#[derive(Debug, Clone)]
pub struct FreshnessConfig {
    /// Tolerance when the transport has no wake signal.
    pub stale_without_heartbeat: Duration,
    /// Tolerance when relays deliver a periodic wake signal.
    pub stale_with_heartbeat: Duration,
    /// Attempts per poll chain, the first included.
    pub max_poll_attempts: u32,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            stale_without_heartbeat: Duration::from_secs(4 * 60),
            stale_with_heartbeat: Duration::from_secs(6 * 60),
            max_poll_attempts: 3,
        }
    }
}

impl FreshnessConfig {
    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshnessStats {
    pub chains_started: u64,
    pub chains_finished: u64,
    pub chains_exhausted: u64,
    pub polls_dropped: u64,
    pub attempts: u64,
}

#[derive(Debug, Clone)]
struct PollChain {
    ticket: Option<SessionTicket>,
    relay: Option<RelayId>,
    attempt: u32,
    started_at: Duration,
}

/// Freshness tracker.
///
/// `chain` is the in-flight flag: `Some` from the first attempt until the
/// chain ends, whether by success or exhaustion.
#[derive(Debug)]
pub struct FreshnessTracker {
    heartbeat_capable: bool,

    /// Manual override: data counts as stale until the next trusted read.
    force_read: bool,

    /// Local time of the last trusted pump snapshot.
    last_pump_data: Option<Duration>,

    /// Timestamp of the last stored reservoir sample.
    last_reservoir: Option<Duration>,

    chain: Option<PollChain>,

    /// Tuning session started by troubleshooting after an exhausted chain.
    tuning: Option<(SessionTicket, RelayId)>,

    stats: FreshnessStats,
    now: Duration,
    config: FreshnessConfig,
}

impl Default for FreshnessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self::with_config(FreshnessConfig::default())
    }

    pub fn with_config(config: FreshnessConfig) -> Self {
        Self {
            heartbeat_capable: false,
            force_read: false,
            last_pump_data: None,
            last_reservoir: None,
            chain: None,
            tuning: None,
            stats: FreshnessStats::default(),
            now: Duration::ZERO,
            config,
        }
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn stats(&self) -> FreshnessStats {
        self.stats
    }

    pub fn set_heartbeat_capable(&mut self, capable: bool) {
        if capable != self.heartbeat_capable {
            debug!(capable, "Heartbeat capability changed");
        }
        self.heartbeat_capable = capable;
    }

    pub fn staleness_tolerance(&self) -> Duration {
        if self.heartbeat_capable {
            self.config.stale_with_heartbeat
        } else {
            self.config.stale_without_heartbeat
        }
    }

    pub fn is_pump_data_stale(&self) -> bool {
        if self.force_read {
            return true;
        }
        match self.last_pump_data {
            Some(at) => time_distance(self.now, at) > self.staleness_tolerance(),
            None => true,
        }
    }

    /// Whether the last reservoir sample is older than `relative_to`, or missing.
    pub fn is_reservoir_stale(&self, relative_to: Duration) -> bool {
        self.reservoir_age().map_or(true, |age| age > relative_to)
    }

    pub fn reservoir_age(&self) -> Option<Duration> {
        self.last_reservoir.map(|at| time_distance(self.now, at))
    }

    pub fn pump_data_age(&self) -> Option<Duration> {
        self.last_pump_data.map(|at| time_distance(self.now, at))
    }

    pub fn force_read(&mut self) {
        self.force_read = true;
    }

    pub fn is_force_read(&self) -> bool {
        self.force_read
    }

    pub fn is_polling(&self) -> bool {
        self.chain.is_some()
    }

    pub fn owns_poll(&self, ticket: SessionTicket) -> bool {
        self.chain.as_ref().and_then(|c| c.ticket) == Some(ticket)
    }

    pub fn owns_tuning(&self, ticket: SessionTicket) -> bool {
        self.tuning.is_some_and(|(t, _)| t == ticket)
    }

    /// A trusted snapshot was processed.
    pub fn record_pump_data(&mut self) {
        self.last_pump_data = Some(self.now);
        self.force_read = false;
    }

    pub fn record_reservoir(&mut self, timestamp: Duration) {
        self.last_reservoir = Some(timestamp);
    }

    /// Start a poll chain unless one is already in flight.
    pub fn trigger_poll(&mut self, dispatcher: &mut Dispatcher) -> Vec<Action> {
        if self.chain.is_some() {
            self.stats.polls_dropped += 1;
            trace!("Poll dropped: chain already in flight");
            return vec![];
        }
        if let Some(relay) = dispatcher.preferred_relay().filter(|r| dispatcher.is_busy(*r)) {
            // Another session holds the relay; this poll never starts.
            self.stats.polls_dropped += 1;
            debug!(relay = %relay, "Poll dropped: relay busy");
            return vec![];
        }

        self.chain = Some(PollChain {
            ticket: None,
            relay: None,
            attempt: 0,
            started_at: self.now,
        });
        self.stats.chains_started += 1;
        debug!(forced = self.force_read, "Poll chain started");
        self.next_attempt(dispatcher)
    }

    fn next_attempt(&mut self, dispatcher: &mut Dispatcher) -> Vec<Action> {
        let Some(chain) = self.chain.as_mut() else {
            return vec![];
        };
        chain.attempt += 1;
        chain.ticket = None;
        self.stats.attempts += 1;

        let plan = SessionPlan::ReadStatus;
        match dispatcher.begin(plan.label(), None) {
            Ok(lease) => {
                chain.ticket = Some(lease.ticket);
                chain.relay = Some(lease.relay);
                trace!(attempt = chain.attempt, relay = %lease.relay, "Poll attempt");
                vec![Action::RunSession {
                    ticket: lease.ticket,
                    relay: lease.relay,
                    label: lease.label,
                    plan,
                }]
            }
            // Retrying in the same instant cannot help.
            Err(e) => self.exhaust(e.to_string(), dispatcher),
        }
    }

    /// The chain's session returned a snapshot. Ends the chain.
    ///
    /// Returns `false` if the ticket does not belong to the current chain.
    pub fn on_poll_succeeded(&mut self, ticket: SessionTicket) -> bool {
        if !self.owns_poll(ticket) {
            return false;
        }
        if let Some(chain) = self.finish_chain() {
            debug!(
                attempts = chain.attempt,
                elapsed_ms = time_distance(self.now, chain.started_at).as_millis() as u64,
                "Poll chain succeeded"
            );
        }
        true
    }

    /// The chain's session failed. Retries or, once attempts are used up,
    /// ends the chain as exhausted.
    pub fn on_poll_failed(
        &mut self,
        ticket: SessionTicket,
        error: String,
        dispatcher: &mut Dispatcher,
    ) -> Vec<Action> {
        let Some(chain) = self.chain.as_ref().filter(|c| c.ticket == Some(ticket)) else {
            trace!(ticket = %ticket, "Ignoring failure for unknown poll");
            return vec![];
        };

        if chain.attempt < self.config.max_poll_attempts {
            debug!(attempt = chain.attempt, %error, "Poll attempt failed, retrying");
            return self.next_attempt(dispatcher);
        }
        self.exhaust(error, dispatcher)
    }

    fn exhaust(&mut self, error: String, dispatcher: &mut Dispatcher) -> Vec<Action> {
        let Some(chain) = self.finish_chain() else {
            return vec![];
        };
        self.stats.chains_exhausted += 1;
        warn!(attempts = chain.attempt, %error, "Poll chain exhausted");

        let mut actions = vec![
            Action::Upload(UploadRecord::DeviceStatus {
                at: self.now,
                snapshot: None,
                battery_fraction: None,
                error: Some(error.clone()),
            }),
            Action::PublishPumpStatus(PumpStatus::Unavailable {
                error,
                at: self.now,
            }),
        ];

        if let Some(relay) = chain.relay {
            match dispatcher.troubleshoot(relay) {
                Troubleshooting::Tune(lease) => {
                    self.tuning = Some((lease.ticket, lease.relay));
                    actions.push(Action::RunSession {
                        ticket: lease.ticket,
                        relay: lease.relay,
                        label: lease.label,
                        plan: SessionPlan::Tune,
                    });
                }
                Troubleshooting::Deprioritized(_) => {}
                Troubleshooting::Unavailable(e) => {
                    debug!(relay = %relay, error = %e, "Troubleshooting not possible");
                }
            }
        }
        actions
    }

    /// Clears the in-flight flag. The only place a chain ends.
    fn finish_chain(&mut self) -> Option<PollChain> {
        let chain = self.chain.take()?;
        self.stats.chains_finished += 1;
        Some(chain)
    }

    /// A troubleshooting tuning session finished.
    pub fn on_tuning_completed(
        &mut self,
        ticket: SessionTicket,
        result: Result<f64, String>,
        dispatcher: &mut Dispatcher,
    ) {
        let relay = match self.tuning {
            Some((t, relay)) if t == ticket => relay,
            _ => return,
        };
        self.tuning = None;
        match result {
            Ok(frequency_mhz) => {
                info!(relay = %relay, frequency_mhz, "Relay tuning succeeded");
                dispatcher.record_tuning(relay, frequency_mhz);
            }
            Err(error) => warn!(relay = %relay, %error, "Relay tuning failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumplink_types::RelayHandle;
    use tracing_test::traced_test;

    const START: Duration = Duration::from_secs(1_700_000_000);
    const MINUTE: Duration = Duration::from_secs(60);

    fn setup(relays: &[u32]) -> (FreshnessTracker, Dispatcher) {
        let mut tracker = FreshnessTracker::new();
        let mut dispatcher = Dispatcher::new();
        tracker.set_time(START);
        dispatcher.set_time(START);
        let handles: Vec<_> = relays
            .iter()
            .map(|id| RelayHandle::connected(RelayId(*id), "relay"))
            .collect();
        dispatcher.update_relays(&handles);
        (tracker, dispatcher)
    }

    fn poll_ticket(actions: &[Action]) -> SessionTicket {
        actions
            .iter()
            .find_map(|a| match a {
                Action::RunSession {
                    ticket,
                    plan: SessionPlan::ReadStatus,
                    ..
                } => Some(*ticket),
                _ => None,
            })
            .expect("poll session")
    }

    #[test]
    fn test_tolerance_depends_on_heartbeat() {
        let (mut tracker, _) = setup(&[1]);
        assert!(tracker.is_pump_data_stale());

        tracker.record_pump_data();
        tracker.set_time(START + 5 * MINUTE);
        assert!(tracker.is_pump_data_stale());

        tracker.set_heartbeat_capable(true);
        assert!(!tracker.is_pump_data_stale());

        tracker.force_read();
        assert!(tracker.is_pump_data_stale());
        tracker.record_pump_data();
        assert!(!tracker.is_force_read());
    }

    #[test]
    fn test_reservoir_staleness() {
        let (mut tracker, _) = setup(&[1]);
        assert!(tracker.is_reservoir_stale(5 * MINUTE));

        tracker.record_reservoir(START - 2 * MINUTE);
        assert!(!tracker.is_reservoir_stale(5 * MINUTE));
        assert!(tracker.is_reservoir_stale(MINUTE));
    }

    #[test]
    fn test_second_poll_is_dropped() {
        let (mut tracker, mut dispatcher) = setup(&[1]);

        let first = tracker.trigger_poll(&mut dispatcher);
        let ticket = poll_ticket(&first);
        assert!(tracker.is_polling());

        assert!(tracker.trigger_poll(&mut dispatcher).is_empty());
        assert_eq!(tracker.stats().polls_dropped, 1);

        dispatcher.complete(ticket, None, true);
        assert!(tracker.on_poll_succeeded(ticket));
        assert!(!tracker.is_polling());
        assert_eq!(tracker.stats().chains_finished, 1);
    }

    #[traced_test]
    #[test]
    fn test_chain_retries_then_exhausts_once() {
        let (mut tracker, mut dispatcher) = setup(&[1]);

        let mut actions = tracker.trigger_poll(&mut dispatcher);
        for attempt in 1..=3 {
            let ticket = poll_ticket(&actions);
            assert!(tracker.is_polling(), "in flight during attempt {attempt}");
            dispatcher.complete(ticket, None, false);
            actions = tracker.on_poll_failed(ticket, "timeout".into(), &mut dispatcher);
        }

        assert!(!tracker.is_polling());
        assert!(logs_contain("Poll chain exhausted"));
        let stats = tracker.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.chains_started, 1);
        assert_eq!(stats.chains_finished, 1);
        assert_eq!(stats.chains_exhausted, 1);

        assert!(actions.iter().any(|a| matches!(
            a,
            Action::PublishPumpStatus(PumpStatus::Unavailable { .. })
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Upload(UploadRecord::DeviceStatus { error: Some(_), .. })
        )));

        // Never tuned, so troubleshooting tunes the relay.
        let tune = actions
            .iter()
            .find_map(|a| match a {
                Action::RunSession {
                    ticket,
                    plan: SessionPlan::Tune,
                    ..
                } => Some(*ticket),
                _ => None,
            })
            .unwrap();
        assert!(tracker.owns_tuning(tune));
        dispatcher.complete(tune, None, true);
        tracker.on_tuning_completed(tune, Ok(916.7), &mut dispatcher);
        assert_eq!(
            dispatcher.link_state(RelayId(1)).unwrap().frequency_mhz,
            Some(916.7)
        );
    }

    #[test]
    fn test_no_relay_ends_chain_without_retry() {
        let (mut tracker, mut dispatcher) = setup(&[]);

        let actions = tracker.trigger_poll(&mut dispatcher);
        assert!(!tracker.is_polling());
        assert_eq!(tracker.stats().attempts, 1);
        assert_eq!(tracker.stats().chains_finished, 1);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::PublishPumpStatus(PumpStatus::Unavailable { .. })
        )));
    }

    #[test]
    fn test_busy_relay_drops_poll() {
        let (mut tracker, mut dispatcher) = setup(&[1]);
        let _delivery = dispatcher.begin("deliver_bolus", None).unwrap();

        assert!(tracker.trigger_poll(&mut dispatcher).is_empty());
        assert!(!tracker.is_polling());
        assert_eq!(tracker.stats().chains_started, 0);
        assert_eq!(tracker.stats().polls_dropped, 1);
    }

    #[test]
    fn test_late_result_for_finished_chain_is_ignored() {
        let (mut tracker, mut dispatcher) = setup(&[1]);
        let ticket = poll_ticket(&tracker.trigger_poll(&mut dispatcher));
        dispatcher.complete(ticket, None, true);
        assert!(tracker.on_poll_succeeded(ticket));

        assert!(!tracker.on_poll_succeeded(ticket));
        assert!(tracker
            .on_poll_failed(ticket, "late".into(), &mut dispatcher)
            .is_empty());
        assert_eq!(tracker.stats().chains_finished, 1);
    }
}
