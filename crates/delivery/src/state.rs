//! DeliveryMachine state.

use crate::preflight::plan_preflight;
use pumplink_clock::ClockSync;
use pumplink_core::{
    Action, DeliveryOutcome, DeliveryReport, Event, Preflight, SessionPlan, SessionTicket, TimerId,
};
use pumplink_dispatch::Dispatcher;
use pumplink_freshness::FreshnessTracker;
use pumplink_reservoir::ReservoirMonitor;
use pumplink_types::{
    time_distance, ConfigurationError, DataIntegrityError, DeliveryError, DeliveryFailure,
    DoseClassification, DoseCommand, DoseError, DoseId, DoseKind, DoseRecord, LinkError,
    Notification, PumpFault, RequestId, UploadRecord,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration for dose delivery.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Attempts per command while failures stay uncertain, the first included.
    pub max_attempts: u32,
    /// A bolus reads fresh status first if the last reservoir sample is older.
    pub reservoir_recency: Duration,
    /// Volume increase between samples tolerated before a bolus reads fresh status first.
    pub non_monotonic_tolerance: f64,
    /// A confirmed temp basal triggers a poll if pump data is older than this.
    pub history_recency: Duration,
    /// Delay before the freshness re-check after a confirmed bolus.
    pub recheck_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            reservoir_recency: Duration::from_secs(5 * 60),
            non_monotonic_tolerance: 0.1,
            history_recency: Duration::from_secs(5 * 60),
            recheck_delay: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_reservoir_recency(mut self, window: Duration) -> Self {
        self.reservoir_recency = window;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub requested: u64,
    pub confirmed: u64,
    pub confirmed_ambiguous: u64,
    pub certain_failures: u64,
    pub uncertain_failures: u64,
    pub rejected_in_progress: u64,
    pub retries: u64,
    pub late_results: u64,
}

/// Sibling state a delivery step reads, plus the dispatcher it drives.
pub struct DeliveryContext<'a> {
    pub dispatcher: &'a mut Dispatcher,
    pub freshness: &'a FreshnessTracker,
    pub reservoir: &'a ReservoirMonitor,
    pub clock: &'a ClockSync,
}

#[derive(Debug)]
struct Pending {
    command: DoseCommand,
    /// Delivery commands transmitted across all attempts.
    commands_sent: u32,
}

/// Dose delivery state machine.
///
/// Commands live in `pending` from request until terminal classification;
/// results for anything no longer pending are ignored.
#[derive(Debug)]
pub struct DeliveryMachine {
    pending: BTreeMap<DoseId, Pending>,
    tickets: BTreeMap<SessionTicket, DoseId>,
    next_dose: u64,
    stats: DeliveryStats,
    now: Duration,
    config: DeliveryConfig,
}

impl Default for DeliveryMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryMachine {
    pub fn new() -> Self {
        Self::with_config(DeliveryConfig::default())
    }

    pub fn with_config(config: DeliveryConfig) -> Self {
        Self {
            pending: BTreeMap::new(),
            tickets: BTreeMap::new(),
            next_dose: 1,
            stats: DeliveryStats::default(),
            now: Duration::ZERO,
            config,
        }
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    pub fn owns(&self, ticket: SessionTicket) -> bool {
        self.tickets.contains_key(&ticket)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The bolus currently in delivery, if any.
    pub fn active_bolus(&self) -> Option<DoseId> {
        self.pending
            .values()
            .find(|p| p.command.kind.is_bolus())
            .map(|p| p.command.id)
    }

    pub fn command(&self, id: DoseId) -> Option<&DoseCommand> {
        self.pending.get(&id).map(|p| &p.command)
    }

    /// Handle a dose recommendation.
    pub fn request(
        &mut self,
        request: RequestId,
        kind: DoseKind,
        ctx: DeliveryContext<'_>,
    ) -> Vec<Action> {
        self.stats.requested += 1;

        if let Err(reason) = validate(&kind) {
            warn!(request = %request, %kind, reason, "Dose request rejected");
            self.stats.certain_failures += 1;
            return vec![Action::ResolveDose {
                request,
                result: Err(DeliveryError::Certain(DeliveryFailure::Pump(
                    PumpFault::Refused(reason.to_string()),
                ))
                .into()),
            }];
        }

        if kind.is_bolus() {
            if let Some(active) = self.active_bolus() {
                self.stats.rejected_in_progress += 1;
                warn!(
                    request = %request,
                    active = %active,
                    "Bolus rejected: another is in delivery"
                );
                return vec![Action::ResolveDose {
                    request,
                    result: Err(ConfigurationError::DeliveryInProgress(active).into()),
                }];
            }
        }

        let id = DoseId(self.next_dose);
        self.next_dose += 1;

        let preflight = if kind.is_bolus() {
            let (preflight, reason) =
                plan_preflight(ctx.freshness, ctx.reservoir, ctx.clock.max_skew(), &self.config);
            if let Some(reason) = reason {
                debug!(dose = %id, %reason, "Bolus will read pump status first");
            }
            preflight
        } else {
            Preflight::Skip
        };

        info!(dose = %id, request = %request, %kind, "Dose requested");
        self.pending.insert(
            id,
            Pending {
                command: DoseCommand::new(id, request, kind, self.now),
                commands_sent: 0,
            },
        );
        self.attempt(id, preflight, ctx.dispatcher)
    }

    fn attempt(
        &mut self,
        id: DoseId,
        preflight: Preflight,
        dispatcher: &mut Dispatcher,
    ) -> Vec<Action> {
        let Some(pending) = self.pending.get_mut(&id) else {
            return vec![];
        };
        let attempt = match pending.command.begin_attempt() {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(dose = %id, error = %e, "Refusing to re-send terminal command");
                return vec![];
            }
        };

        let plan = SessionPlan::Deliver {
            dose: id,
            kind: pending.command.kind,
            preflight,
        };
        match dispatcher.begin(plan.label(), None) {
            Ok(lease) => {
                self.tickets.insert(lease.ticket, id);
                debug!(
                    dose = %id,
                    attempt,
                    relay = %lease.relay,
                    preflight = matches!(preflight, Preflight::ReadFirst { .. }),
                    "Delivery attempt"
                );
                vec![Action::RunSession {
                    ticket: lease.ticket,
                    relay: lease.relay,
                    label: lease.label,
                    plan,
                }]
            }
            Err(e) => self.fail_unsent(id, e),
        }
    }

    /// A delivery session finished.
    pub fn on_session_completed(
        &mut self,
        ticket: SessionTicket,
        result: Result<DeliveryReport, LinkError>,
        ctx: DeliveryContext<'_>,
    ) -> Vec<Action> {
        let Some(id) = self.tickets.remove(&ticket) else {
            self.stats.late_results += 1;
            trace!(ticket = %ticket, "Ignoring result for unknown delivery session");
            return vec![];
        };
        let Some(pending) = self.pending.get_mut(&id) else {
            self.stats.late_results += 1;
            trace!(dose = %id, "Ignoring result for finished command");
            return vec![];
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => return self.fail_unsent(id, e),
        };
        pending.commands_sent += report.commands_sent;
        let sent_this_attempt = report.commands_sent > 0;

        match report.outcome {
            DeliveryOutcome::Acknowledged => self.confirm(id, false, ctx.freshness),
            DeliveryOutcome::ClockRejected { pump_clock } => {
                let skew = time_distance(pump_clock, report.checked_at);
                warn!(dose = %id, skew_secs = skew.as_secs(), "Delivery blocked by pump clock");
                self.fail_unsent(
                    id,
                    DeliveryFailure::DataIntegrity(DataIntegrityError::UntrustworthyClock { skew }),
                )
            }
            DeliveryOutcome::PreflightFailed(fault) => {
                self.fail_unsent(id, DeliveryFailure::Pump(fault))
            }
            DeliveryOutcome::Failed(PumpFault::ConflictingDelivery) => {
                warn!(
                    dose = %id,
                    audit = true,
                    "Pump reports a delivery already active; recording as confirmed"
                );
                self.confirm(id, true, ctx.freshness)
            }
            DeliveryOutcome::Failed(fault) if fault.is_uncertain() => {
                self.on_uncertain(id, fault, ctx.dispatcher)
            }
            // The command left before the link dropped, so the pump may have
            // acted on it. Not retried; history reconciles it.
            DeliveryOutcome::Failed(PumpFault::Link(e)) if sent_this_attempt => {
                self.finish_uncertain(id, DeliveryFailure::Link(e))
            }
            DeliveryOutcome::Failed(fault) => self.fail_sent(id, fault),
        }
    }

    fn on_uncertain(
        &mut self,
        id: DoseId,
        fault: PumpFault,
        dispatcher: &mut Dispatcher,
    ) -> Vec<Action> {
        let Some(pending) = self.pending.get_mut(&id) else {
            return vec![];
        };
        if pending.command.fail(false).is_err() {
            return vec![];
        }
        let attempt = pending.command.attempt();

        if attempt < self.config.max_attempts {
            self.stats.retries += 1;
            warn!(
                dose = %id,
                attempt,
                kind = %pending.command.kind,
                "Delivery unacknowledged while pump powers on, retrying same amount"
            );
            return self.attempt(id, Preflight::Skip, dispatcher);
        }

        self.finish_uncertain(
            id,
            DeliveryFailure::AttemptsExhausted {
                attempts: attempt,
                last: fault,
            },
        )
    }

    /// Nothing was sent on this attempt. Still uncertain if an earlier
    /// attempt may have reached the pump.
    fn fail_unsent(&mut self, id: DoseId, failure: impl Into<FailureCause>) -> Vec<Action> {
        let failure = failure.into();
        if self.was_uncertain(id) {
            return self.finish_uncertain(id, failure.into_delivery());
        }
        self.finish_certain(id, failure)
    }

    fn fail_sent(&mut self, id: DoseId, fault: PumpFault) -> Vec<Action> {
        if self.was_uncertain(id) {
            return self.finish_uncertain(id, DeliveryFailure::Pump(fault));
        }
        self.finish_certain(id, FailureCause::Delivery(DeliveryFailure::Pump(fault)))
    }

    fn was_uncertain(&self, id: DoseId) -> bool {
        self.pending
            .get(&id)
            .is_some_and(|p| p.command.classification() == DoseClassification::UncertainFailure)
    }

    fn confirm(
        &mut self,
        id: DoseId,
        ambiguous: bool,
        freshness: &FreshnessTracker,
    ) -> Vec<Action> {
        let Some(mut pending) = self.pending.remove(&id) else {
            return vec![];
        };
        if let Err(e) = pending.command.confirm(ambiguous) {
            warn!(dose = %id, error = %e, "Ignoring confirmation");
            return vec![];
        }
        self.stats.confirmed += 1;
        if ambiguous {
            self.stats.confirmed_ambiguous += 1;
        }

        let command = &pending.command;
        let record = DoseRecord {
            id,
            kind: command.kind,
            requested_at: command.requested_at,
            confirmed_at: self.now,
            attempts: command.attempt(),
            ambiguous,
        };
        info!(
            dose = %id,
            kind = %command.kind,
            attempts = command.attempt(),
            ambiguous,
            "Dose confirmed"
        );

        let mut actions = vec![
            Action::StoreDoseEvent {
                record: record.clone(),
            },
            Action::Upload(UploadRecord::Treatment(record.clone())),
            Action::ResolveDose {
                request: command.request,
                result: Ok(record),
            },
        ];

        if command.kind.is_bolus() {
            actions.push(Action::SetTimer {
                id: TimerId::DeliveryRecheck,
                duration: self.config.recheck_delay,
            });
        } else if freshness
            .pump_data_age()
            .map_or(true, |age| age > self.config.history_recency)
        {
            debug!(dose = %id, "History not fetched recently, polling after temp basal");
            actions.push(Action::EnqueueInternal {
                event: Event::ForceRead,
            });
        }
        actions
    }

    fn finish_certain(&mut self, id: DoseId, cause: FailureCause) -> Vec<Action> {
        let Some(mut pending) = self.pending.remove(&id) else {
            return vec![];
        };
        if pending.command.fail(true).is_err() {
            return vec![];
        }
        self.stats.certain_failures += 1;

        let command = &pending.command;
        let reason = cause.to_string();
        info!(
            dose = %id,
            kind = %command.kind,
            attempts = command.attempt(),
            %reason,
            "Dose failed"
        );

        let mut actions = vec![
            Action::Notify(Notification::DeliveryFailed {
                kind: command.kind,
                attempted_at: command.requested_at,
                reason,
            }),
            Action::ResolveDose {
                request: command.request,
                result: Err(cause.into_dose_error()),
            },
        ];
        if pending.commands_sent > 0 {
            actions.push(Action::EnqueueInternal {
                event: Event::ForceRead,
            });
        }
        actions
    }

    fn finish_uncertain(&mut self, id: DoseId, failure: DeliveryFailure) -> Vec<Action> {
        let Some(pending) = self.pending.remove(&id) else {
            return vec![];
        };
        self.stats.uncertain_failures += 1;

        let command = &pending.command;
        warn!(
            dose = %id,
            kind = %command.kind,
            attempts = command.attempt(),
            commands_sent = pending.commands_sent,
            error = %failure,
            "Dose outcome unknown, reconciling from pump history"
        );

        vec![
            Action::Notify(Notification::DeliveryFailed {
                kind: command.kind,
                attempted_at: command.requested_at,
                reason: failure.to_string(),
            }),
            Action::ResolveDose {
                request: command.request,
                result: Err(DeliveryError::Uncertain(failure).into()),
            },
            Action::EnqueueInternal {
                event: Event::ForceRead,
            },
        ]
    }
}

/// Why a command failed with certainty.
///
/// A link failure on the very first attempt means nothing happened at all and
/// is reported as a plain link error; everything else is a delivery failure.
#[derive(Debug)]
enum FailureCause {
    Link(LinkError),
    Delivery(DeliveryFailure),
}

impl FailureCause {
    fn into_delivery(self) -> DeliveryFailure {
        match self {
            FailureCause::Link(e) => DeliveryFailure::Link(e),
            FailureCause::Delivery(failure) => failure,
        }
    }

    fn into_dose_error(self) -> DoseError {
        match self {
            FailureCause::Link(e) => DoseError::Link(e),
            FailureCause::Delivery(failure) => DeliveryError::Certain(failure).into(),
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Link(e) => e.fmt(f),
            FailureCause::Delivery(failure) => failure.fmt(f),
        }
    }
}

impl From<LinkError> for FailureCause {
    fn from(e: LinkError) -> Self {
        FailureCause::Link(e)
    }
}

impl From<DeliveryFailure> for FailureCause {
    fn from(failure: DeliveryFailure) -> Self {
        FailureCause::Delivery(failure)
    }
}

fn validate(kind: &DoseKind) -> Result<(), &'static str> {
    match *kind {
        DoseKind::Bolus { units } if !units.is_finite() || units <= 0.0 => {
            Err("bolus amount must be positive")
        }
        DoseKind::TempBasal { rate_per_hour, .. }
            if !rate_per_hour.is_finite() || rate_per_hour < 0.0 =>
        {
            Err("basal rate must not be negative")
        }
        DoseKind::TempBasal { duration, .. } if duration.is_zero() => {
            Err("temp basal duration must be positive")
        }
        _ => Ok(()),
    }
}
