//! Node state machine.

use crate::NodeConfig;
use pumplink_clock::ClockSync;
use pumplink_core::{
    Action, Event, PumpStatus, SessionPlan, SessionReport, SessionTicket, StateMachine,
    SubStateMachine, TimerId,
};
use pumplink_delivery::{DeliveryContext, DeliveryMachine};
use pumplink_dispatch::Dispatcher;
use pumplink_freshness::FreshnessTracker;
use pumplink_recovery::LinkRecovery;
use pumplink_reservoir::ReservoirMonitor;
use pumplink_types::{
    ConfigurationError, DataIntegrityError, DoseKind, LinkError, LinkState, PumpEvent,
    PumpSnapshot, RelayId, RequestId, UploadRecord,
};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Combined pump link state machine.
///
/// Composes dispatch, clock sync, reservoir monitoring, freshness, delivery
/// and link recovery into a single state machine. Siblings are passed to each
/// other explicitly per call; no component holds a reference to another.
///
/// Every pump-reported timestamp passes the clock check here before the
/// observation it belongs to is stored.
pub struct PumpNode {
    config: NodeConfig,

    dispatcher: Dispatcher,
    clock: ClockSync,
    reservoir: ReservoirMonitor,
    freshness: FreshnessTracker,
    delivery: DeliveryMachine,
    recovery: LinkRecovery,

    /// Ticket of the clock-set session in flight, if any.
    correction: Option<SessionTicket>,

    /// Latest trusted snapshot.
    snapshot: Option<PumpSnapshot>,

    now: Duration,
}

impl std::fmt::Debug for PumpNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpNode")
            .field("pump_id", &self.config.pump_id)
            .field("in_flight", &self.dispatcher.in_flight_count())
            .field("pending_doses", &self.delivery.pending_count())
            .field("polling", &self.freshness.is_polling())
            .field("now", &self.now)
            .finish()
    }
}

impl PumpNode {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            dispatcher: Dispatcher::with_config(config.dispatch.clone()),
            clock: ClockSync::with_config(config.clock.clone()),
            reservoir: ReservoirMonitor::with_config(config.reservoir.clone()),
            freshness: FreshnessTracker::with_config(config.freshness.clone()),
            delivery: DeliveryMachine::with_config(config.delivery.clone()),
            recovery: LinkRecovery::with_config(config.recovery.clone()),
            correction: None,
            snapshot: None,
            now: Duration::ZERO,
            config,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn reservoir(&self) -> &ReservoirMonitor {
        &self.reservoir
    }

    pub fn freshness(&self) -> &FreshnessTracker {
        &self.freshness
    }

    pub fn delivery(&self) -> &DeliveryMachine {
        &self.delivery
    }

    pub fn recovery(&self) -> &LinkRecovery {
        &self.recovery
    }

    /// Latest snapshot whose clock passed the check.
    pub fn snapshot(&self) -> Option<&PumpSnapshot> {
        self.snapshot.as_ref()
    }

    /// Arm the periodic timers.
    pub fn initialize(&mut self) -> Vec<Action> {
        vec![
            Action::SetTimer {
                id: TimerId::FreshnessCheck,
                duration: self.config.freshness_interval,
            },
            Action::SetTimer {
                id: TimerId::LinkHealth,
                duration: self.recovery.config().check_interval,
            },
        ]
    }

    fn on_freshness_timer(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::FreshnessCheck,
            duration: self.config.freshness_interval,
        }];
        if self.freshness.is_pump_data_stale() {
            actions.extend(self.poll());
        }
        actions
    }

    fn poll(&mut self) -> Vec<Action> {
        if self.config.pump_id.is_none() {
            let error = ConfigurationError::MissingIdentity;
            warn!(%error, "Poll skipped");
            return vec![Action::PublishPumpStatus(PumpStatus::Unavailable {
                error: error.to_string(),
                at: self.now,
            })];
        }
        self.freshness.trigger_poll(&mut self.dispatcher)
    }

    fn on_dose_requested(&mut self, request: RequestId, kind: DoseKind) -> Vec<Action> {
        if self.config.pump_id.is_none() {
            warn!(request = %request, "Dose rejected: no pump identity configured");
            return vec![Action::ResolveDose {
                request,
                result: Err(ConfigurationError::MissingIdentity.into()),
            }];
        }
        self.delivery.request(
            request,
            kind,
            DeliveryContext {
                dispatcher: &mut self.dispatcher,
                freshness: &self.freshness,
                reservoir: &self.reservoir,
                clock: &self.clock,
            },
        )
    }

    fn on_session_completed(
        &mut self,
        ticket: SessionTicket,
        relay: RelayId,
        link: Option<LinkState>,
        result: Result<SessionReport, LinkError>,
    ) -> Vec<Action> {
        let Some(session) = self.dispatcher.complete(ticket, link, result.is_ok()) else {
            trace!(ticket = %ticket, relay = %relay, "Completion for unknown session");
            return vec![];
        };
        debug!(
            ticket = %ticket,
            relay = %relay,
            label = session.label,
            ok = result.is_ok(),
            "Session completed"
        );

        if self.freshness.owns_poll(ticket) {
            return match result {
                Ok(SessionReport::Status { snapshot, history }) => {
                    self.freshness.on_poll_succeeded(ticket);
                    self.process_snapshot(snapshot, history)
                }
                Ok(other) => self.freshness.on_poll_failed(
                    ticket,
                    format!("unexpected {} report", other.type_name()),
                    &mut self.dispatcher,
                ),
                Err(e) => {
                    self.freshness
                        .on_poll_failed(ticket, e.to_string(), &mut self.dispatcher)
                }
            };
        }

        if self.delivery.owns(ticket) {
            let mut actions = Vec::new();
            let result = match result {
                Ok(SessionReport::Delivery(mut report)) => {
                    if let Some(snapshot) = report.preflight.take() {
                        actions.extend(self.process_snapshot(snapshot, vec![]));
                    }
                    Ok(report)
                }
                Ok(other) => Err(LinkError::Protocol(format!(
                    "unexpected {} report",
                    other.type_name()
                ))),
                Err(e) => Err(e),
            };
            actions.extend(self.delivery.on_session_completed(
                ticket,
                result,
                DeliveryContext {
                    dispatcher: &mut self.dispatcher,
                    freshness: &self.freshness,
                    reservoir: &self.reservoir,
                    clock: &self.clock,
                },
            ));
            return actions;
        }

        if self.correction == Some(ticket) {
            self.correction = None;
            let result = match result {
                Ok(SessionReport::ClockSet { pump_clock }) => Ok(pump_clock),
                Ok(other) => Err(format!("unexpected {} report", other.type_name())),
                Err(e) => Err(e.to_string()),
            };
            self.clock.on_correction_finished(result);
            return vec![];
        }

        if self.freshness.owns_tuning(ticket) {
            let result = match result {
                Ok(SessionReport::Tuned { frequency_mhz }) => Ok(frequency_mhz),
                Ok(other) => Err(format!("unexpected {} report", other.type_name())),
                Err(e) => Err(e.to_string()),
            };
            self.freshness
                .on_tuning_completed(ticket, result, &mut self.dispatcher);
            return vec![];
        }

        warn!(ticket = %ticket, label = session.label, "Session had no owner");
        vec![]
    }

    /// Apply a snapshot from a poll, a delivery preflight or a broadcast.
    fn process_snapshot(&mut self, snapshot: PumpSnapshot, history: Vec<PumpEvent>) -> Vec<Action> {
        if !self.clock.assert_clock(snapshot.clock) {
            let error = DataIntegrityError::UntrustworthyClock {
                skew: self.clock.last_skew().unwrap_or_default(),
            }
            .to_string();
            let mut actions = vec![
                Action::Upload(UploadRecord::DeviceStatus {
                    at: self.now,
                    snapshot: None,
                    battery_fraction: self.reservoir.battery_fraction(),
                    error: Some(error.clone()),
                }),
                Action::PublishPumpStatus(PumpStatus::Unavailable {
                    error,
                    at: self.now,
                }),
            ];
            actions.extend(self.start_clock_correction());
            return actions;
        }

        let mut actions = vec![Action::StoreReservoirSample {
            sample: self
                .reservoir
                .sample_at(snapshot.reservoir_units, snapshot.clock),
        }];

        // The pump clock was just verified, so its readings are in local time.
        // Anything dated past the skew allowance is still not trusted.
        let horizon = self.now + self.clock.max_skew();

        match snapshot.glucose {
            Some(reading) if reading.timestamp <= horizon => {
                self.recovery.record_glucose(reading.timestamp);
                actions.push(Action::StoreGlucoseSample { reading });
            }
            Some(reading) => {
                warn!(timestamp = ?reading.timestamp, "Dropping future-dated glucose reading");
            }
            None => {}
        }

        actions.extend(self.reservoir.on_battery(&snapshot.battery));

        let doses: Vec<_> = history
            .into_iter()
            .filter(|e| e.kind.is_dose() && e.timestamp <= horizon)
            .collect();
        if !doses.is_empty() {
            debug!(count = doses.len(), "Forwarding pump dose history");
            actions.push(Action::StorePumpEvents { events: doses });
        }

        self.freshness.record_pump_data();
        self.recovery.record_pump_data(self.now);

        actions.push(Action::Upload(UploadRecord::DeviceStatus {
            at: self.now,
            snapshot: Some(snapshot.clone()),
            battery_fraction: self.reservoir.battery_fraction(),
            error: None,
        }));
        actions.push(Action::PublishPumpStatus(PumpStatus::Fresh {
            snapshot: snapshot.clone(),
            at: self.now,
        }));
        self.snapshot = Some(snapshot);
        actions
    }

    fn start_clock_correction(&mut self) -> Vec<Action> {
        if !self.clock.take_correction() {
            return vec![];
        }
        let plan = SessionPlan::SetClock;
        match self.dispatcher.begin(plan.label(), None) {
            Ok(lease) => {
                self.correction = Some(lease.ticket);
                vec![Action::RunSession {
                    ticket: lease.ticket,
                    relay: lease.relay,
                    label: lease.label,
                    plan,
                }]
            }
            Err(e) => {
                self.clock.on_correction_finished(Err(e.to_string()));
                vec![]
            }
        }
    }
}

impl StateMachine for PumpNode {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            // ═══════════════════════════════════════════════════════════════════════
            // Timers
            // ═══════════════════════════════════════════════════════════════════════
            Event::FreshnessTimer => self.on_freshness_timer(),

            Event::DeliveryRecheckTimer => {
                self.freshness.force_read();
                self.poll()
            }

            Event::LinkHealthTimer
            | Event::GlucoseObserved { .. }
            | Event::LinkResetCompleted { .. } => {
                self.recovery.try_handle(&event).unwrap_or_default()
            }

            // ═══════════════════════════════════════════════════════════════════════
            // Transport
            // ═══════════════════════════════════════════════════════════════════════
            Event::RelaysUpdated {
                relays,
                heartbeat_capable,
            } => {
                self.dispatcher.update_relays(&relays);
                self.freshness.set_heartbeat_capable(heartbeat_capable);
                vec![]
            }

            Event::RelayHeartbeat { relay } => {
                if !self.freshness.is_pump_data_stale() {
                    trace!(relay = %relay, "Heartbeat: data fresh");
                    return vec![];
                }
                self.poll()
            }

            Event::StatusBroadcast { relay, snapshot } => {
                trace!(relay = %relay, "Status broadcast received");
                self.process_snapshot(snapshot, vec![])
            }

            // ═══════════════════════════════════════════════════════════════════════
            // Client
            // ═══════════════════════════════════════════════════════════════════════
            Event::ForceRead => {
                self.freshness.force_read();
                self.poll()
            }

            Event::DoseRequested { request, kind } => self.on_dose_requested(request, kind),

            // ═══════════════════════════════════════════════════════════════════════
            // Callbacks
            // ═══════════════════════════════════════════════════════════════════════
            Event::SessionCompleted {
                ticket,
                relay,
                link,
                result,
            } => self.on_session_completed(ticket, relay, link, result),

            Event::ReservoirSampleStored { ref result } => {
                if let Ok(update) = result {
                    self.freshness.record_reservoir(update.new.timestamp);
                }
                self.reservoir.try_handle(&event).unwrap_or_default()
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.dispatcher.set_time(now);
        self.clock.set_time(now);
        SubStateMachine::set_time(&mut self.reservoir, now);
        self.freshness.set_time(now);
        self.delivery.set_time(now);
        SubStateMachine::set_time(&mut self.recovery, now);
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumplink_core::{DeliveryOutcome, DeliveryReport, Preflight};
    use pumplink_types::{
        BatteryReading, DoseError, GlucoseReading, PumpEventKind, RelayHandle, ReservoirUpdate,
    };
    use tracing_test::traced_test;

    const START: Duration = Duration::from_secs(1_700_000_000);
    const MINUTE: Duration = Duration::from_secs(60);

    fn node() -> PumpNode {
        let mut node = PumpNode::new(NodeConfig::default().with_pump_id("pump-1"));
        node.set_time(START);
        node.handle(Event::RelaysUpdated {
            relays: vec![RelayHandle::connected(RelayId(1), "relay-1")],
            heartbeat_capable: false,
        });
        node
    }

    fn snapshot(clock: Duration, units: f64) -> PumpSnapshot {
        PumpSnapshot {
            clock,
            reservoir_units: units,
            battery: BatteryReading::default(),
            suspended: false,
            bolusing: false,
            glucose: None,
        }
    }

    fn session(actions: &[Action]) -> Option<(SessionTicket, SessionPlan)> {
        actions.iter().find_map(|a| match a {
            Action::RunSession { ticket, plan, .. } => Some((*ticket, plan.clone())),
            _ => None,
        })
    }

    fn complete(ticket: SessionTicket, result: Result<SessionReport, LinkError>) -> Event {
        Event::SessionCompleted {
            ticket,
            relay: RelayId(1),
            link: None,
            result,
        }
    }

    #[test]
    fn test_initialize_arms_timers() {
        let mut node = node();
        let actions = node.initialize();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::FreshnessCheck,
                ..
            }
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::LinkHealth,
                ..
            }
        )));
    }

    #[test]
    fn test_poll_stores_trusted_snapshot() {
        let mut node = node();
        let actions = node.handle(Event::FreshnessTimer);
        let (ticket, plan) = session(&actions).expect("poll");
        assert_eq!(plan, SessionPlan::ReadStatus);

        let mut snap = snapshot(START + Duration::from_secs(5), 80.0);
        snap.glucose = Some(GlucoseReading {
            mg_dl: 110.0,
            timestamp: START - MINUTE,
        });
        let history = vec![
            PumpEvent {
                timestamp: START - 10 * MINUTE,
                kind: PumpEventKind::Bolus { units: 1.5 },
            },
            PumpEvent {
                timestamp: START - 9 * MINUTE,
                kind: PumpEventKind::Rewind,
            },
        ];
        let actions = node.handle(complete(
            ticket,
            Ok(SessionReport::Status {
                snapshot: snap,
                history,
            }),
        ));

        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StoreReservoirSample { sample } if sample.units == 80.0)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StoreGlucoseSample { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StorePumpEvents { events } if events.len() == 1)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::PublishPumpStatus(PumpStatus::Fresh { .. }))));
        assert!(!node.freshness().is_polling());
        assert!(!node.freshness().is_pump_data_stale());
        assert_eq!(node.recovery().record().last_glucose, Some(START - MINUTE));
    }

    #[traced_test]
    #[test]
    fn test_future_dated_glucose_is_dropped() {
        let mut node = node();
        let (ticket, _) = session(&node.handle(Event::ForceRead)).expect("poll");

        let mut snap = snapshot(START, 80.0);
        snap.glucose = Some(GlucoseReading {
            mg_dl: 110.0,
            timestamp: START + 10 * MINUTE,
        });
        let actions = node.handle(complete(
            ticket,
            Ok(SessionReport::Status {
                snapshot: snap,
                history: vec![],
            }),
        ));

        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::StoreGlucoseSample { .. })));
        // The rest of the snapshot is still trusted.
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::PublishPumpStatus(PumpStatus::Fresh { .. }))));
        assert_eq!(node.recovery().record().last_glucose, None);
        assert!(logs_contain("Dropping future-dated glucose reading"));
    }

    #[traced_test]
    #[test]
    fn test_untrusted_clock_discards_snapshot_and_corrects() {
        let mut node = node();
        let (ticket, _) = session(&node.handle(Event::ForceRead)).expect("poll");

        let actions = node.handle(complete(
            ticket,
            Ok(SessionReport::Status {
                snapshot: snapshot(START + 10 * MINUTE, 80.0),
                history: vec![],
            }),
        ));

        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::StoreReservoirSample { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::PublishPumpStatus(PumpStatus::Unavailable { .. }))));
        let (correction, plan) = session(&actions).expect("clock correction");
        assert_eq!(plan, SessionPlan::SetClock);
        assert!(node.snapshot().is_none());
        assert!(logs_contain("Session completed"));

        node.handle(complete(
            correction,
            Ok(SessionReport::ClockSet { pump_clock: START }),
        ));
        assert!(!node.clock().is_correcting());
    }

    #[test]
    fn test_missing_identity_fails_operations() {
        let mut node = PumpNode::new(NodeConfig::default());
        node.set_time(START);
        node.handle(Event::RelaysUpdated {
            relays: vec![RelayHandle::connected(RelayId(1), "relay-1")],
            heartbeat_capable: false,
        });

        let actions = node.handle(Event::ForceRead);
        assert!(session(&actions).is_none());
        assert!(matches!(
            actions.as_slice(),
            [Action::PublishPumpStatus(PumpStatus::Unavailable { .. })]
        ));

        let actions = node.handle(Event::DoseRequested {
            request: RequestId(1),
            kind: DoseKind::Bolus { units: 1.0 },
        });
        assert!(matches!(
            actions.as_slice(),
            [Action::ResolveDose {
                result: Err(DoseError::Configuration(ConfigurationError::MissingIdentity)),
                ..
            }]
        ));
    }

    #[test]
    fn test_heartbeat_polls_only_when_stale() {
        let mut node = node();
        node.handle(Event::StatusBroadcast {
            relay: RelayId(1),
            snapshot: snapshot(START, 80.0),
        });
        assert!(node
            .handle(Event::RelayHeartbeat { relay: RelayId(1) })
            .is_empty());

        node.set_time(START + 5 * MINUTE);
        let actions = node.handle(Event::RelayHeartbeat { relay: RelayId(1) });
        assert!(session(&actions).is_some());
    }

    #[test]
    fn test_preflight_snapshot_feeds_monitor() {
        let mut node = node();
        let actions = node.handle(Event::DoseRequested {
            request: RequestId(7),
            kind: DoseKind::Bolus { units: 2.0 },
        });
        let (ticket, plan) = session(&actions).expect("delivery");
        let SessionPlan::Deliver {
            dose, preflight, ..
        } = plan
        else {
            panic!("expected delivery plan");
        };
        assert!(matches!(preflight, Preflight::ReadFirst { .. }));

        let report = DeliveryReport {
            dose,
            preflight: Some(snapshot(START, 60.0)),
            checked_at: START,
            commands_sent: 1,
            outcome: DeliveryOutcome::Acknowledged,
        };
        let actions = node.handle(complete(ticket, Ok(SessionReport::Delivery(report))));

        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StoreReservoirSample { sample } if sample.units == 60.0)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ResolveDose { result: Ok(_), .. })));
    }

    #[test]
    fn test_stored_sample_updates_reservoir_recency() {
        let mut node = node();
        let sample = node.reservoir().sample_at(40.0, START - MINUTE);
        node.handle(Event::ReservoirSampleStored {
            result: Ok(ReservoirUpdate {
                new: sample,
                previous: None,
                is_continuous: false,
            }),
        });
        assert_eq!(node.freshness().reservoir_age(), Some(MINUTE));
        assert_eq!(node.reservoir().latest().map(|s| s.units), Some(40.0));
    }
}
