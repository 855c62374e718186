//! Deterministic simulation runner.
//!
//! When the node emits `Action::RunSession`, the runner executes the plan
//! against the simulated pump inline and schedules the completion after a
//! sampled session latency.

use crate::event_queue::EventKey;
use crate::pump::{PumpConfig, SimulatedPump};
use crate::radio::{RadioConfig, SimulatedRadio};
use crate::store::SimStore;
use pumplink_core::{
    Action, Event, PumpStatus, SessionContext, SessionReport, StateMachine, TimerId,
};
use pumplink_node::{execute_plan, NodeConfig, PumpNode};
use pumplink_types::{
    DoseError, DoseKind, DoseRecord, LinkError, Notification, RelayId, RequestId, UploadRecord,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, trace};

/// Interval between relay heartbeats when the radio supports them.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub node: NodeConfig,
    pub radio: RadioConfig,
    pub pump: PumpConfig,
    /// Wall time at which the simulation starts.
    pub start: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default().with_pump_id("sim-pump"),
            radio: RadioConfig::default(),
            pump: PumpConfig::default(),
            start: Duration::from_secs(1_700_000_000),
        }
    }
}

/// Everything the node sent to its collaborators, in order.
#[derive(Debug, Default)]
pub struct SimulationLog {
    pub notifications: Vec<(Duration, Notification)>,
    pub uploads: Vec<(Duration, UploadRecord)>,
    pub statuses: Vec<(Duration, PumpStatus)>,
    pub resolutions: Vec<(RequestId, Result<DoseRecord, DoseError>)>,
    /// Label of every session started, with its start time.
    pub sessions: Vec<(Duration, &'static str)>,
    pub radio_resets: Vec<Duration>,
}

impl SimulationLog {
    /// Every result delivered for `request`.
    pub fn resolutions_for(&self, request: RequestId) -> Vec<&Result<DoseRecord, DoseError>> {
        self.resolutions
            .iter()
            .filter(|(r, _)| *r == request)
            .map(|(_, result)| result)
            .collect()
    }

    pub fn session_count(&self, label: &str) -> usize {
        self.sessions.iter().filter(|(_, l)| *l == label).count()
    }
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Sessions executed against the pump.
    pub sessions_run: u64,
    /// Sessions that timed out before reaching the pump.
    pub sessions_lost: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    node: PumpNode,
    pump: SimulatedPump,
    radio: SimulatedRadio,
    store: SimStore,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,

    /// Sequence counter for deterministic ordering.
    sequence: u64,

    /// Current simulation time.
    now: Duration,

    /// RNG for radio conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Timer registry for cancellation support.
    timers: HashMap<TimerId, EventKey>,

    next_request: u64,
    stats: SimulationStats,
    log: SimulationLog,
}

impl SimulationRunner {
    pub fn new(config: SimulationConfig, seed: u64) -> Self {
        Self {
            node: PumpNode::new(config.node),
            pump: SimulatedPump::new(config.pump),
            radio: SimulatedRadio::new(config.radio),
            store: SimStore::new(),
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: config.start,
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            next_request: 1,
            stats: SimulationStats::default(),
            log: SimulationLog::default(),
        }
    }

    pub fn node(&self) -> &PumpNode {
        &self.node
    }

    pub fn pump(&self) -> &SimulatedPump {
        &self.pump
    }

    pub fn pump_mut(&mut self) -> &mut SimulatedPump {
        &mut self.pump
    }

    pub fn radio(&self) -> &SimulatedRadio {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut SimulatedRadio {
        &mut self.radio
    }

    pub fn store(&self) -> &SimStore {
        &self.store
    }

    pub fn log(&self) -> &SimulationLog {
        &self.log
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Arm the node's timers and announce the relays.
    pub fn initialize(&mut self) {
        self.pump.set_time(self.now);
        self.node.set_time(self.now);
        for action in self.node.initialize() {
            self.process_action(action);
        }
        self.refresh_relays();
        if self.radio.config().heartbeat {
            let heartbeat = self.heartbeat();
            self.schedule_event(self.now + HEARTBEAT_INTERVAL, heartbeat);
        }
    }

    /// Tell the node about the current relay inventory.
    pub fn refresh_relays(&mut self) {
        let event = Event::RelaysUpdated {
            relays: self.radio.relay_handles(),
            heartbeat_capable: self.radio.config().heartbeat,
        };
        self.schedule_event(self.now, event);
    }

    /// Schedule an event `delay` from now.
    pub fn submit(&mut self, delay: Duration, event: Event) {
        self.schedule_event(self.now + delay, event);
    }

    /// Submit a dose recommendation `delay` from now.
    pub fn request_dose(&mut self, delay: Duration, kind: DoseKind) -> RequestId {
        let request = RequestId(self.next_request);
        self.next_request += 1;
        self.submit(delay, Event::DoseRequested { request, kind });
        request
    }

    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(self.now + duration);
    }

    /// Run simulation until no more events or time limit reached.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let Some((key, event)) = self.event_queue.pop_first() else {
                break;
            };
            self.now = key.time;
            trace!(time = ?self.now, event = event.type_name(), "Processing event");

            self.stats.events_processed += 1;
            self.stats.events_by_priority[event.priority() as usize] += 1;

            let heartbeat = matches!(event, Event::RelayHeartbeat { .. });

            self.pump.set_time(self.now);
            self.node.set_time(self.now);
            let actions = self.node.handle(event);
            self.stats.actions_generated += actions.len() as u64;
            for action in actions {
                self.process_action(action);
            }

            if heartbeat {
                let next = self.heartbeat();
                self.schedule_event(self.now + HEARTBEAT_INTERVAL, next);
            }
        }
        self.now = self.now.max(end_time);

        debug!(
            events_processed = self.stats.events_processed,
            sessions_run = self.stats.sessions_run,
            final_time = ?self.now,
            "Simulation step complete"
        );
    }

    fn process_action(&mut self, action: Action) {
        match action {
            Action::SetTimer { id, duration } => {
                let key = self.schedule_event(self.now + duration, timer_to_event(id));
                if let Some(old) = self.timers.insert(id, key) {
                    self.event_queue.remove(&old);
                }
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&id) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.schedule_event(self.now, event);
            }

            // Delegated work executes instantly; results arrive after latency.
            Action::RunSession {
                ticket,
                relay,
                label,
                plan,
            } => {
                self.log.sessions.push((self.now, label));
                let latency = self.radio.sample_latency(&mut self.rng);
                let result = if self.radio.reaches_pump(relay, self.now, &mut self.rng) {
                    self.stats.sessions_run += 1;
                    let ctx = SessionContext {
                        local_now: self.now,
                        history_since: Some(self.store.last_pump_event_query_cutoff(self.now)),
                    };
                    execute_plan(&plan, &mut self.pump, ctx)
                } else {
                    self.stats.sessions_lost += 1;
                    Err(LinkError::Timeout)
                };
                if let Ok(SessionReport::Tuned { frequency_mhz }) = &result {
                    self.radio.record_tuning(relay, self.now, *frequency_mhz);
                }
                let event = Event::SessionCompleted {
                    ticket,
                    relay,
                    link: self.radio.link_state(relay),
                    result,
                };
                self.schedule_event(self.now + latency, event);
            }

            Action::StoreReservoirSample { sample } => {
                let result = self.store.add_reservoir_sample(sample);
                self.schedule_event(self.now, Event::ReservoirSampleStored { result });
            }

            Action::ResetRadioPower { off_for } => {
                self.radio.power_cycle(self.now, off_for);
                self.log.radio_resets.push(self.now);
                self.schedule_event(
                    self.now + off_for,
                    Event::LinkResetCompleted { result: Ok(()) },
                );
            }

            // Fire-and-forget
            Action::StoreGlucoseSample { reading } => self.store.add_glucose_sample(reading),
            Action::StoreDoseEvent { record } => self.store.add_dose_event(record),
            Action::StorePumpEvents { events } => self.store.add_pump_events(events),
            Action::Notify(notification) => self.log.notifications.push((self.now, notification)),
            Action::Upload(record) => self.log.uploads.push((self.now, record)),
            Action::PublishPumpStatus(status) => self.log.statuses.push((self.now, status)),
            Action::ResolveDose { request, result } => {
                self.log.resolutions.push((request, result));
            }
        }
    }

    fn heartbeat(&self) -> Event {
        Event::RelayHeartbeat {
            relay: self
                .radio
                .relay_handles()
                .first()
                .map_or(RelayId(1), |r| r.id),
        }
    }

    fn schedule_event(&mut self, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, self.sequence);
        self.event_queue.insert(key, event);
        key
    }
}

fn timer_to_event(id: TimerId) -> Event {
    match id {
        TimerId::FreshnessCheck => Event::FreshnessTimer,
        TimerId::LinkHealth => Event::LinkHealthTimer,
        TimerId::DeliveryRecheck => Event::DeliveryRecheckTimer,
    }
}
