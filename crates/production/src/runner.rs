//! Production runner.
//!
//! A single task owns the [`PumpNode`] and receives every input over
//! channels, so no lock guards engine state. Radio sessions run on the
//! blocking pool and come back as `SessionCompleted` callbacks.

use crate::collaborators::{LogSink, MemoryStore, NotificationSink, PersistenceStore, UploadSink};
use crate::handle::{ClientRequest, EngineHandle};
use crate::metrics;
use crate::timers::TimerManager;
use crate::wall_clock;
use pumplink_core::{
    Action, DeliveryReport, Event, PumpStatus, SessionContext, SessionPlan, SessionReport,
    SessionTicket, StateMachine,
};
use pumplink_dispatch::Transport;
use pumplink_node::{execute_plan, NodeConfig, PumpNode};
use pumplink_types::{DoseError, DoseId, DoseRecord, LinkError, RelayId, RequestId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinError;
use tracing::{debug, info, span, trace, warn, Level};

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Event channel closed")]
    ChannelClosed,
    #[error("Request dropped")]
    RequestDropped,
    #[error("Missing builder field: {0}")]
    Builder(&'static str),
    #[error(transparent)]
    Dose(#[from] DoseError),
}

/// Handle for shutting down a running [`ProductionRunner`].
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Builder for a [`ProductionRunner`].
///
/// Only the transport is required. Collaborators default to an in-memory
/// store and a sink that writes notifications and uploads to the log.
///
/// ```no_run
/// use pumplink_node::NodeConfig;
/// use pumplink_production::{LoopbackTransport, ProductionRunner};
/// use pumplink_simulation::PumpConfig;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(LoopbackTransport::new(PumpConfig::default()));
/// let mut runner = ProductionRunner::builder()
///     .transport(transport)
///     .node_config(NodeConfig::default().with_pump_id("pump-1234"))
///     .build()?;
/// let engine = runner.handle();
/// tokio::spawn(runner.run());
/// engine.force_read().await?;
/// # Ok(())
/// # }
/// ```
pub struct ProductionRunnerBuilder<T: Transport> {
    transport: Option<Arc<T>>,
    node_config: NodeConfig,
    store: Option<Arc<dyn PersistenceStore>>,
    notifications: Option<Arc<dyn NotificationSink>>,
    uploads: Option<Arc<dyn UploadSink>>,
    channel_capacity: usize,
    relay_refresh: Duration,
}

impl<T: Transport> ProductionRunnerBuilder<T> {
    pub fn new() -> Self {
        Self {
            transport: None,
            node_config: NodeConfig::default(),
            store: None,
            notifications: None,
            uploads: None,
            channel_capacity: 1024,
            relay_refresh: Duration::from_secs(60),
        }
    }

    pub fn transport(mut self, transport: Arc<T>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn node_config(mut self, config: NodeConfig) -> Self {
        self.node_config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    pub fn uploads(mut self, sink: Arc<dyn UploadSink>) -> Self {
        self.uploads = Some(sink);
        self
    }

    /// Capacity of the bounded timer, transport and client channels.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// How often the relay inventory is re-read from the transport.
    pub fn relay_refresh(mut self, interval: Duration) -> Self {
        self.relay_refresh = interval;
        self
    }

    pub fn build(self) -> Result<ProductionRunner<T>, RunnerError> {
        let transport = self.transport.ok_or(RunnerError::Builder("transport"))?;

        let (timer_tx, timer_rx) = mpsc::channel(self.channel_capacity);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::channel(self.channel_capacity);
        let (client_tx, client_rx) = mpsc::channel(self.channel_capacity);
        let (status_tx, status_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        Ok(ProductionRunner {
            timer_rx,
            callback_rx,
            callback_tx,
            transport_rx,
            transport_tx,
            client_rx,
            handle: EngineHandle::new(client_tx, status_rx),
            status_tx,
            state: PumpNode::new(self.node_config),
            transport,
            timer_manager: TimerManager::new(timer_tx),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            notifications: self.notifications.unwrap_or_else(|| Arc::new(LogSink)),
            uploads: self.uploads.unwrap_or_else(|| Arc::new(LogSink)),
            relay_refresh: self.relay_refresh,
            pending_doses: HashMap::new(),
            next_request: 1,
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl<T: Transport> Default for ProductionRunnerBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Production runner with async I/O.
pub struct ProductionRunner<T: Transport> {
    /// Timer fires. Dedicated so timers are never starved by transport traffic.
    timer_rx: mpsc::Receiver<Event>,
    /// Results of delegated work: sessions, storage, power cycles.
    /// Unbounded so blocking tasks never wait to report back.
    callback_rx: mpsc::UnboundedReceiver<Event>,
    callback_tx: mpsc::UnboundedSender<Event>,
    /// Unsolicited transport events: heartbeats and status broadcasts.
    transport_rx: mpsc::Receiver<Event>,
    transport_tx: mpsc::Sender<Event>,
    client_rx: mpsc::Receiver<ClientRequest>,
    handle: EngineHandle,
    status_tx: watch::Sender<Option<PumpStatus>>,
    /// The state machine (owned, not shared).
    state: PumpNode,
    transport: Arc<T>,
    timer_manager: TimerManager,
    store: Arc<dyn PersistenceStore>,
    notifications: Arc<dyn NotificationSink>,
    uploads: Arc<dyn UploadSink>,
    relay_refresh: Duration,
    /// Callers waiting on a dose outcome.
    pending_doses: HashMap<RequestId, oneshot::Sender<Result<DoseRecord, DoseError>>>,
    next_request: u64,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl<T: Transport> ProductionRunner<T> {
    pub fn builder() -> ProductionRunnerBuilder<T> {
        ProductionRunnerBuilder::new()
    }

    /// Client handle. Clone freely.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Sender for heartbeat and status broadcast events from the transport driver.
    pub fn transport_sender(&self) -> mpsc::Sender<Event> {
        self.transport_tx.clone()
    }

    /// Take the shutdown handle. Returns `None` after the first call.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx.take().map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    pub fn node(&self) -> &PumpNode {
        &self.state
    }

    /// Run the event loop until shutdown.
    ///
    /// Channels are polled in priority order: shutdown, timers, callbacks,
    /// transport events, client requests, then the relay refresh tick.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        info!(
            pump_id = ?self.state.config().pump_id,
            relay_refresh_secs = self.relay_refresh.as_secs(),
            "Starting production runner"
        );

        self.state.set_time(wall_clock());
        let actions = self.state.initialize();
        for action in actions {
            self.process_action(action);
        }
        self.refresh_relays();

        let mut relay_tick = tokio::time::interval(self.relay_refresh);
        relay_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; relays were just read.
        relay_tick.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received");
                    break;
                }

                Some(event) = self.timer_rx.recv() => {
                    self.handle_event(event);
                }

                Some(event) = self.callback_rx.recv() => {
                    self.handle_event(event);
                }

                Some(event) = self.transport_rx.recv() => {
                    self.handle_event(event);
                }

                Some(request) = self.client_rx.recv() => {
                    self.handle_client(request);
                }

                _ = relay_tick.tick() => {
                    self.refresh_relays();
                }
            }
        }

        self.timer_manager.cancel_all();
        if !self.pending_doses.is_empty() {
            warn!(
                pending = self.pending_doses.len(),
                "Shutting down with dose requests unresolved"
            );
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        let event_type = event.type_name();
        let event_span = span!(
            Level::DEBUG,
            "handle_event",
            event.type = %event_type,
            priority = ?event.priority(),
        );
        let _event_guard = event_span.enter();

        self.state.set_time(wall_clock());
        let actions = self.state.handle(event);
        if !actions.is_empty() {
            trace!(num_actions = actions.len(), "Event produced actions");
        }
        for action in actions {
            self.process_action(action);
        }
        metrics::set_from_node(&self.state);
    }

    fn handle_client(&mut self, request: ClientRequest) {
        let event = match request {
            ClientRequest::Dose { kind, reply } => {
                let request = RequestId(self.next_request);
                self.next_request += 1;
                self.pending_doses.insert(request, reply);
                Event::DoseRequested { request, kind }
            }
            ClientRequest::ForceRead => Event::ForceRead,
            ClientRequest::GlucoseObserved { timestamp } => Event::GlucoseObserved { timestamp },
        };
        self.handle_event(event);
    }

    /// Re-read the relay inventory. The transport answers from its own table.
    fn refresh_relays(&mut self) {
        let event = Event::RelaysUpdated {
            relays: self.transport.list_relays(),
            heartbeat_capable: self.transport.supports_heartbeat(),
        };
        self.handle_event(event);
    }

    fn process_action(&mut self, action: Action) {
        match action {
            Action::SetTimer { id, duration } => self.timer_manager.set_timer(id, duration),
            Action::CancelTimer { id } => self.timer_manager.cancel_timer(id),

            Action::EnqueueInternal { event } => self.send_callback(event),

            Action::RunSession {
                ticket,
                relay,
                label,
                plan,
            } => self.start_session(ticket, relay, label, plan),

            Action::StoreReservoirSample { sample } => {
                let result = self.store.add_reservoir_sample(sample);
                match &result {
                    Ok(update) => metrics::set_reservoir_units(update.new.units),
                    Err(error) => warn!(%error, "Reservoir sample not stored"),
                }
                self.send_callback(Event::ReservoirSampleStored { result });
            }

            Action::ResetRadioPower { off_for } => {
                let transport = Arc::clone(&self.transport);
                let callback_tx = self.callback_tx.clone();
                tokio::spawn(async move {
                    let result = power_cycle(transport, off_for).await;
                    let _ = callback_tx.send(Event::LinkResetCompleted { result });
                });
            }

            // Fire-and-forget
            Action::StoreGlucoseSample { reading } => self.store.add_glucose_sample(reading),
            Action::StoreDoseEvent { record } => self.store.add_dose_event(record),
            Action::StorePumpEvents { events } => self.store.add_pump_events(events),
            Action::Notify(notification) => self.notifications.notify(notification),
            Action::Upload(record) => self.uploads.upload(record),
            Action::PublishPumpStatus(status) => {
                self.status_tx.send_replace(Some(status));
            }
            Action::ResolveDose { request, result } => {
                metrics::record_dose_outcome(metrics::dose_outcome_label(
                    &result.as_ref().map(|_| ()),
                ));
                match self.pending_doses.remove(&request) {
                    Some(reply) => {
                        if reply.send(result).is_err() {
                            debug!(request = %request, "Dose requester went away");
                        }
                    }
                    None => warn!(request = %request, "Dose resolved with no waiting requester"),
                }
            }
        }
    }

    fn start_session(
        &self,
        ticket: SessionTicket,
        relay: RelayId,
        label: &'static str,
        plan: SessionPlan,
    ) {
        metrics::record_session_started(label);
        let history_since = match plan {
            SessionPlan::ReadStatus => self.store.last_pump_event_query_cutoff(self.state.now()),
            _ => None,
        };
        let dose = match &plan {
            SessionPlan::Deliver { dose, .. } => Some(*dose),
            _ => None,
        };
        let transport = Arc::clone(&self.transport);
        let callback_tx = self.callback_tx.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::task::spawn_blocking(move || {
                let ctx = SessionContext {
                    local_now: wall_clock(),
                    history_since,
                };
                let result = transport
                    .run_session(relay, |pump| execute_plan(&plan, pump, ctx))
                    .and_then(|report| report);
                (result, transport.link_state(relay))
            })
            .await;

            let (result, link) = match outcome {
                Ok(done) => done,
                Err(e) => (lost_session(dose, e), None),
            };
            metrics::record_session_finished(label, started.elapsed().as_secs_f64(), result.is_ok());
            let _ = callback_tx.send(Event::SessionCompleted {
                ticket,
                relay,
                link,
                result,
            });
        });
    }

    fn send_callback(&self, event: Event) {
        // The receiver lives in self, so this only fails during teardown.
        let _ = self.callback_tx.send(event);
    }
}

/// Report for a session whose blocking task panicked or was cancelled.
fn lost_session(dose: Option<DoseId>, error: JoinError) -> Result<SessionReport, LinkError> {
    let error = LinkError::Protocol(format!("session task failed: {error}"));
    warn!(?dose, %error, "Session task lost");
    match dose {
        Some(dose) => Ok(SessionReport::Delivery(DeliveryReport::interrupted(
            dose,
            wall_clock(),
            error,
        ))),
        None => Err(error),
    }
}

/// Switch the radio off, wait, and switch it back on.
async fn power_cycle<T: Transport>(transport: Arc<T>, off_for: Duration) -> Result<(), String> {
    let off = Arc::clone(&transport);
    tokio::task::spawn_blocking(move || off.set_radio_power(false))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

    tokio::time::sleep(off_for).await;

    tokio::task::spawn_blocking(move || transport.set_radio_power(true))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
}
