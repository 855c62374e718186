//! Event types for the deterministic state machine.

use crate::session::{SessionReport, SessionTicket};
use pumplink_types::{
    DoseKind, LinkError, LinkState, PumpSnapshot, RelayHandle, RelayId, RequestId,
    ReservoirUpdate,
};
use std::time::Duration;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// Internal events (consequences of processing an event) and session
/// completions are handled before new external inputs, so a completion is
/// always applied before a request that arrived at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events and callbacks from delegated work.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Transport events: relay inventory, heartbeats, broadcasts.
    Transport = 2,

    /// Client events: dose requests, forced reads, glucose observations.
    Client = 3,
}

/// All possible events the engine can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Time to check whether pump data is stale.
    FreshnessTimer,

    /// Time to check for prolonged link silence.
    LinkHealthTimer,

    /// Follow-up freshness check after a dose outcome.
    DeliveryRecheckTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Transport (priority: Transport)
    // ═══════════════════════════════════════════════════════════════════════
    /// The transport's relay inventory changed.
    RelaysUpdated {
        relays: Vec<RelayHandle>,
        /// Whether the transport delivers a periodic low-power wake signal.
        heartbeat_capable: bool,
    },

    /// Periodic wake signal from a relay.
    RelayHeartbeat { relay: RelayId },

    /// Unsolicited status heard by a relay in idle-listening mode.
    StatusBroadcast {
        relay: RelayId,
        snapshot: PumpSnapshot,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Client (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// Mark pump data stale unconditionally and poll.
    ForceRead,

    /// A dose recommendation from the dosing collaborator.
    DoseRequested { request: RequestId, kind: DoseKind },

    /// Glucose data was freshly observed outside the pump link.
    GlucoseObserved { timestamp: Duration },

    // ═══════════════════════════════════════════════════════════════════════
    // Callbacks (priority: Internal)
    // Results from delegated work (radio sessions, storage, power cycling)
    // ═══════════════════════════════════════════════════════════════════════
    /// A radio session finished.
    ///
    /// Callback from `Action::RunSession`.
    SessionCompleted {
        ticket: SessionTicket,
        relay: RelayId,
        /// Link state read back from the transport after the session.
        link: Option<LinkState>,
        result: Result<SessionReport, LinkError>,
    },

    /// Persistence stored a reservoir sample.
    ///
    /// Callback from `Action::StoreReservoirSample`.
    ReservoirSampleStored {
        result: Result<ReservoirUpdate, String>,
    },

    /// Radio power cycle finished.
    ///
    /// Callback from `Action::ResetRadioPower`.
    LinkResetCompleted { result: Result<(), String> },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Used by the simulation runner to order events at the same timestamp.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::SessionCompleted { .. }
            | Event::ReservoirSampleStored { .. }
            | Event::LinkResetCompleted { .. } => EventPriority::Internal,

            Event::FreshnessTimer | Event::LinkHealthTimer | Event::DeliveryRecheckTimer => {
                EventPriority::Timer
            }

            Event::RelaysUpdated { .. }
            | Event::RelayHeartbeat { .. }
            | Event::StatusBroadcast { .. } => EventPriority::Transport,

            Event::ForceRead | Event::DoseRequested { .. } | Event::GlucoseObserved { .. } => {
                EventPriority::Client
            }
        }
    }

    /// Check if this is an internal event.
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a client event.
    pub fn is_client(&self) -> bool {
        self.priority() == EventPriority::Client
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::FreshnessTimer => "FreshnessTimer",
            Event::LinkHealthTimer => "LinkHealthTimer",
            Event::DeliveryRecheckTimer => "DeliveryRecheckTimer",
            Event::RelaysUpdated { .. } => "RelaysUpdated",
            Event::RelayHeartbeat { .. } => "RelayHeartbeat",
            Event::StatusBroadcast { .. } => "StatusBroadcast",
            Event::ForceRead => "ForceRead",
            Event::DoseRequested { .. } => "DoseRequested",
            Event::GlucoseObserved { .. } => "GlucoseObserved",
            Event::SessionCompleted { .. } => "SessionCompleted",
            Event::ReservoirSampleStored { .. } => "ReservoirSampleStored",
            Event::LinkResetCompleted { .. } => "LinkResetCompleted",
        }
    }
}
