//! Action types for the deterministic state machine.

use crate::session::{SessionPlan, SessionTicket};
use crate::{Event, TimerId};
use pumplink_types::{
    DoseError, DoseRecord, GlucoseReading, Notification, PumpEvent, PumpSnapshot, RelayId,
    RequestId, ReservoirSample, UploadRecord,
};
use std::time::Duration;

/// Pump data handed to the dosing collaborator.
///
/// Fresh data unblocks the dosing computation; `Unavailable` is the synthetic
/// failure pushed after a poll chain is exhausted so nothing waits forever on
/// stale data.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpStatus {
    Fresh {
        snapshot: PumpSnapshot,
        at: Duration,
    },
    Unavailable {
        error: String,
        at: Duration,
    },
}

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for processing after the current one.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Run one exclusive session on a relay.
    ///
    /// The dispatcher has already granted the ticket; the runner must not
    /// start any other session on this relay until it reports back.
    /// Returns `Event::SessionCompleted` when complete.
    RunSession {
        ticket: SessionTicket,
        relay: RelayId,
        label: &'static str,
        plan: SessionPlan,
    },

    /// Store a reservoir sample.
    ///
    /// Returns `Event::ReservoirSampleStored` with the continuity facts.
    StoreReservoirSample { sample: ReservoirSample },

    /// Power the radio off, wait, and power it on again.
    ///
    /// Best effort. Returns `Event::LinkResetCompleted`.
    ResetRadioPower { off_for: Duration },

    // ═══════════════════════════════════════════════════════════════════════
    // Fire-and-forget
    // ═══════════════════════════════════════════════════════════════════════
    /// Store a clock-verified glucose reading.
    StoreGlucoseSample { reading: GlucoseReading },

    /// Store a confirmed dose.
    StoreDoseEvent { record: DoseRecord },

    /// Store clock-verified pump history entries.
    StorePumpEvents { events: Vec<PumpEvent> },

    /// Signal the notification collaborator.
    Notify(Notification),

    /// Hand a record to the upload collaborator.
    Upload(UploadRecord),

    /// Publish pump data to the dosing collaborator.
    PublishPumpStatus(PumpStatus),

    /// Resolve a dose request back to its caller. Emitted exactly once per request.
    ResolveDose {
        request: RequestId,
        result: Result<DoseRecord, DoseError>,
    },
}

impl Action {
    /// Check if this action produces a callback event.
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::RunSession { .. }
                | Action::StoreReservoirSample { .. }
                | Action::ResetRadioPower { .. }
        )
    }

    /// Check if this action is fire-and-forget toward a collaborator.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(
            self,
            Action::StoreGlucoseSample { .. }
                | Action::StoreDoseEvent { .. }
                | Action::StorePumpEvents { .. }
                | Action::Notify(_)
                | Action::Upload(_)
                | Action::PublishPumpStatus(_)
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::RunSession { .. } => "RunSession",
            Action::StoreReservoirSample { .. } => "StoreReservoirSample",
            Action::ResetRadioPower { .. } => "ResetRadioPower",
            Action::StoreGlucoseSample { .. } => "StoreGlucoseSample",
            Action::StoreDoseEvent { .. } => "StoreDoseEvent",
            Action::StorePumpEvents { .. } => "StorePumpEvents",
            Action::Notify(_) => "Notify",
            Action::Upload(_) => "Upload",
            Action::PublishPumpStatus(_) => "PublishPumpStatus",
            Action::ResolveDose { .. } => "ResolveDose",
        }
    }
}
