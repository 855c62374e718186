//! Radio session plans and reports.
//!
//! A session is one exclusive, serialized round of communication with the
//! pump through a relay. The state machine describes what the session must do
//! as a [`SessionPlan`]; the runner executes the plan against the transport
//! and hands back a [`SessionReport`] in `Event::SessionCompleted`.

use pumplink_types::{DoseId, DoseKind, LinkError, PumpEvent, PumpFault, PumpSnapshot};
use std::fmt;
use std::time::Duration;

/// Identifies one granted session from start to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionTicket(pub u64);

impl fmt::Display for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// What to do before sending a delivery command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Preflight {
    /// Send the command directly.
    Skip,
    /// Read pump status first, inside the same session. If the pump clock
    /// deviates from local time by more than `max_clock_skew`, stop without
    /// sending anything.
    ReadFirst { max_clock_skew: Duration },
}

/// The body of one radio session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPlan {
    /// Read current status, plus pump history when the runner supplies a cutoff.
    ReadStatus,
    /// Send one delivery command for a fixed amount.
    Deliver {
        dose: DoseId,
        kind: DoseKind,
        preflight: Preflight,
    },
    /// Set the pump clock to local time.
    SetClock,
    /// Scan for a working radio frequency.
    Tune,
}

impl SessionPlan {
    pub fn label(&self) -> &'static str {
        match self {
            SessionPlan::ReadStatus => "read_status",
            SessionPlan::Deliver { kind, .. } if kind.is_bolus() => "deliver_bolus",
            SessionPlan::Deliver { .. } => "deliver_temp_basal",
            SessionPlan::SetClock => "set_clock",
            SessionPlan::Tune => "tune",
        }
    }
}

/// Facts the runner supplies when it starts executing a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    /// Local wall time at the start of the session.
    pub local_now: Duration,
    /// Persistence cutoff for pump history queries, if any.
    pub history_since: Option<Duration>,
}

/// Outcome of a delivery plan.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The pump acknowledged the command.
    Acknowledged,
    /// The preflight read returned an untrustworthy clock; nothing was sent.
    ClockRejected { pump_clock: Duration },
    /// The preflight read itself failed; nothing was sent.
    PreflightFailed(PumpFault),
    /// The delivery command failed.
    Failed(PumpFault),
}

/// What happened inside a delivery session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub dose: DoseId,
    /// Fresh status read during preflight, if one was performed and succeeded.
    pub preflight: Option<PumpSnapshot>,
    /// Local time at which the preflight read was checked.
    pub checked_at: Duration,
    /// Number of delivery commands transmitted to the pump.
    pub commands_sent: u32,
    pub outcome: DeliveryOutcome,
}

impl DeliveryReport {
    /// A delivery session that died without reporting back. The command may
    /// have reached the pump, so it is counted as sent.
    pub fn interrupted(dose: DoseId, at: Duration, error: LinkError) -> Self {
        Self {
            dose,
            preflight: None,
            checked_at: at,
            commands_sent: 1,
            outcome: DeliveryOutcome::Failed(PumpFault::Link(error)),
        }
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionReport {
    Status {
        snapshot: PumpSnapshot,
        history: Vec<PumpEvent>,
    },
    Delivery(DeliveryReport),
    ClockSet {
        pump_clock: Duration,
    },
    Tuned {
        frequency_mhz: f64,
    },
}

impl SessionReport {
    pub fn type_name(&self) -> &'static str {
        match self {
            SessionReport::Status { .. } => "Status",
            SessionReport::Delivery(_) => "Delivery",
            SessionReport::ClockSet { .. } => "ClockSet",
            SessionReport::Tuned { .. } => "Tuned",
        }
    }
}
