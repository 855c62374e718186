//! Dose commands and their classification lifecycle.

use crate::{DoseId, RequestId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What a dose command asks the pump to do. The amount never changes
/// across retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DoseKind {
    /// One-time dose.
    Bolus { units: f64 },
    /// Time-bounded override of the background delivery rate.
    TempBasal { rate_per_hour: f64, duration: Duration },
}

impl DoseKind {
    pub fn is_bolus(&self) -> bool {
        matches!(self, DoseKind::Bolus { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            DoseKind::Bolus { .. } => "bolus",
            DoseKind::TempBasal { .. } => "temp_basal",
        }
    }
}

impl fmt::Display for DoseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoseKind::Bolus { units } => write!(f, "bolus {units:.2}U"),
            DoseKind::TempBasal {
                rate_per_hour,
                duration,
            } => write!(
                f,
                "temp basal {rate_per_hour:.2}U/h for {}m",
                duration.as_secs() / 60
            ),
        }
    }
}

/// Classification of a dose command's most recent outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DoseClassification {
    /// Not yet sent.
    Unstarted,
    /// The pump definitely did not act on the command.
    CertainFailure,
    /// The command may or may not have reached the pump.
    UncertainFailure,
    /// The pump acted on the command.
    Confirmed,
}

impl DoseClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoseClassification::Unstarted => "unstarted",
            DoseClassification::CertainFailure => "certain_failure",
            DoseClassification::UncertainFailure => "uncertain_failure",
            DoseClassification::Confirmed => "confirmed",
        }
    }
}

/// Illegal transition on a [`DoseCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{0} is already confirmed")]
    AlreadyConfirmed(DoseId),
    #[error("{0} already failed with certainty")]
    AlreadyFailed(DoseId),
}

/// One logical dose request, owned by the delivery state machine.
///
/// Once `Confirmed`, the command never changes classification again and no
/// further attempt may begin.
#[derive(Debug, Clone, PartialEq)]
pub struct DoseCommand {
    pub id: DoseId,
    pub request: RequestId,
    pub kind: DoseKind,
    pub requested_at: Duration,
    attempt: u32,
    classification: DoseClassification,
    ambiguous: bool,
}

impl DoseCommand {
    pub fn new(id: DoseId, request: RequestId, kind: DoseKind, requested_at: Duration) -> Self {
        Self {
            id,
            request,
            kind,
            requested_at,
            attempt: 0,
            classification: DoseClassification::Unstarted,
            ambiguous: false,
        }
    }

    /// Number of attempts begun so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn classification(&self) -> DoseClassification {
        self.classification
    }

    /// Whether confirmation was inferred from a conflicting-delivery report
    /// rather than an acknowledgement.
    pub fn is_ambiguous(&self) -> bool {
        self.ambiguous
    }

    /// Terminal commands are confirmed or failed with certainty.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.classification,
            DoseClassification::Confirmed | DoseClassification::CertainFailure
        )
    }

    /// Start another attempt, returning its 1-based number.
    pub fn begin_attempt(&mut self) -> Result<u32, TransitionError> {
        self.ensure_open()?;
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// Record the pump acting on the command. Allowed at most once.
    pub fn confirm(&mut self, ambiguous: bool) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.classification = DoseClassification::Confirmed;
        self.ambiguous = ambiguous;
        Ok(())
    }

    /// Record a failed attempt.
    pub fn fail(&mut self, certain: bool) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.classification = if certain {
            DoseClassification::CertainFailure
        } else {
            DoseClassification::UncertainFailure
        };
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TransitionError> {
        match self.classification {
            DoseClassification::Confirmed => Err(TransitionError::AlreadyConfirmed(self.id)),
            DoseClassification::CertainFailure => Err(TransitionError::AlreadyFailed(self.id)),
            _ => Ok(()),
        }
    }
}

/// A confirmed dose, handed back to the requester and to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseRecord {
    pub id: DoseId,
    pub kind: DoseKind,
    pub requested_at: Duration,
    pub confirmed_at: Duration,
    pub attempts: u32,
    /// Confirmation was inferred, not acknowledged. Flagged for audit.
    pub ambiguous: bool,
}
