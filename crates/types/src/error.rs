//! Closed error taxonomy.
//!
//! Classification happens where the failure is raised: the transport reports
//! a structured [`PumpFault`], never a string to be pattern-matched later.

use crate::{DoseId, RelayId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Radio link failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LinkError {
    #[error("no relay is connected")]
    NoRelay,
    #[error("{0} already has a session in flight")]
    Busy(RelayId),
    #[error("session timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors that are fatal to one operation, never to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ConfigurationError {
    #[error("no pump identity is configured")]
    MissingIdentity,
    #[error("{0} is already in delivery")]
    DeliveryInProgress(DoseId),
}

/// Observations that cannot be trusted.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DataIntegrityError {
    #[error("reservoir volume rose by {increase:.2}U between readings")]
    NonMonotonicReservoir { increase: f64 },
    #[error("reservoir reading is stale (age {age:?})")]
    StaleReservoir {
        /// `None` when there is no reading at all.
        age: Option<Duration>,
    },
    #[error("pump clock is off by {skew:?}")]
    UntrustworthyClock { skew: Duration },
}

/// Failure reported by the pump session, classified by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PumpFault {
    /// The pump reports that a delivery is already active.
    #[error("pump reports a conflicting delivery in progress")]
    ConflictingDelivery,
    /// No response, or a response that could not be understood.
    #[error("command unacknowledged (powering on: {powering_on})")]
    Unacknowledged { powering_on: bool },
    /// The pump refused the command, or it was never transmitted.
    #[error("command refused: {0}")]
    Refused(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl PumpFault {
    /// Whether the command may have reached the pump and can be retried.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, PumpFault::Unacknowledged { powering_on: true })
    }
}

/// Cause attached to a [`DeliveryError`].
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DeliveryFailure {
    #[error(transparent)]
    Pump(PumpFault),
    #[error(transparent)]
    Link(LinkError),
    #[error(transparent)]
    DataIntegrity(DataIntegrityError),
    #[error("gave up after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: PumpFault },
}

/// Failed dose delivery.
///
/// `Certain` failures are surfaced at once and never retried. `Uncertain`
/// failures have exhausted their retries and must be reconciled against
/// pump history.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DeliveryError {
    #[error("delivery failed: {0}")]
    Certain(DeliveryFailure),
    #[error("delivery outcome unknown: {0}")]
    Uncertain(DeliveryFailure),
}

impl DeliveryError {
    pub fn is_certain(&self) -> bool {
        matches!(self, DeliveryError::Certain(_))
    }
}

/// Anything a dose request can resolve to besides a confirmed record.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DoseError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    DataIntegrity(#[from] DataIntegrityError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}
