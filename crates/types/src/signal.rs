//! Signals emitted toward collaborators.

use crate::{DoseKind, DoseRecord, PumpSnapshot};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Facts derived by the reservoir/battery monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    /// Reservoir crossed to zero from a positive volume.
    ReservoirEmpty,
    /// Reservoir crossed downward through a low threshold.
    ReservoirLow { threshold: u32, units: f64 },
    /// Volume rose by more than the rewind delta. A rewind and a refill look
    /// identical, so this is a heuristic signal only.
    ReservoirRewound { previous: f64, current: f64 },
    /// Battery charge reached zero.
    BatteryEmpty,
    /// Battery charge jumped up enough to indicate a new battery.
    BatteryReplaced { previous: f64, current: f64 },
}

/// Fire-and-forget user notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    LowReservoir { units: f64, threshold: u32 },
    EmptyReservoir,
    LowBattery,
    /// A failed dose, with what was attempted and when, so a human can intervene.
    DeliveryFailed {
        kind: DoseKind,
        attempted_at: Duration,
        reason: String,
    },
}

/// Fire-and-forget records for the remote upload collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UploadRecord {
    DeviceStatus {
        at: Duration,
        snapshot: Option<PumpSnapshot>,
        battery_fraction: Option<f64>,
        error: Option<String>,
    },
    Treatment(DoseRecord),
    /// Site change or battery change inferred by the monitor, for the care log.
    DeviceEvent { at: Duration, event: DomainEvent },
}
