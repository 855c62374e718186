//! Pump observations: snapshots, reservoir samples, battery and history.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Battery data as reported by the pump.
///
/// Two sources may be present. Manufacturer status data carries a charge
/// fraction directly; otherwise the fraction is derived from the voltage
/// through a chemistry curve. Each source carries the time it was measured
/// so the freshest one can win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    /// Charge fraction in `0.0..=1.0` from manufacturer status data, and when it was measured.
    pub charge: Option<(f64, Duration)>,
    /// Battery voltage in volts, and when it was measured.
    pub voltage: Option<(f64, Duration)>,
}

/// Sensor glucose reported through the pump.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseReading {
    pub mg_dl: f64,
    /// Pump-clock time of the reading.
    pub timestamp: Duration,
}

/// Immutable record of pump state produced by one session.
///
/// Snapshots are never mutated; consumers always read the latest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpSnapshot {
    /// The pump's own clock reading at the time of the read.
    pub clock: Duration,
    /// Insulin units remaining in the reservoir.
    pub reservoir_units: f64,
    pub battery: BatteryReading,
    pub suspended: bool,
    pub bolusing: bool,
    /// Pump-attached sensor glucose, when the pump reports one.
    pub glucose: Option<GlucoseReading>,
}

/// One reservoir observation. The sequence is append-only and
/// non-decreasing in timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReservoirSample {
    pub units: f64,
    pub timestamp: Duration,
    /// Estimated minutes until the reservoir runs dry at the recent delivery rate.
    pub minutes_to_empty: Option<f64>,
}

/// What the persistence collaborator returns after storing a reservoir sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReservoirUpdate {
    pub new: ReservoirSample,
    pub previous: Option<ReservoirSample>,
    /// Whether the stored sequence has no gap between `previous` and `new`.
    pub is_continuous: bool,
}

/// An entry from the pump's own event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpEvent {
    /// Pump-clock time of the event.
    pub timestamp: Duration,
    pub kind: PumpEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PumpEventKind {
    Bolus { units: f64 },
    TempBasal { rate_per_hour: f64, duration: Duration },
    Rewind,
    Suspend,
    Resume,
}

impl PumpEventKind {
    /// Whether the event records insulin delivery.
    pub fn is_dose(&self) -> bool {
        matches!(self, PumpEventKind::Bolus { .. } | PumpEventKind::TempBasal { .. })
    }
}
