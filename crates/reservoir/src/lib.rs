//! Reservoir/battery monitor.
//!
//! Turns stored reservoir samples and battery readings into domain events:
//!
//! - Empty when units remaining cross to zero from above
//! - Low at descending thresholds, edge-triggered on the downward crossing
//! - Rewound when volume jumps up by more than the rewind delta (a heuristic:
//!   a rewind and a refill look the same)
//! - Battery empty and battery replaced
//!
//! # Components
//!
//! - [`ReservoirMonitor`] - Sub-state machine holding the latest sample and battery level
//! - [`BatteryChemistry`] - Voltage to charge curves

mod battery;
mod state;

pub use battery::BatteryChemistry;
pub use state::{ReservoirConfig, ReservoirMonitor, ReservoirStats};
