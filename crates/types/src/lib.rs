//! Core types for the pump link engine.
//!
//! This crate provides the foundational types used throughout the device
//! communication and dose-delivery coordination engine:
//!
//! - **Identifiers**: RelayId, DoseId, RequestId
//! - **Relays**: RelayHandle and its per-relay LinkState
//! - **Pump data**: PumpSnapshot, ReservoirSample, BatteryReading, pump history
//! - **Dosing**: DoseKind, DoseCommand and its classification lifecycle
//! - **Signals**: DomainEvent, Notification, UploadRecord
//! - **Errors**: the closed error taxonomy (link, configuration, data integrity, delivery)
//!
//! # Time
//!
//! All timestamps are `Duration`s since the UNIX epoch. Local time is supplied
//! to the state machines by the runner; pump-reported times use the same
//! representation so they can be compared directly.
//!
//! This crate does not depend on any other workspace crates.

mod dose;
mod error;
mod identifiers;
mod pump;
mod relay;
mod signal;

pub use dose::{DoseClassification, DoseCommand, DoseKind, DoseRecord, TransitionError};
pub use error::{
    ConfigurationError, DataIntegrityError, DeliveryError, DeliveryFailure, DoseError, LinkError,
    PumpFault,
};
pub use identifiers::{DoseId, RelayId, RequestId};
pub use pump::{
    BatteryReading, GlucoseReading, PumpEvent, PumpEventKind, PumpSnapshot, ReservoirSample,
    ReservoirUpdate,
};
pub use relay::{LinkState, RelayHandle};
pub use signal::{DomainEvent, Notification, UploadRecord};

/// Absolute difference between two timestamps.
pub fn time_distance(a: std::time::Duration, b: std::time::Duration) -> std::time::Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn time_distance_is_symmetric() {
        let a = Duration::from_secs(100);
        let b = Duration::from_secs(160);
        assert_eq!(time_distance(a, b), Duration::from_secs(60));
        assert_eq!(time_distance(b, a), Duration::from_secs(60));
        assert_eq!(time_distance(a, a), Duration::ZERO);
    }
}
