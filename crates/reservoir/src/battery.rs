//! Battery charge estimation.

use pumplink_types::BatteryReading;
use serde::{Deserialize, Serialize};

/// Cell chemistry, which selects the voltage curve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryChemistry {
    #[default]
    Alkaline,
    Lithium,
}

impl BatteryChemistry {
    /// Voltage at 0% and 100% charge.
    fn voltage_range(&self) -> (f64, f64) {
        match self {
            BatteryChemistry::Alkaline => (1.18, 1.47),
            BatteryChemistry::Lithium => (1.32, 1.58),
        }
    }

    /// Linear charge fraction for a voltage, clamped to `0.0..=1.0`.
    pub fn fraction_from_voltage(&self, volts: f64) -> f64 {
        let (empty, full) = self.voltage_range();
        ((volts - empty) / (full - empty)).clamp(0.0, 1.0)
    }

    /// Charge fraction from whichever source in `reading` is freshest.
    ///
    /// Manufacturer charge data wins ties.
    pub fn fraction(&self, reading: &BatteryReading) -> Option<f64> {
        match (reading.charge, reading.voltage) {
            (Some((charge, at)), Some((_, volts_at))) if at >= volts_at => {
                Some(charge.clamp(0.0, 1.0))
            }
            (_, Some((volts, _))) => Some(self.fraction_from_voltage(volts)),
            (Some((charge, _)), None) => Some(charge.clamp(0.0, 1.0)),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_voltage_curve_is_clamped() {
        let alkaline = BatteryChemistry::Alkaline;
        assert_eq!(alkaline.fraction_from_voltage(1.0), 0.0);
        assert_eq!(alkaline.fraction_from_voltage(1.6), 1.0);
        let mid = alkaline.fraction_from_voltage(1.325);
        assert!((mid - 0.5).abs() < 1e-9);

        assert!(BatteryChemistry::Lithium.fraction_from_voltage(1.32) == 0.0);
    }

    #[test]
    fn test_freshest_source_wins() {
        let chem = BatteryChemistry::Alkaline;
        let older_charge = BatteryReading {
            charge: Some((0.9, Duration::from_secs(100))),
            voltage: Some((1.18, Duration::from_secs(200))),
        };
        assert_eq!(chem.fraction(&older_charge), Some(0.0));

        let newer_charge = BatteryReading {
            charge: Some((0.9, Duration::from_secs(300))),
            voltage: Some((1.18, Duration::from_secs(200))),
        };
        assert_eq!(chem.fraction(&newer_charge), Some(0.9));

        assert_eq!(chem.fraction(&BatteryReading::default()), None);
    }
}
