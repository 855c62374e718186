//! Simulated pump.

use pumplink_dispatch::PumpSession;
use pumplink_types::{
    BatteryReading, DoseKind, GlucoseReading, PumpEvent, PumpEventKind, PumpFault, PumpSnapshot,
};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub reservoir_units: f64,
    /// Pump clock minus true time, in seconds.
    pub clock_offset_secs: i64,
    pub battery_voltage: f64,
    /// Frequency a tuning scan finds.
    pub frequency_mhz: f64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            reservoir_units: 150.0,
            clock_offset_secs: 0,
            battery_voltage: 1.45,
            frequency_mhz: 916.55,
        }
    }
}

/// A fault the next delivery command will report.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedFault {
    pub fault: PumpFault,
    /// Whether the pump delivered anyway. An unacknowledged command may
    /// still have been executed.
    pub delivered: bool,
}

impl ScriptedFault {
    pub fn lost_ack() -> Self {
        Self {
            fault: PumpFault::Unacknowledged { powering_on: true },
            delivered: true,
        }
    }

    pub fn lost_command() -> Self {
        Self {
            fault: PumpFault::Unacknowledged { powering_on: true },
            delivered: false,
        }
    }
}

/// In-memory pump with a skewable clock and scripted faults.
///
/// It keeps its own event history, which is the ground truth for what was
/// actually delivered.
#[derive(Debug)]
pub struct SimulatedPump {
    config: PumpConfig,
    now: Duration,
    clock_offset_secs: i64,
    reservoir_units: f64,
    battery_voltage: f64,
    glucose: Option<GlucoseReading>,
    history: Vec<PumpEvent>,
    status_faults: VecDeque<PumpFault>,
    delivery_faults: VecDeque<ScriptedFault>,
    /// Every delivery command that reached the pump, acknowledged or not.
    commands: Vec<DoseKind>,
}

impl SimulatedPump {
    pub fn new(config: PumpConfig) -> Self {
        Self {
            now: Duration::ZERO,
            clock_offset_secs: config.clock_offset_secs,
            reservoir_units: config.reservoir_units,
            battery_voltage: config.battery_voltage,
            glucose: None,
            history: Vec::new(),
            status_faults: VecDeque::new(),
            delivery_faults: VecDeque::new(),
            commands: Vec::new(),
            config,
        }
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn clock(&self) -> Duration {
        let offset = Duration::from_secs(self.clock_offset_secs.unsigned_abs());
        if self.clock_offset_secs >= 0 {
            self.now + offset
        } else {
            self.now.saturating_sub(offset)
        }
    }

    pub fn set_clock_offset(&mut self, secs: i64) {
        self.clock_offset_secs = secs;
    }

    pub fn reservoir_units(&self) -> f64 {
        self.reservoir_units
    }

    /// Replace the reservoir, as a user would after a site change.
    pub fn refill(&mut self, units: f64) {
        self.reservoir_units = units;
        self.history.push(PumpEvent {
            timestamp: self.clock(),
            kind: PumpEventKind::Rewind,
        });
    }

    pub fn set_battery_voltage(&mut self, volts: f64) {
        self.battery_voltage = volts;
    }

    pub fn set_glucose(&mut self, mg_dl: f64) {
        self.glucose = Some(GlucoseReading {
            mg_dl,
            timestamp: self.clock(),
        });
    }

    pub fn script_status_fault(&mut self, fault: PumpFault) {
        self.status_faults.push_back(fault);
    }

    pub fn script_delivery_fault(&mut self, fault: ScriptedFault) {
        self.delivery_faults.push_back(fault);
    }

    pub fn commands(&self) -> &[DoseKind] {
        &self.commands
    }

    pub fn history(&self) -> &[PumpEvent] {
        &self.history
    }

    /// Total bolus insulin actually delivered.
    pub fn bolus_units_delivered(&self) -> f64 {
        self.history
            .iter()
            .filter_map(|e| match e.kind {
                PumpEventKind::Bolus { units } => Some(units),
                _ => None,
            })
            .sum()
    }

    fn command(&mut self, kind: DoseKind) -> Result<(), PumpFault> {
        self.commands.push(kind);
        let scripted = self.delivery_faults.pop_front();
        if scripted.as_ref().map_or(true, |s| s.delivered) {
            self.execute(kind);
        }
        match scripted {
            Some(s) => Err(s.fault),
            None => Ok(()),
        }
    }

    fn execute(&mut self, kind: DoseKind) {
        let event = match kind {
            DoseKind::Bolus { units } => {
                self.reservoir_units = (self.reservoir_units - units).max(0.0);
                PumpEventKind::Bolus { units }
            }
            DoseKind::TempBasal {
                rate_per_hour,
                duration,
            } => PumpEventKind::TempBasal {
                rate_per_hour,
                duration,
            },
        };
        self.history.push(PumpEvent {
            timestamp: self.clock(),
            kind: event,
        });
    }
}

impl PumpSession for SimulatedPump {
    fn read_status(&mut self) -> Result<PumpSnapshot, PumpFault> {
        if let Some(fault) = self.status_faults.pop_front() {
            return Err(fault);
        }
        let clock = self.clock();
        Ok(PumpSnapshot {
            clock,
            reservoir_units: self.reservoir_units,
            battery: BatteryReading {
                charge: None,
                voltage: Some((self.battery_voltage, clock)),
            },
            suspended: false,
            bolusing: false,
            glucose: self.glucose,
        })
    }

    fn read_history(&mut self, since: Duration) -> Result<Vec<PumpEvent>, PumpFault> {
        Ok(self
            .history
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect())
    }

    fn deliver_bolus(&mut self, units: f64) -> Result<(), PumpFault> {
        self.command(DoseKind::Bolus { units })
    }

    fn set_temp_basal(&mut self, rate_per_hour: f64, duration: Duration) -> Result<(), PumpFault> {
        self.command(DoseKind::TempBasal {
            rate_per_hour,
            duration,
        })
    }

    fn set_clock(&mut self, now: Duration) -> Result<Duration, PumpFault> {
        self.clock_offset_secs = 0;
        self.now = now;
        Ok(self.clock())
    }

    fn tune(&mut self) -> Result<f64, PumpFault> {
        Ok(self.config.frequency_mhz)
    }
}
