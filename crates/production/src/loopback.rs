//! In-process transport backed by a simulated pump.
//!
//! Lets the engine run end to end on a bench without radio hardware, and
//! gives the runner tests a transport they can script.

use crate::wall_clock;
use parking_lot::{Mutex, MutexGuard};
use pumplink_dispatch::{PumpSession, Transport};
use pumplink_simulation::{PumpConfig, SimulatedPump};
use pumplink_types::{
    LinkError, LinkState, PumpEvent, PumpFault, PumpSnapshot, RelayHandle, RelayId,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

#[derive(Debug)]
struct LinkTable {
    relays: Vec<RelayHandle>,
    radio_on: bool,
    power_cycles: u32,
    sessions: u64,
    /// Failures returned instead of opening the next sessions.
    failures: VecDeque<LinkError>,
}

pub struct LoopbackTransport {
    pump: Mutex<SimulatedPump>,
    link: Mutex<LinkTable>,
    session_delay: Duration,
    heartbeat: bool,
}

impl LoopbackTransport {
    /// One connected relay in front of a pump built from `config`.
    pub fn new(config: PumpConfig) -> Self {
        Self {
            pump: Mutex::new(SimulatedPump::new(config)),
            link: Mutex::new(LinkTable {
                relays: vec![RelayHandle::connected(RelayId(1), "loopback")],
                radio_on: true,
                power_cycles: 0,
                sessions: 0,
                failures: VecDeque::new(),
            }),
            session_delay: Duration::ZERO,
            heartbeat: false,
        }
    }

    /// Hold every session open this long, as a real radio exchange would.
    pub fn with_session_delay(mut self, delay: Duration) -> Self {
        self.session_delay = delay;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: bool) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Direct access to the simulated pump for scripting faults or inspection.
    pub fn pump(&self) -> MutexGuard<'_, SimulatedPump> {
        self.pump.lock()
    }

    /// Fail the next session attempt with `error` before it reaches the pump.
    pub fn fail_next_session(&self, error: LinkError) {
        self.link.lock().failures.push_back(error);
    }

    pub fn sessions_run(&self) -> u64 {
        self.link.lock().sessions
    }

    pub fn power_cycles(&self) -> u32 {
        self.link.lock().power_cycles
    }
}

impl Transport for LoopbackTransport {
    fn list_relays(&self) -> Vec<RelayHandle> {
        self.link.lock().relays.clone()
    }

    fn connect(&self, relay: RelayId) -> Result<(), LinkError> {
        let mut link = self.link.lock();
        let entry = link
            .relays
            .iter_mut()
            .find(|r| r.id == relay)
            .ok_or(LinkError::NoRelay)?;
        entry.connected = true;
        Ok(())
    }

    fn disconnect(&self, relay: RelayId) {
        if let Some(entry) = self.link.lock().relays.iter_mut().find(|r| r.id == relay) {
            entry.connected = false;
        }
    }

    fn supports_heartbeat(&self) -> bool {
        self.heartbeat
    }

    fn run_session<R>(
        &self,
        relay: RelayId,
        body: impl FnOnce(&mut dyn PumpSession) -> R,
    ) -> Result<R, LinkError> {
        {
            let mut link = self.link.lock();
            if !link.radio_on {
                return Err(LinkError::Timeout);
            }
            if !link.relays.iter().any(|r| r.id == relay && r.connected) {
                return Err(LinkError::NoRelay);
            }
            if let Some(error) = link.failures.pop_front() {
                trace!(relay = %relay, %error, "Scripted session failure");
                return Err(error);
            }
            link.sessions += 1;
        }

        if !self.session_delay.is_zero() {
            std::thread::sleep(self.session_delay);
        }

        let now = wall_clock();
        let mut pump = self.pump.lock();
        pump.set_time(now);
        let mut session = RecordingSession {
            pump: &mut *pump,
            tuned: None,
        };
        let result = body(&mut session);

        if let Some(frequency_mhz) = session.tuned {
            let mut link = self.link.lock();
            if let Some(entry) = link.relays.iter_mut().find(|r| r.id == relay) {
                entry.link.last_tuned = Some(now);
                entry.link.frequency_mhz = Some(frequency_mhz);
            }
        }
        Ok(result)
    }

    fn link_state(&self, relay: RelayId) -> Option<LinkState> {
        self.link
            .lock()
            .relays
            .iter()
            .find(|r| r.id == relay)
            .map(|r| r.link.clone())
    }

    fn set_radio_power(&self, enabled: bool) -> Result<(), LinkError> {
        let mut link = self.link.lock();
        if !enabled && link.radio_on {
            link.power_cycles += 1;
        }
        link.radio_on = enabled;
        Ok(())
    }
}

/// Passes calls through to the pump and remembers a successful tuning, which
/// the transport owns as link state.
struct RecordingSession<'a> {
    pump: &'a mut SimulatedPump,
    tuned: Option<f64>,
}

impl PumpSession for RecordingSession<'_> {
    fn read_status(&mut self) -> Result<PumpSnapshot, PumpFault> {
        self.pump.read_status()
    }

    fn read_history(&mut self, since: Duration) -> Result<Vec<PumpEvent>, PumpFault> {
        self.pump.read_history(since)
    }

    fn deliver_bolus(&mut self, units: f64) -> Result<(), PumpFault> {
        self.pump.deliver_bolus(units)
    }

    fn set_temp_basal(&mut self, rate_per_hour: f64, duration: Duration) -> Result<(), PumpFault> {
        self.pump.set_temp_basal(rate_per_hour, duration)
    }

    fn set_clock(&mut self, now: Duration) -> Result<Duration, PumpFault> {
        self.pump.set_clock(now)
    }

    fn tune(&mut self) -> Result<f64, PumpFault> {
        let frequency_mhz = self.pump.tune()?;
        self.tuned = Some(frequency_mhz);
        Ok(frequency_mhz)
    }
}
