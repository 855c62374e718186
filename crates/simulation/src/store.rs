//! In-memory persistence collaborator.

use pumplink_types::{DoseRecord, GlucoseReading, PumpEvent, ReservoirSample, ReservoirUpdate};
use std::time::Duration;

/// Gap between samples beyond which the reservoir sequence is not continuous.
const CONTINUITY_GAP: Duration = Duration::from_secs(15 * 60);

/// How far back history is read when nothing has been stored yet.
const INITIAL_HISTORY_WINDOW: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Default)]
pub struct SimStore {
    reservoir: Vec<ReservoirSample>,
    glucose: Vec<GlucoseReading>,
    doses: Vec<DoseRecord>,
    pump_events: Vec<PumpEvent>,
}

impl SimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reservoir sample. Timestamps must not go backwards.
    pub fn add_reservoir_sample(
        &mut self,
        sample: ReservoirSample,
    ) -> Result<ReservoirUpdate, String> {
        let previous = self.reservoir.last().copied();
        if let Some(previous) = previous {
            if sample.timestamp < previous.timestamp {
                return Err(format!(
                    "sample at {:?} is older than stored sample at {:?}",
                    sample.timestamp, previous.timestamp
                ));
            }
        }
        let is_continuous =
            previous.is_some_and(|p| sample.timestamp - p.timestamp <= CONTINUITY_GAP);
        self.reservoir.push(sample);
        Ok(ReservoirUpdate {
            new: sample,
            previous,
            is_continuous,
        })
    }

    pub fn add_glucose_sample(&mut self, reading: GlucoseReading) {
        if !self.glucose.contains(&reading) {
            self.glucose.push(reading);
        }
    }

    pub fn add_dose_event(&mut self, record: DoseRecord) {
        self.doses.push(record);
    }

    /// Add pump history entries, skipping ones already stored.
    pub fn add_pump_events(&mut self, events: Vec<PumpEvent>) {
        for event in events {
            if !self.pump_events.contains(&event) {
                self.pump_events.push(event);
            }
        }
    }

    /// Where the next pump history query should start.
    pub fn last_pump_event_query_cutoff(&self, now: Duration) -> Duration {
        self.pump_events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or_else(|| now.saturating_sub(INITIAL_HISTORY_WINDOW))
    }

    pub fn reservoir(&self) -> &[ReservoirSample] {
        &self.reservoir
    }

    pub fn glucose(&self) -> &[GlucoseReading] {
        &self.glucose
    }

    pub fn doses(&self) -> &[DoseRecord] {
        &self.doses
    }

    pub fn pump_events(&self) -> &[PumpEvent] {
        &self.pump_events
    }
}
