//! Outbound collaborators: persistence, user notifications, remote upload.
//!
//! The runner calls these from its event loop, so implementations must not
//! block for long. Slow backends should queue internally.

use parking_lot::Mutex;
use pumplink_simulation::SimStore;
use pumplink_types::{
    DoseRecord, GlucoseReading, Notification, PumpEvent, ReservoirSample, ReservoirUpdate,
    UploadRecord,
};
use std::time::Duration;
use tracing::{debug, info, warn};

pub trait PersistenceStore: Send + Sync + 'static {
    /// Store a reservoir sample and report it with its predecessor.
    fn add_reservoir_sample(&self, sample: ReservoirSample) -> Result<ReservoirUpdate, String>;

    fn add_glucose_sample(&self, reading: GlucoseReading);

    fn add_dose_event(&self, record: DoseRecord);

    /// Store pump history entries. Entries already stored are skipped.
    fn add_pump_events(&self, events: Vec<PumpEvent>);

    /// Where the next pump history query should start, if anywhere.
    fn last_pump_event_query_cutoff(&self, now: Duration) -> Option<Duration>;
}

pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

pub trait UploadSink: Send + Sync + 'static {
    fn upload(&self, record: UploadRecord);
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory implementations
// ═══════════════════════════════════════════════════════════════════════════

/// Process-local store. Nothing survives a restart.
///
/// Shares its bookkeeping with the simulator's store, so continuity and the
/// history cutoff behave the same on the bench and in simulation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<SimStore>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reservoir(&self) -> Vec<ReservoirSample> {
        self.inner.lock().reservoir().to_vec()
    }

    pub fn glucose(&self) -> Vec<GlucoseReading> {
        self.inner.lock().glucose().to_vec()
    }

    pub fn doses(&self) -> Vec<DoseRecord> {
        self.inner.lock().doses().to_vec()
    }

    pub fn pump_events(&self) -> Vec<PumpEvent> {
        self.inner.lock().pump_events().to_vec()
    }
}

impl PersistenceStore for MemoryStore {
    fn add_reservoir_sample(&self, sample: ReservoirSample) -> Result<ReservoirUpdate, String> {
        self.inner.lock().add_reservoir_sample(sample)
    }

    fn add_glucose_sample(&self, reading: GlucoseReading) {
        self.inner.lock().add_glucose_sample(reading);
    }

    fn add_dose_event(&self, record: DoseRecord) {
        self.inner.lock().add_dose_event(record);
    }

    fn add_pump_events(&self, events: Vec<PumpEvent>) {
        self.inner.lock().add_pump_events(events);
    }

    fn last_pump_event_query_cutoff(&self, now: Duration) -> Option<Duration> {
        Some(self.inner.lock().last_pump_event_query_cutoff(now))
    }
}

/// Writes notifications and uploads to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::DeliveryFailed { .. } | Notification::EmptyReservoir => {
                warn!(?notification, "User notification")
            }
            _ => info!(?notification, "User notification"),
        }
    }
}

impl UploadSink for LogSink {
    fn upload(&self, record: UploadRecord) {
        debug!(?record, "Upload");
    }
}

/// Keeps every notification and upload for inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
    uploads: Mutex<Vec<UploadRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.uploads.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

impl UploadSink for RecordingSink {
    fn upload(&self, record: UploadRecord) {
        self.uploads.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumplink_types::PumpEventKind;
    use std::sync::Arc;

    fn sample(units: f64, minute: u64) -> ReservoirSample {
        ReservoirSample {
            units,
            timestamp: Duration::from_secs(minute * 60),
            minutes_to_empty: None,
        }
    }

    #[test]
    fn test_store_through_trait_object() {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn PersistenceStore> = store.clone();

        shared.add_reservoir_sample(sample(50.0, 0)).unwrap();
        let next = shared.add_reservoir_sample(sample(49.5, 10)).unwrap();
        assert!(next.is_continuous);
        assert_eq!(next.previous, Some(sample(50.0, 0)));
        assert!(shared.add_reservoir_sample(sample(48.0, 5)).is_err());
        assert_eq!(store.reservoir().len(), 2);

        let now = Duration::from_secs(10 * 60 * 60);
        let bolus = PumpEvent {
            timestamp: now - Duration::from_secs(60),
            kind: PumpEventKind::Bolus { units: 1.0 },
        };
        shared.add_pump_events(vec![bolus.clone(), bolus.clone()]);
        assert_eq!(store.pump_events(), vec![bolus.clone()]);
        assert_eq!(shared.last_pump_event_query_cutoff(now), Some(bolus.timestamp));
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.notify(Notification::LowBattery);
        sink.notify(Notification::EmptyReservoir);
        assert_eq!(
            sink.notifications(),
            vec![Notification::LowBattery, Notification::EmptyReservoir]
        );
        assert!(sink.uploads().is_empty());
    }
}
