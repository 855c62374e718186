//! End-to-end tests of the production runner over the loopback transport.

use pumplink_core::PumpStatus;
use pumplink_node::NodeConfig;
use pumplink_production::{
    wall_clock, EngineHandle, LoopbackTransport, MemoryStore, ProductionRunner, RecordingSink, RunnerError,
    ShutdownHandle,
};
use pumplink_simulation::{PumpConfig, ScriptedFault};
use pumplink_types::{
    ConfigurationError, DoseError, DoseKind, Notification, PumpFault, UploadRecord,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    engine: EngineHandle,
    transport: Arc<LoopbackTransport>,
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), RunnerError>>,
}

fn start(config: NodeConfig, pump: PumpConfig) -> Harness {
    let transport = Arc::new(LoopbackTransport::new(pump));
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::new());

    let mut runner = ProductionRunner::builder()
        .transport(Arc::clone(&transport))
        .node_config(config)
        .store(store.clone())
        .notifications(sink.clone())
        .uploads(sink.clone())
        .build()
        .expect("build runner");
    let engine = runner.handle();
    let shutdown = runner.shutdown_handle().expect("shutdown handle");
    let task = tokio::spawn(runner.run());

    Harness {
        engine,
        transport,
        store,
        sink,
        shutdown,
        task,
    }
}

fn configured() -> NodeConfig {
    NodeConfig::default().with_pump_id("pump-under-test")
}

async fn wait_for_status(
    rx: &mut watch::Receiver<Option<PumpStatus>>,
    matches: impl Fn(&PumpStatus) -> bool,
) -> PumpStatus {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(status) = rx.borrow_and_update().clone() {
                if matches(&status) {
                    return status;
                }
            }
            rx.changed().await.expect("runner stopped");
        }
    })
    .await
    .expect("timed out waiting for status")
}

fn is_fresh(status: &PumpStatus) -> bool {
    matches!(status, PumpStatus::Fresh { .. })
}

#[tokio::test]
async fn test_force_read_publishes_fresh_status() {
    let h = start(
        configured(),
        PumpConfig {
            reservoir_units: 88.0,
            ..Default::default()
        },
    );
    let mut status = h.engine.subscribe_status();

    h.engine.force_read().await.unwrap();
    let PumpStatus::Fresh { snapshot, .. } = wait_for_status(&mut status, is_fresh).await else {
        unreachable!()
    };
    assert_eq!(snapshot.reservoir_units, 88.0);
    assert_eq!(h.transport.sessions_run(), 1);

    // The store callback runs after the status publish; give it a moment.
    tokio::time::timeout(WAIT, async {
        while h.store.reservoir().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reservoir sample stored");
    assert!(h.engine.status().is_some());

    h.shutdown.shutdown();
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bolus_resolves_once_through_handle() {
    let h = start(configured(), PumpConfig::default());

    let record = tokio::time::timeout(WAIT, h.engine.request_dose(DoseKind::Bolus { units: 1.5 }))
        .await
        .expect("dose timed out")
        .expect("dose confirmed");

    assert_eq!(record.attempts, 1);
    assert!(!record.ambiguous);
    assert_eq!(h.transport.pump().commands(), &[DoseKind::Bolus { units: 1.5 }]);
    assert_eq!(h.store.doses(), vec![record]);
}

#[tokio::test]
async fn test_uncertain_attempts_retry_then_confirm() {
    let h = start(configured(), PumpConfig::default());
    {
        let mut pump = h.transport.pump();
        pump.script_delivery_fault(ScriptedFault::lost_command());
        pump.script_delivery_fault(ScriptedFault::lost_command());
    }

    let record = tokio::time::timeout(WAIT, h.engine.request_dose(DoseKind::Bolus { units: 0.5 }))
        .await
        .expect("dose timed out")
        .expect("dose confirmed");

    assert_eq!(record.attempts, 3);
    assert_eq!(h.transport.pump().commands().len(), 3);
    assert_eq!(h.transport.pump().bolus_units_delivered(), 0.5);
}

#[tokio::test]
async fn test_missing_identity_fails_dose_without_radio() {
    let h = start(NodeConfig::default(), PumpConfig::default());

    let result =
        tokio::time::timeout(WAIT, h.engine.request_dose(DoseKind::Bolus { units: 1.0 }))
            .await
            .expect("dose timed out");

    assert!(matches!(
        result,
        Err(RunnerError::Dose(DoseError::Configuration(
            ConfigurationError::MissingIdentity
        )))
    ));
    assert_eq!(h.transport.sessions_run(), 0);
}

#[tokio::test]
async fn test_untrusted_clock_is_corrected_then_trusted() {
    let h = start(
        configured(),
        PumpConfig {
            clock_offset_secs: -600,
            ..Default::default()
        },
    );

    // The rejected read is followed by one clock-set session.
    h.engine.force_read().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while h.transport.sessions_run() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clock correction ran");
    assert!(h.sink.uploads().iter().any(|u| matches!(
        u,
        UploadRecord::DeviceStatus { error: Some(_), .. }
    )));

    let PumpStatus::Fresh { snapshot, .. } = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(status @ PumpStatus::Fresh { .. }) = h.engine.status() {
                return status;
            }
            // Reads issued while the correction holds the radio are dropped.
            h.engine.force_read().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("trusted read after correction") else {
        unreachable!()
    };
    let skew = snapshot.clock.abs_diff(wall_clock());
    assert!(skew < Duration::from_secs(60), "skew {skew:?}");
}

#[tokio::test]
async fn test_failed_delivery_notifies_user() {
    let h = start(configured(), PumpConfig::default());
    h.transport.pump().script_delivery_fault(ScriptedFault {
        fault: PumpFault::Refused("bolus too large".into()),
        delivered: false,
    });

    let result =
        tokio::time::timeout(WAIT, h.engine.request_dose(DoseKind::Bolus { units: 30.0 }))
            .await
            .expect("dose timed out");
    assert!(matches!(result, Err(RunnerError::Dose(DoseError::Delivery(e))) if e.is_certain()));

    tokio::time::timeout(WAIT, async {
        while !h
            .sink
            .notifications()
            .iter()
            .any(|n| matches!(n, Notification::DeliveryFailed { .. }))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("failure notification");
}

#[tokio::test]
async fn test_shutdown_stops_runner() {
    let h = start(configured(), PumpConfig::default());
    h.shutdown.shutdown();
    let result = tokio::time::timeout(WAIT, h.task)
        .await
        .expect("runner did not stop");
    assert!(result.unwrap().is_ok());

    // The runner is gone, so requests fail instead of hanging.
    assert!(matches!(
        h.engine.force_read().await,
        Err(RunnerError::ChannelClosed)
    ));
}
