//! Production runner with async I/O.
//!
//! Wraps the deterministic [`PumpNode`](pumplink_node::PumpNode) with real
//! I/O:
//!
//! - Timers via tokio tasks
//! - Radio sessions on the tokio blocking pool
//! - Persistence, notification and upload collaborators behind traits
//! - Dose results returned through oneshot channels, pump status published
//!   on a watch channel
//!
//! # Architecture
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events over channels. This avoids mutex contention and keeps
//! every mutation of link state in one serialized order.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  ProductionRunner task                                           │
//! │    loop { event = select!(timers, callbacks, transport, client); │
//! │           actions = node.handle(event); execute(actions) }       │
//! └──────────────────────────────────────────────────────────────────┘
//!          │ RunSession                       ▲ SessionCompleted
//!          ▼                                  │
//!   blocking pool: transport.run_session(relay, execute_plan)
//! ```

mod collaborators;
mod config;
mod handle;
mod loopback;
pub mod metrics;
mod runner;
pub mod telemetry;
mod timers;

pub use collaborators::{
    LogSink, MemoryStore, NotificationSink, PersistenceStore, RecordingSink, UploadSink,
};
pub use config::{ConfigError, EngineConfig};
pub use handle::EngineHandle;
pub use loopback::LoopbackTransport;
pub use runner::{ProductionRunner, ProductionRunnerBuilder, RunnerError, ShutdownHandle};
pub use telemetry::{init_logging, LoggingConfig, TelemetryError};
pub use timers::TimerManager;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Local wall time as a duration since the UNIX epoch.
///
/// A system clock set before 1970 reads as the epoch itself.
pub fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
