//! Core types for the pump link engine.
//!
//! This crate provides the foundational types for the engine architecture:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`SessionPlan`]: The body of one exclusive radio session
//! - [`StateMachine`]: The trait that the composed node implements
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Single owner**: Every mutation of link state, pending commands,
//!   in-flight flags and cached snapshots happens inside `handle`
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions (radio sessions, storage, notifications)
//! 3. Converts action results back into events

mod action;
mod event;
mod session;
mod traits;

pub use action::{Action, PumpStatus};
pub use event::{Event, EventPriority};
pub use session::{
    DeliveryOutcome, DeliveryReport, Preflight, SessionContext, SessionPlan, SessionReport,
    SessionTicket,
};
pub use traits::{StateMachine, SubStateMachine};

/// Timer identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Periodic staleness check that may trigger a poll.
    FreshnessCheck,
    /// Periodic link silence check.
    LinkHealth,
    /// One-shot re-check after a dose outcome.
    DeliveryRecheck,
}
