//! Dose delivery state machine.
//!
//! Each dose request becomes a [`DoseCommand`](pumplink_types::DoseCommand)
//! that moves `Unstarted → Delivering → {Confirmed | CertainFailure |
//! UncertainFailure}`. The uncertain state is the one that matters: the pump
//! may or may not have received the command.
//!
//! # Rules
//!
//! - One bolus in delivery at a time; a second is rejected, never queued.
//! - Boluses run a preflight that reads fresh pump status inside the same
//!   session when reservoir data is missing, old or non-monotonic. An
//!   untrustworthy pump clock stops the attempt before any command is sent.
//! - A pump that reports a conflicting delivery is taken as confirmation,
//!   flagged ambiguous for audit.
//! - An unanswered command while the pump is powering on is retried with the
//!   same amount up to the attempt cap; exhaustion fails the request and
//!   forces a reconciliation poll.
//! - Every other failure is certain and never retried.
//! - A confirmed command is never touched again.
//!
//! # Components
//!
//! - [`DeliveryMachine`] - Pending commands, classification and retries
//! - [`DeliveryConfig`] - Attempt cap and preflight windows
//! - [`DeliveryContext`] - Borrowed sibling state the machine reads and drives

mod preflight;
mod state;

pub use preflight::plan_preflight;
pub use state::{DeliveryConfig, DeliveryContext, DeliveryMachine, DeliveryStats};
