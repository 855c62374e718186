//! Composed pump link node.
//!
//! [`PumpNode`] owns every sub-state machine and is the single serialized
//! owner of link state, pending commands, in-flight flags and cached
//! snapshots. [`execute_plan`] is the body a runner executes inside one
//! exclusive radio session.

mod config;
mod session;
mod state;

pub use config::NodeConfig;
pub use session::execute_plan;
pub use state::PumpNode;
