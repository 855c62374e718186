//! Deterministic simulation for the pump link engine.
//!
//! The runner drives a single [`PumpNode`](pumplink_node::PumpNode) against a
//! simulated pump, simulated relays and an in-memory store. Everything that
//! would be asynchronous in production happens inline, and all randomness
//! comes from a seeded `ChaCha8Rng`, so the same seed always replays the same
//! run.

mod event_queue;
mod pump;
mod radio;
mod runner;
mod store;

pub use event_queue::EventKey;
pub use pump::{PumpConfig, ScriptedFault, SimulatedPump};
pub use radio::{RadioConfig, SimulatedRadio};
pub use runner::{SimulationConfig, SimulationLog, SimulationRunner, SimulationStats};
pub use store::SimStore;
