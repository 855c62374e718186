//! Radio session dispatcher.
//!
//! Every exchange with the pump happens inside one exclusive session on one
//! relay. This crate decides which relay a session runs on and enforces the
//! one-session-per-relay rule, which is the only concurrency gate in the
//! engine: a request for a relay that already has a session in flight is
//! rejected with [`LinkError::Busy`](pumplink_types::LinkError::Busy), never
//! queued.
//!
//! # Components
//!
//! - [`Dispatcher`] - Relay table, session tickets, tuning/deprioritisation
//! - [`DispatchConfig`] - Tuning age limit
//! - [`Transport`] / [`PumpSession`] - The boundary the runner executes sessions through

mod state;
mod transport;

pub use state::{
    DispatchConfig, DispatchStats, Dispatcher, InFlightSession, SessionLease, Troubleshooting,
};
pub use transport::{PumpSession, Transport};
