//! Clock synchronizer.
//!
//! Every timestamp the pump reports goes through [`ClockSync::assert_clock`]
//! before it is used to date a reservoir sample, glucose sample or dose event.
//! A rejected timestamp means the observation is discarded, and a single
//! best-effort clock-set session is requested.

mod state;

pub use state::{ClockConfig, ClockStats, ClockSync};
