//! Freshness tracker and poll trigger.
//!
//! Decides when pump data is too old to dose from and runs poll chains: one
//! "read current status" session, retried a bounded number of times. At most
//! one chain is in flight; a poll requested while one runs is dropped.
//!
//! When a chain exhausts its attempts the tracker reports the error upward,
//! publishes a synthetic unavailable status so nothing waits on stale data,
//! and asks the dispatcher to troubleshoot the relay.

mod state;

pub use state::{FreshnessConfig, FreshnessStats, FreshnessTracker};
