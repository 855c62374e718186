//! Link health recovery.
//!
//! Watches how long pump data and glucose data have gone without a fresh
//! observation. When either has been silent long enough, the radio is power
//! cycled out of band. Resets are rate-limited so a link that stays dead does
//! not flap.

mod state;

pub use state::{LinkRecovery, LinkSilenceRecord, RecoveryConfig, RecoveryStats};
