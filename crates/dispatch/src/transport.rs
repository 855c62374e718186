//! Transport boundary.
//!
//! The physical radio driver and packet framing live behind these traits.
//! A transport owns the relays; the engine only ever names them by
//! [`RelayId`] and keeps a cached copy of their [`LinkState`].

use pumplink_types::{
    LinkError, LinkState, PumpEvent, PumpFault, PumpSnapshot, RelayHandle, RelayId,
};
use std::time::Duration;

/// Operations available inside one exclusive session with the pump.
///
/// Every failure is classified by the transport at the point it is raised.
/// In particular, a command that went unanswered while the pump was still
/// powering its radio on must be reported as
/// `PumpFault::Unacknowledged { powering_on: true }`, and a pump that says a
/// delivery is already running must be reported as
/// `PumpFault::ConflictingDelivery`.
pub trait PumpSession {
    /// Read the current pump status.
    fn read_status(&mut self) -> Result<PumpSnapshot, PumpFault>;

    /// Read pump history entries recorded at or after `since` (pump time).
    fn read_history(&mut self, since: Duration) -> Result<Vec<PumpEvent>, PumpFault>;

    /// Start a bolus of exactly `units`.
    fn deliver_bolus(&mut self, units: f64) -> Result<(), PumpFault>;

    /// Start a temporary basal rate.
    fn set_temp_basal(&mut self, rate_per_hour: f64, duration: Duration) -> Result<(), PumpFault>;

    /// Set the pump clock. Returns the clock reading the pump reports afterwards.
    fn set_clock(&mut self, now: Duration) -> Result<Duration, PumpFault>;

    /// Scan for a working radio frequency. Returns the frequency found.
    fn tune(&mut self) -> Result<f64, PumpFault>;
}

/// The radio transport.
///
/// Sessions are synchronous and bounded by a per-session timeout the
/// transport enforces itself; the production runner calls `run_session` on
/// the blocking pool.
pub trait Transport: Send + Sync + 'static {
    /// All relays the transport knows about, with connectivity and link state.
    fn list_relays(&self) -> Vec<RelayHandle>;

    fn connect(&self, relay: RelayId) -> Result<(), LinkError>;

    fn disconnect(&self, relay: RelayId);

    /// Whether relays deliver a periodic low-power wake signal.
    fn supports_heartbeat(&self) -> bool;

    /// Run `body` as one exclusive session on `relay`.
    ///
    /// Fails with a [`LinkError`] if the session could not be opened at all.
    fn run_session<R>(
        &self,
        relay: RelayId,
        body: impl FnOnce(&mut dyn PumpSession) -> R,
    ) -> Result<R, LinkError>;

    /// Current link state of a relay, read back after a session.
    fn link_state(&self, relay: RelayId) -> Option<LinkState>;

    /// Switch the underlying radio power on or off.
    fn set_radio_power(&self, enabled: bool) -> Result<(), LinkError>;
}
