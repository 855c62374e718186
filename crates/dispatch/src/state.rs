//! Dispatcher state: relay table and session tickets.

use pumplink_core::SessionTicket;
use pumplink_types::{time_distance, LinkError, LinkState, RelayHandle, RelayId};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Configuration for the session dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// A relay whose last successful tuning is older than this is re-tuned
    /// when troubleshooting; otherwise it is deprioritised.
    pub tuning_max_age: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tuning_max_age: Duration::from_secs(24 * 60),
        }
    }
}

impl DispatchConfig {
    pub fn with_tuning_max_age(mut self, age: Duration) -> Self {
        self.tuning_max_age = age;
        self
    }
}

/// Permission to run one session on one relay.
///
/// Held by the caller until the matching [`Dispatcher::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLease {
    pub ticket: SessionTicket,
    pub relay: RelayId,
    pub label: &'static str,
}

/// A session that has been granted and not yet completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightSession {
    pub relay: RelayId,
    pub label: &'static str,
    pub started_at: Duration,
}

/// What troubleshooting decided for a failing relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Troubleshooting {
    /// The relay's tuning is old; run a tuning session with this lease.
    Tune(SessionLease),
    /// The relay was tuned recently; other relays are now preferred.
    Deprioritized(RelayId),
    /// Nothing could be done right now.
    Unavailable(LinkError),
}

/// Statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub rejected_busy: u64,
    pub rejected_no_relay: u64,
    pub tunings: u64,
    pub deprioritizations: u64,
}

#[derive(Debug, Clone)]
struct RelayEntry {
    name: String,
    connected: bool,
    link: LinkState,
    in_flight: Option<SessionTicket>,
    consecutive_failures: u32,
    deprioritized: bool,
}

/// Radio session dispatcher.
///
/// Handles:
/// - Relay selection (connected, not deprioritised, lowest id)
/// - One in-flight session per relay
/// - Cached link state, refreshed after each session
/// - Tuning or deprioritising a relay after repeated failures
///
/// Does NOT handle:
/// - Executing sessions (the runner does, through [`crate::Transport`])
/// - Retry policy (freshness and delivery own theirs)
pub struct Dispatcher {
    relays: BTreeMap<RelayId, RelayEntry>,
    in_flight: BTreeMap<SessionTicket, InFlightSession>,
    next_ticket: u64,
    stats: DispatchStats,
    now: Duration,
    config: DispatchConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("relays", &self.relays.len())
            .field("in_flight", &self.in_flight.len())
            .field("next_ticket", &self.next_ticket)
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            relays: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            next_ticket: 0,
            stats: DispatchStats::default(),
            now: Duration::ZERO,
            config,
        }
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Replace the relay table with the transport's current inventory.
    ///
    /// Sessions already in flight keep their relay reserved even if the relay
    /// disappeared; failure counts and deprioritisation survive for relays
    /// that are still listed.
    pub fn update_relays(&mut self, relays: &[RelayHandle]) {
        let mut table = BTreeMap::new();
        for handle in relays {
            let previous = self.relays.remove(&handle.id);
            let entry = match previous {
                Some(mut entry) => {
                    entry.name.clone_from(&handle.name);
                    entry.connected = handle.connected;
                    entry.link = handle.link.clone();
                    entry
                }
                None => RelayEntry {
                    name: handle.name.clone(),
                    connected: handle.connected,
                    link: handle.link.clone(),
                    in_flight: None,
                    consecutive_failures: 0,
                    deprioritized: false,
                },
            };
            table.insert(handle.id, entry);
        }

        // Keep reservations for vanished relays until their session reports back.
        for (id, mut entry) in std::mem::take(&mut self.relays) {
            if entry.in_flight.is_some() {
                entry.connected = false;
                table.insert(id, entry);
            }
        }

        debug!(
            relays = table.len(),
            connected = table.values().filter(|e| e.connected).count(),
            "Relay inventory updated"
        );
        self.relays = table;
    }

    pub fn has_connected_relay(&self) -> bool {
        self.relays.values().any(|e| e.connected)
    }

    /// The relay an unpinned session would run on.
    ///
    /// Connected relays that have not been deprioritised come first; ties go
    /// to the lowest id. Busy relays are not skipped: all sessions to the
    /// pump go through the preferred relay, one at a time.
    pub fn preferred_relay(&self) -> Option<RelayId> {
        self.relays
            .iter()
            .filter(|(_, e)| e.connected)
            .min_by_key(|(id, e)| (e.deprioritized, **id))
            .map(|(id, _)| *id)
    }

    pub fn is_busy(&self, relay: RelayId) -> bool {
        self.relays
            .get(&relay)
            .is_some_and(|e| e.in_flight.is_some())
    }

    pub fn in_flight(&self, ticket: SessionTicket) -> Option<&InFlightSession> {
        self.in_flight.get(&ticket)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn link_state(&self, relay: RelayId) -> Option<&LinkState> {
        self.relays.get(&relay).map(|e| &e.link)
    }

    pub fn is_deprioritized(&self, relay: RelayId) -> bool {
        self.relays.get(&relay).is_some_and(|e| e.deprioritized)
    }

    /// Request exclusive access to a relay.
    ///
    /// With `on_relay` unset the preferred relay is used.
    pub fn begin(
        &mut self,
        label: &'static str,
        on_relay: Option<RelayId>,
    ) -> Result<SessionLease, LinkError> {
        let relay = match on_relay {
            Some(id) => self.relays.get(&id).filter(|e| e.connected).map(|_| id),
            None => self.preferred_relay(),
        };
        let Some((relay, entry)) = relay.and_then(|id| self.relays.get_mut(&id).map(|e| (id, e)))
        else {
            self.stats.rejected_no_relay += 1;
            debug!(label, "Session rejected: no connected relay");
            return Err(LinkError::NoRelay);
        };

        if let Some(running) = entry.in_flight {
            self.stats.rejected_busy += 1;
            debug!(
                label,
                relay = %relay,
                running = %running,
                "Session rejected: relay busy"
            );
            return Err(LinkError::Busy(relay));
        }

        let ticket = SessionTicket(self.next_ticket);
        self.next_ticket += 1;
        entry.in_flight = Some(ticket);
        self.in_flight.insert(
            ticket,
            InFlightSession {
                relay,
                label,
                started_at: self.now,
            },
        );
        self.stats.sessions_started += 1;

        trace!(label, relay = %relay, ticket = %ticket, "Session granted");
        Ok(SessionLease {
            ticket,
            relay,
            label,
        })
    }

    /// Release a relay after its session finished.
    ///
    /// `link` is the link state read back from the transport, if any.
    /// Returns the session record, or `None` for an unknown ticket.
    pub fn complete(
        &mut self,
        ticket: SessionTicket,
        link: Option<LinkState>,
        succeeded: bool,
    ) -> Option<InFlightSession> {
        let session = self.in_flight.remove(&ticket)?;

        if let Some(entry) = self.relays.get_mut(&session.relay) {
            if entry.in_flight == Some(ticket) {
                entry.in_flight = None;
            }
            if let Some(link) = link {
                entry.link = link;
            }
            if succeeded {
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
            }
        }
        if !succeeded {
            self.stats.sessions_failed += 1;
        }

        trace!(
            ticket = %ticket,
            relay = %session.relay,
            label = session.label,
            succeeded,
            elapsed_ms = time_distance(self.now, session.started_at).as_millis() as u64,
            "Session completed"
        );
        Some(session)
    }

    /// Decide how to recover a relay that keeps failing.
    ///
    /// If the relay has not been tuned within `tuning_max_age`, a tuning
    /// session is granted on it; otherwise it is deprioritised in favour of
    /// the other relays.
    pub fn troubleshoot(&mut self, relay: RelayId) -> Troubleshooting {
        let Some(entry) = self.relays.get(&relay) else {
            return Troubleshooting::Unavailable(LinkError::NoRelay);
        };

        let tuning_stale = match entry.link.last_tuned {
            Some(at) => time_distance(self.now, at) > self.config.tuning_max_age,
            None => true,
        };

        if tuning_stale {
            return match self.begin("tune", Some(relay)) {
                Ok(lease) => {
                    info!(relay = %relay, "Tuning relay after repeated failures");
                    Troubleshooting::Tune(lease)
                }
                Err(e) => Troubleshooting::Unavailable(e),
            };
        }

        if let Some(entry) = self.relays.get_mut(&relay) {
            if !entry.deprioritized {
                entry.deprioritized = true;
                self.stats.deprioritizations += 1;
            }
            info!(
                relay = %relay,
                name = %entry.name,
                failures = entry.consecutive_failures,
                "Relay deprioritized: tuned recently but still failing"
            );
        }
        Troubleshooting::Deprioritized(relay)
    }

    /// Record a successful tuning.
    pub fn record_tuning(&mut self, relay: RelayId, frequency_mhz: f64) {
        if let Some(entry) = self.relays.get_mut(&relay) {
            entry.link.last_tuned = Some(self.now);
            entry.link.frequency_mhz = Some(frequency_mhz);
            entry.deprioritized = false;
            entry.consecutive_failures = 0;
            self.stats.tunings += 1;
            debug!(relay = %relay, frequency_mhz, "Relay tuned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const MINUTE: Duration = Duration::from_secs(60);

    fn relays(ids: &[u32]) -> Vec<RelayHandle> {
        ids.iter()
            .map(|id| RelayHandle::connected(RelayId(*id), format!("relay {id}")))
            .collect()
    }

    fn dispatcher(ids: &[u32]) -> Dispatcher {
        let mut d = Dispatcher::new();
        d.set_time(Duration::from_secs(1_000_000));
        d.update_relays(&relays(ids));
        d
    }

    #[test]
    fn test_no_relay_rejected() {
        let mut d = Dispatcher::new();
        assert_eq!(d.begin("read_status", None), Err(LinkError::NoRelay));

        let mut offline = relays(&[1]);
        offline[0].connected = false;
        d.update_relays(&offline);
        assert_eq!(d.begin("read_status", None), Err(LinkError::NoRelay));
        assert_eq!(d.stats().rejected_no_relay, 2);
    }

    #[traced_test]
    #[test]
    fn test_second_session_on_same_relay_is_busy() {
        let mut d = dispatcher(&[1, 2]);

        let first = d.begin("read_status", None).unwrap();
        assert_eq!(first.relay, RelayId(1));

        // Unpinned requests go to the preferred relay and are rejected, not rerouted.
        assert_eq!(
            d.begin("deliver_bolus", None),
            Err(LinkError::Busy(RelayId(1)))
        );
        assert_eq!(d.in_flight_count(), 1);

        d.complete(first.ticket, None, true).unwrap();
        assert!(d.begin("deliver_bolus", None).is_ok());
    }

    #[test]
    fn test_complete_refreshes_link_state() {
        let mut d = dispatcher(&[1]);
        let lease = d.begin("read_status", None).unwrap();

        let link = LinkState {
            last_tuned: Some(Duration::from_secs(5)),
            frequency_mhz: Some(916.6),
        };
        let session = d.complete(lease.ticket, Some(link.clone()), true).unwrap();
        assert_eq!(session.label, "read_status");
        assert_eq!(d.link_state(RelayId(1)), Some(&link));

        // Completing twice is a no-op.
        assert!(d.complete(lease.ticket, None, true).is_none());
    }

    #[test]
    fn test_troubleshoot_tunes_when_tuning_is_old() {
        let mut d = dispatcher(&[1, 2]);

        match d.troubleshoot(RelayId(1)) {
            Troubleshooting::Tune(lease) => {
                assert_eq!(lease.relay, RelayId(1));
                assert_eq!(lease.label, "tune");
                d.complete(lease.ticket, None, true);
            }
            other => panic!("expected tuning, got {other:?}"),
        }

        d.record_tuning(RelayId(1), 916.5);
        assert_eq!(
            d.link_state(RelayId(1)).unwrap().last_tuned,
            Some(Duration::from_secs(1_000_000))
        );
    }

    #[test]
    fn test_troubleshoot_deprioritizes_recently_tuned_relay() {
        let mut d = dispatcher(&[1, 2]);
        d.record_tuning(RelayId(1), 916.5);
        d.set_time(Duration::from_secs(1_000_000) + 10 * MINUTE);

        assert_eq!(
            d.troubleshoot(RelayId(1)),
            Troubleshooting::Deprioritized(RelayId(1))
        );
        assert_eq!(d.preferred_relay(), Some(RelayId(2)));

        // After the tuning window the relay is tuned again instead.
        d.set_time(Duration::from_secs(1_000_000) + 30 * MINUTE);
        assert!(matches!(
            d.troubleshoot(RelayId(1)),
            Troubleshooting::Tune(_)
        ));
    }

    #[test]
    fn test_inventory_update_keeps_in_flight_reservation() {
        let mut d = dispatcher(&[1]);
        let lease = d.begin("read_status", None).unwrap();

        d.update_relays(&[]);
        assert!(d.is_busy(RelayId(1)));
        assert!(!d.has_connected_relay());

        d.complete(lease.ticket, None, false).unwrap();
        assert_eq!(d.stats().sessions_failed, 1);
    }
}
