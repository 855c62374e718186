//! Simulated relays with deterministic latency, session loss and outages.

use pumplink_types::{LinkState, RelayHandle, RelayId};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Configuration for the simulated radio.
#[derive(Debug, Clone)]
pub struct RadioConfig {
    /// Number of relays, with ids starting at 1.
    pub relays: u32,
    /// Base time from session start to completion.
    pub session_latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Probability (0.0 - 1.0) that a session times out before reaching the pump.
    pub session_loss_rate: f64,
    /// Whether relays deliver a periodic wake signal.
    pub heartbeat: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            relays: 1,
            session_latency: Duration::from_millis(800),
            jitter_fraction: 0.1,
            session_loss_rate: 0.0,
            heartbeat: false,
        }
    }
}

/// Simulated relays.
///
/// Supports:
/// - Configurable session latency with jitter
/// - Session loss (probabilistic timeouts)
/// - Relay outages (a relay that never reaches the pump)
/// - Radio power cycling
#[derive(Debug)]
pub struct SimulatedRadio {
    config: RadioConfig,
    links: BTreeMap<RelayId, LinkState>,
    /// Relays that are connected but cannot reach the pump.
    unreachable: BTreeSet<RelayId>,
    disconnected: BTreeSet<RelayId>,
    powered_off_until: Option<Duration>,
    power_cycles: u32,
}

impl SimulatedRadio {
    pub fn new(config: RadioConfig) -> Self {
        let links = (1..=config.relays)
            .map(|id| (RelayId(id), LinkState::default()))
            .collect();
        Self {
            config,
            links,
            unreachable: BTreeSet::new(),
            disconnected: BTreeSet::new(),
            powered_off_until: None,
            power_cycles: 0,
        }
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    pub fn relay_handles(&self) -> Vec<RelayHandle> {
        self.links
            .iter()
            .map(|(id, link)| RelayHandle {
                id: *id,
                name: format!("relay-{}", id.0),
                connected: !self.disconnected.contains(id),
                link: link.clone(),
            })
            .collect()
    }

    pub fn link_state(&self, relay: RelayId) -> Option<LinkState> {
        self.links.get(&relay).cloned()
    }

    pub fn record_tuning(&mut self, relay: RelayId, at: Duration, frequency_mhz: f64) {
        if let Some(link) = self.links.get_mut(&relay) {
            link.last_tuned = Some(at);
            link.frequency_mhz = Some(frequency_mhz);
        }
    }

    // ─── Outages ───

    /// Keep the relay connected but unable to reach the pump.
    pub fn make_unreachable(&mut self, relay: RelayId) {
        self.unreachable.insert(relay);
    }

    pub fn restore(&mut self, relay: RelayId) {
        self.unreachable.remove(&relay);
        self.disconnected.remove(&relay);
    }

    pub fn disconnect(&mut self, relay: RelayId) {
        self.disconnected.insert(relay);
    }

    pub fn restore_all(&mut self) {
        self.unreachable.clear();
        self.disconnected.clear();
    }

    // ─── Power ───

    pub fn power_cycle(&mut self, now: Duration, off_for: Duration) {
        self.powered_off_until = Some(now + off_for);
        self.power_cycles += 1;
    }

    pub fn power_cycles(&self) -> u32 {
        self.power_cycles
    }

    pub fn is_powered(&self, now: Duration) -> bool {
        self.powered_off_until.map_or(true, |until| now >= until)
    }

    // ─── Session Decision ───

    /// Whether a session on `relay` reaches the pump right now.
    ///
    /// Always consumes one RNG draw so outages do not shift later decisions.
    pub fn reaches_pump(&self, relay: RelayId, now: Duration, rng: &mut ChaCha8Rng) -> bool {
        let lost = rng.gen::<f64>() < self.config.session_loss_rate;
        !lost
            && self.is_powered(now)
            && !self.unreachable.contains(&relay)
            && !self.disconnected.contains(&relay)
    }

    pub fn set_session_loss_rate(&mut self, rate: f64) {
        self.config.session_loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Sample the duration of one session.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.session_latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.001))
    }
}
