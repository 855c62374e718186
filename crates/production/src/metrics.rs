//! Production metrics using the native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use pumplink_node::PumpNode;
use pumplink_types::DoseError;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Encoder, Gauge,
    Histogram, TextEncoder,
};
use std::sync::OnceLock;
use tracing::warn;

static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

pub struct Metrics {
    // === Sessions ===
    pub sessions_started: CounterVec,
    pub sessions_failed: CounterVec,
    pub session_latency: Histogram,
    pub sessions_rejected: Gauge,

    // === Polling ===
    pub poll_chains_started: Gauge,
    pub poll_chains_exhausted: Gauge,

    // === Delivery ===
    pub dose_outcomes: CounterVec,

    // === Link health ===
    pub link_resets: Gauge,

    // === Pump ===
    pub reservoir_units: Gauge,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        // Radio sessions: 50ms to 60s
        let latency_buckets = vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

        Ok(Self {
            sessions_started: register_counter_vec!(
                "pumplink_sessions_started_total",
                "Radio sessions started, by plan",
                &["plan"]
            )?,
            sessions_failed: register_counter_vec!(
                "pumplink_sessions_failed_total",
                "Radio sessions that ended in an error, by plan",
                &["plan"]
            )?,
            session_latency: register_histogram!(
                "pumplink_session_latency_seconds",
                "Wall time of one radio session",
                latency_buckets
            )?,
            sessions_rejected: register_gauge!(
                "pumplink_sessions_rejected",
                "Sessions refused by the dispatcher (busy or no relay)"
            )?,
            poll_chains_started: register_gauge!(
                "pumplink_poll_chains_started",
                "Poll chains started"
            )?,
            poll_chains_exhausted: register_gauge!(
                "pumplink_poll_chains_exhausted",
                "Poll chains that used every attempt without a snapshot"
            )?,
            dose_outcomes: register_counter_vec!(
                "pumplink_dose_outcomes_total",
                "Dose requests resolved, by classification",
                &["outcome"]
            )?,
            link_resets: register_gauge!(
                "pumplink_link_resets",
                "Radio power cycles started by link recovery"
            )?,
            reservoir_units: register_gauge!(
                "pumplink_reservoir_units",
                "Latest trusted reservoir volume"
            )?,
        })
    }
}

/// Get or initialize the global metrics instance.
///
/// `None` if registration failed; metrics are then skipped for the life of
/// the process.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS
        .get_or_init(|| match Metrics::new() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "Metrics registration failed");
                None
            }
        })
        .as_ref()
}

pub fn record_session_started(plan: &str) {
    if let Some(m) = metrics() {
        m.sessions_started.with_label_values(&[plan]).inc();
    }
}

pub fn record_session_finished(plan: &str, latency_secs: f64, ok: bool) {
    if let Some(m) = metrics() {
        m.session_latency.observe(latency_secs);
        if !ok {
            m.sessions_failed.with_label_values(&[plan]).inc();
        }
    }
}

/// Classification label for a resolved dose.
///
/// Fixed set to keep label cardinality bounded.
pub fn dose_outcome_label(result: &Result<(), &DoseError>) -> &'static str {
    match result {
        Ok(()) => "confirmed",
        Err(DoseError::Delivery(e)) if e.is_certain() => "certain_failure",
        Err(DoseError::Delivery(_)) => "uncertain_failure",
        Err(DoseError::Link(_)) => "link_failure",
        Err(DoseError::Configuration(_)) => "rejected",
        Err(DoseError::DataIntegrity(_)) => "data_integrity",
    }
}

pub fn record_dose_outcome(outcome: &'static str) {
    if let Some(m) = metrics() {
        m.dose_outcomes.with_label_values(&[outcome]).inc();
    }
}

pub fn set_reservoir_units(units: f64) {
    if let Some(m) = metrics() {
        m.reservoir_units.set(units);
    }
}

/// Mirror the node's cumulative statistics into gauges.
pub fn set_from_node(node: &PumpNode) {
    let Some(m) = metrics() else {
        return;
    };
    let dispatch = node.dispatcher().stats();
    m.sessions_rejected
        .set((dispatch.rejected_busy + dispatch.rejected_no_relay) as f64);

    let freshness = node.freshness().stats();
    m.poll_chains_started.set(freshness.chains_started as f64);
    m.poll_chains_exhausted
        .set(freshness.chains_exhausted as f64);

    m.link_resets
        .set(node.recovery().stats().resets_started as f64);
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumplink_types::{ConfigurationError, DeliveryError, DeliveryFailure, LinkError};

    #[test]
    fn test_dose_outcome_labels() {
        let certain = DoseError::Delivery(DeliveryError::Certain(DeliveryFailure::Link(
            LinkError::Timeout,
        )));
        let uncertain = DoseError::Delivery(DeliveryError::Uncertain(DeliveryFailure::Link(
            LinkError::Timeout,
        )));
        let missing = DoseError::Configuration(ConfigurationError::MissingIdentity);

        assert_eq!(dose_outcome_label(&Ok(())), "confirmed");
        assert_eq!(dose_outcome_label(&Err(&certain)), "certain_failure");
        assert_eq!(dose_outcome_label(&Err(&uncertain)), "uncertain_failure");
        assert_eq!(dose_outcome_label(&Err(&missing)), "rejected");
    }

    #[test]
    fn test_metrics_render() {
        record_session_started("read_status");
        record_dose_outcome("confirmed");
        let text = gather_text().expect("encode");
        assert!(text.contains("pumplink_sessions_started_total"));
        assert!(text.contains("pumplink_dose_outcomes_total"));
    }
}
