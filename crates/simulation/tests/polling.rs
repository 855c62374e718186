//! Poll chains, staleness and clock checks through the full node.

use pumplink_core::{Event, PumpStatus};
use pumplink_node::NodeConfig;
use pumplink_simulation::{PumpConfig, RadioConfig, SimulationConfig, SimulationRunner};
use pumplink_types::{ConfigurationError, DoseError, DoseKind, RelayId};
use std::time::Duration;
use tracing_test::traced_test;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

fn quiet_config() -> SimulationConfig {
    SimulationConfig {
        node: NodeConfig::default()
            .with_pump_id("sim-pump")
            .with_freshness_interval(Duration::from_secs(3600)),
        ..Default::default()
    }
}

fn runner(config: SimulationConfig) -> SimulationRunner {
    let mut runner = SimulationRunner::new(config, 42);
    runner.initialize();
    runner
}

fn unavailable_count(runner: &SimulationRunner) -> usize {
    runner
        .log()
        .statuses
        .iter()
        .filter(|(_, s)| matches!(s, PumpStatus::Unavailable { .. }))
        .count()
}

#[test]
fn test_concurrent_force_reads_share_one_session() {
    let mut runner = runner(quiet_config());
    runner.submit(10 * SECOND, Event::ForceRead);
    runner.submit(10 * SECOND, Event::ForceRead);
    runner.run_for(MINUTE);

    assert_eq!(runner.log().session_count("read_status"), 1);
    let stats = runner.node().freshness().stats();
    assert_eq!(stats.chains_started, 1);
    assert_eq!(stats.polls_dropped, 1);
    assert_eq!(runner.store().reservoir().len(), 1);
}

#[traced_test]
#[test]
fn test_unreachable_pump_exhausts_chain_then_tunes() {
    let mut runner = runner(quiet_config());
    runner.radio_mut().make_unreachable(RelayId(1));
    runner.submit(10 * SECOND, Event::ForceRead);
    runner.run_for(MINUTE);

    assert_eq!(runner.log().session_count("read_status"), 3);
    assert_eq!(runner.log().session_count("tune"), 1);
    assert_eq!(unavailable_count(&runner), 1);

    let freshness = runner.node().freshness();
    assert_eq!(freshness.stats().chains_exhausted, 1);
    assert!(!freshness.is_polling());
    assert!(runner.store().reservoir().is_empty());
}

#[test]
fn test_recovered_link_polls_again_after_exhaustion() {
    let mut runner = runner(quiet_config());
    runner.radio_mut().make_unreachable(RelayId(1));
    runner.submit(10 * SECOND, Event::ForceRead);
    runner.run_for(MINUTE);

    runner.radio_mut().restore(RelayId(1));
    runner.submit(SECOND, Event::ForceRead);
    runner.run_for(MINUTE);

    assert_eq!(runner.store().reservoir().len(), 1);
    assert!(matches!(
        runner.log().statuses.last(),
        Some((_, PumpStatus::Fresh { .. }))
    ));
}

#[test]
fn test_missing_identity_never_opens_a_session() {
    let config = SimulationConfig {
        node: NodeConfig::default(),
        ..Default::default()
    };
    let mut runner = runner(config);
    runner.submit(10 * SECOND, Event::ForceRead);
    let request = runner.request_dose(20 * SECOND, DoseKind::Bolus { units: 1.0 });
    runner.run_for(2 * MINUTE);

    assert!(runner.log().sessions.is_empty());
    assert!(unavailable_count(&runner) >= 1);
    assert!(matches!(
        runner.log().resolutions_for(request)[0],
        Err(DoseError::Configuration(ConfigurationError::MissingIdentity))
    ));
    assert!(runner.pump().commands().is_empty());
}

#[test]
fn test_heartbeat_polls_only_when_stale() {
    let config = SimulationConfig {
        radio: RadioConfig {
            heartbeat: true,
            ..Default::default()
        },
        ..quiet_config()
    };
    let mut runner = runner(config);
    runner.run_for(30 * MINUTE);

    // Heartbeats arrive every 5 minutes and data stays fresh for 6.
    let polls: Vec<_> = runner
        .log()
        .sessions
        .iter()
        .filter(|(_, label)| *label == "read_status")
        .map(|(at, _)| *at)
        .collect();
    let start = Duration::from_secs(1_700_000_000);
    assert_eq!(
        polls,
        vec![start + 5 * MINUTE, start + 15 * MINUTE, start + 25 * MINUTE]
    );
}

#[test]
fn test_periodic_timer_keeps_data_fresh() {
    let mut runner = runner(SimulationConfig::default());
    runner.run_for(10 * MINUTE);

    // The 60 s timer only polls once the 4 minute tolerance has run out.
    assert_eq!(runner.log().session_count("read_status"), 2);
    assert_eq!(runner.store().reservoir().len(), 2);
}

#[traced_test]
#[test]
fn test_skewed_pump_clock_is_corrected_before_data_is_trusted() {
    let config = SimulationConfig {
        pump: PumpConfig {
            clock_offset_secs: -600,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut runner = runner(config);
    runner.run_for(3 * MINUTE);

    let labels: Vec<_> = runner.log().sessions.iter().map(|(_, l)| *l).collect();
    assert_eq!(labels, vec!["read_status", "set_clock", "read_status"]);

    let samples = runner.store().reservoir();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].timestamp, runner.log().sessions[2].0);

    assert!(matches!(
        runner.log().statuses.first(),
        Some((_, PumpStatus::Unavailable { .. }))
    ));
    assert!(matches!(
        runner.log().statuses.last(),
        Some((_, PumpStatus::Fresh { .. }))
    ));
    assert_eq!(runner.node().clock().stats().corrections_started, 1);
}
