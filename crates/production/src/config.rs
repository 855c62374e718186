//! Engine configuration file.
//!
//! Every field has a default, so an empty file is a valid configuration
//! (apart from the pump identity, without which nothing reaches the pump).
//!
//! ```toml
//! pump_id = "pump-1234"
//!
//! [freshness]
//! check_interval_secs = 60
//! max_poll_attempts = 3
//!
//! [reservoir]
//! low_thresholds = [30, 20, 10]
//! chemistry = "lithium"
//! ```

use pumplink_clock::ClockConfig;
use pumplink_delivery::DeliveryConfig;
use pumplink_dispatch::DispatchConfig;
use pumplink_freshness::FreshnessConfig;
use pumplink_node::NodeConfig;
use pumplink_recovery::RecoveryConfig;
use pumplink_reservoir::{BatteryChemistry, ReservoirConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub pump_id: Option<String>,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub clock: ClockSection,
    #[serde(default)]
    pub freshness: FreshnessSection,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub reservoir: ReservoirSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSection {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How often the relay inventory is re-read from the transport.
    #[serde(default = "default_relay_refresh_secs")]
    pub relay_refresh_secs: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            relay_refresh_secs: default_relay_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockSection {
    #[serde(default = "default_max_skew_secs")]
    pub max_skew_secs: u64,
}

impl Default for ClockSection {
    fn default() -> Self {
        Self {
            max_skew_secs: default_max_skew_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreshnessSection {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_stale_without_heartbeat_secs")]
    pub stale_without_heartbeat_secs: u64,
    #[serde(default = "default_stale_with_heartbeat_secs")]
    pub stale_with_heartbeat_secs: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

impl Default for FreshnessSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            stale_without_heartbeat_secs: default_stale_without_heartbeat_secs(),
            stale_with_heartbeat_secs: default_stale_with_heartbeat_secs(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliverySection {
    #[serde(default = "default_max_delivery_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reservoir_recency_secs")]
    pub reservoir_recency_secs: u64,
    #[serde(default = "default_recheck_delay_secs")]
    pub recheck_delay_secs: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_delivery_attempts(),
            reservoir_recency_secs: default_reservoir_recency_secs(),
            recheck_delay_secs: default_recheck_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservoirSection {
    #[serde(default = "default_low_thresholds")]
    pub low_thresholds: Vec<u32>,
    #[serde(default)]
    pub chemistry: BatteryChemistry,
}

impl Default for ReservoirSection {
    fn default() -> Self {
        Self {
            low_thresholds: default_low_thresholds(),
            chemistry: BatteryChemistry::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoverySection {
    #[serde(default = "default_silence_threshold_secs")]
    pub silence_threshold_secs: u64,
    #[serde(default = "default_reset_interval_secs")]
    pub reset_interval_secs: u64,
    #[serde(default = "default_power_off_secs")]
    pub power_off_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            silence_threshold_secs: default_silence_threshold_secs(),
            reset_interval_secs: default_reset_interval_secs(),
            power_off_secs: default_power_off_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchSection {
    #[serde(default = "default_tuning_max_age_secs")]
    pub tuning_max_age_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            tuning_max_age_secs: default_tuning_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// Used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    #[serde(default)]
    pub thread_ids: bool,
}

fn default_channel_capacity() -> usize {
    1024
}
fn default_relay_refresh_secs() -> u64 {
    60
}
fn default_max_skew_secs() -> u64 {
    60
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_stale_without_heartbeat_secs() -> u64 {
    4 * 60
}
fn default_stale_with_heartbeat_secs() -> u64 {
    6 * 60
}
fn default_max_poll_attempts() -> u32 {
    3
}
fn default_max_delivery_attempts() -> u32 {
    5
}
fn default_reservoir_recency_secs() -> u64 {
    5 * 60
}
fn default_recheck_delay_secs() -> u64 {
    30
}
fn default_low_thresholds() -> Vec<u32> {
    vec![30, 20, 10]
}
fn default_silence_threshold_secs() -> u64 {
    30 * 60
}
fn default_reset_interval_secs() -> u64 {
    30 * 60
}
fn default_power_off_secs() -> u64 {
    5
}
fn default_tuning_max_age_secs() -> u64 {
    24 * 60
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pump_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ConfigError::Invalid("pump_id must not be blank".into()));
        }
        if self.freshness.check_interval_secs == 0 || self.recovery.check_interval_secs == 0 {
            return Err(ConfigError::Invalid("timer intervals must be positive".into()));
        }
        if self.runner.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be positive".into()));
        }
        if self.reservoir.low_thresholds.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one low reservoir threshold is required".into(),
            ));
        }
        Ok(())
    }

    /// The node configuration this file describes.
    pub fn node_config(&self) -> NodeConfig {
        let secs = Duration::from_secs;

        let mut freshness = FreshnessConfig::default()
            .with_max_poll_attempts(self.freshness.max_poll_attempts);
        freshness.stale_without_heartbeat = secs(self.freshness.stale_without_heartbeat_secs);
        freshness.stale_with_heartbeat = secs(self.freshness.stale_with_heartbeat_secs);

        let mut delivery = DeliveryConfig::default().with_max_attempts(self.delivery.max_attempts);
        delivery.reservoir_recency = secs(self.delivery.reservoir_recency_secs);
        delivery.recheck_delay = secs(self.delivery.recheck_delay_secs);

        let recovery = RecoveryConfig {
            silence_threshold: secs(self.recovery.silence_threshold_secs),
            reset_interval: secs(self.recovery.reset_interval_secs),
            power_off_duration: secs(self.recovery.power_off_secs),
            check_interval: secs(self.recovery.check_interval_secs),
        };

        NodeConfig {
            pump_id: self.pump_id.clone(),
            dispatch: DispatchConfig::default()
                .with_tuning_max_age(secs(self.dispatch.tuning_max_age_secs)),
            clock: ClockConfig::default().with_max_skew(secs(self.clock.max_skew_secs)),
            reservoir: ReservoirConfig::default()
                .with_chemistry(self.reservoir.chemistry)
                .with_low_thresholds(self.reservoir.low_thresholds.clone()),
            freshness,
            ..NodeConfig::default()
        }
        .with_freshness_interval(secs(self.freshness.check_interval_secs))
        .with_delivery(delivery)
        .with_recovery(recovery)
    }
}

impl std::str::FromStr for EngineConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: EngineConfig = "".parse().unwrap();
        let node = config.node_config();
        let defaults = NodeConfig::default();

        assert!(node.pump_id.is_none());
        assert_eq!(node.freshness_interval, defaults.freshness_interval);
        assert_eq!(node.clock.max_skew, defaults.clock.max_skew);
        assert_eq!(node.delivery.max_attempts, 5);
        assert_eq!(node.freshness.max_poll_attempts, 3);
        assert_eq!(node.reservoir.low_thresholds, vec![30, 20, 10]);
        assert_eq!(node.recovery.silence_threshold, Duration::from_secs(1800));
        assert_eq!(node.dispatch.tuning_max_age, Duration::from_secs(1440));
    }

    #[test]
    fn test_sections_override_defaults() {
        let text = r#"
            pump_id = "pump-1234"

            [freshness]
            check_interval_secs = 30
            max_poll_attempts = 2

            [delivery]
            recheck_delay_secs = 45

            [reservoir]
            low_thresholds = [50, 25]
            chemistry = "lithium"

            [recovery]
            power_off_secs = 10
        "#;
        let config: EngineConfig = text.parse().unwrap();
        let node = config.node_config();

        assert_eq!(node.pump_id.as_deref(), Some("pump-1234"));
        assert_eq!(node.freshness_interval, Duration::from_secs(30));
        assert_eq!(node.freshness.max_poll_attempts, 2);
        assert_eq!(node.delivery.recheck_delay, Duration::from_secs(45));
        assert_eq!(node.delivery.max_attempts, 5);
        assert_eq!(node.reservoir.chemistry, BatteryChemistry::Lithium);
        assert_eq!(node.recovery.power_off_duration, Duration::from_secs(10));
        assert_eq!(node.recovery.reset_interval, Duration::from_secs(1800));
    }

    #[test]
    fn test_rejects_unknown_and_invalid_fields() {
        assert!(matches!(
            "[freshness]\nbogus = 1".parse::<EngineConfig>(),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            "pump_id = \"  \"".parse::<EngineConfig>(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            "[reservoir]\nlow_thresholds = []".parse::<EngineConfig>(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
