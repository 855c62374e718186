use pumplink_clock::ClockConfig;
use pumplink_delivery::DeliveryConfig;
use pumplink_dispatch::DispatchConfig;
use pumplink_freshness::FreshnessConfig;
use pumplink_recovery::RecoveryConfig;
use pumplink_reservoir::ReservoirConfig;
use std::time::Duration;

/// Configuration for the composed node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity of the paired pump. Without one, polls and dose requests fail.
    pub pump_id: Option<String>,
    /// Period of the freshness check timer.
    pub freshness_interval: Duration,
    pub dispatch: DispatchConfig,
    pub clock: ClockConfig,
    pub reservoir: ReservoirConfig,
    pub freshness: FreshnessConfig,
    pub delivery: DeliveryConfig,
    pub recovery: RecoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pump_id: None,
            freshness_interval: Duration::from_secs(60),
            dispatch: DispatchConfig::default(),
            clock: ClockConfig::default(),
            reservoir: ReservoirConfig::default(),
            freshness: FreshnessConfig::default(),
            delivery: DeliveryConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_pump_id(mut self, pump_id: impl Into<String>) -> Self {
        self.pump_id = Some(pump_id.into());
        self
    }

    pub fn with_freshness_interval(mut self, interval: Duration) -> Self {
        self.freshness_interval = interval;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}
