//! Logging initialisation.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Invalid log filter {filter:?}: {source}")]
    Filter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },
}

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,pumplink=debug";

/// Configuration for logging.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset. Defaults to [`DEFAULT_FILTER`].
    pub filter: Option<String>,
    /// Include thread ids in each line.
    pub thread_ids: bool,
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured filter. Fails if a subscriber is
/// already installed or the configured filter does not parse.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directive = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
            EnvFilter::try_new(directive).map_err(|source| TelemetryError::Filter {
                filter: directive.to_string(),
                source,
            })?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(config.thread_ids);

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
