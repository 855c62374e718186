//! Pump link engine
//!
//! Runs the engine against the loopback transport: a simulated pump behind
//! one in-process relay. Useful on a bench to exercise timers, polling and
//! dose delivery in real time.
//!
//! # Example
//!
//! ```bash
//! # Defaults, with a config file
//! pumplink-engine --config engine.toml
//!
//! # Deliver one bolus shortly after start, then keep polling
//! pumplink-engine --pump-id bench --bolus 1.5
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use pumplink_production::{
    init_logging, metrics, EngineConfig, LoggingConfig, LoopbackTransport, ProductionRunner,
};
use pumplink_simulation::PumpConfig;
use pumplink_types::DoseKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pumplink-engine")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pump identity, overriding the config file
    #[arg(long)]
    pump_id: Option<String>,

    /// Starting reservoir volume of the loopback pump, in units
    #[arg(long, default_value = "150.0")]
    reservoir: f64,

    /// Loopback pump clock offset from local time, in seconds
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    clock_offset: i64,

    /// Simulated radio session duration, in milliseconds
    #[arg(long, default_value = "500")]
    session_ms: u64,

    /// Request one bolus of this many units after start
    #[arg(long)]
    bolus: Option<f64>,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    dump_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(pump_id) = args.pump_id.clone() {
        config.pump_id = Some(pump_id);
    }

    init_logging(&LoggingConfig {
        filter: config.logging.filter.clone(),
        thread_ids: config.logging.thread_ids,
    })
    .context("initialising logging")?;

    let transport = Arc::new(
        LoopbackTransport::new(PumpConfig {
            reservoir_units: args.reservoir,
            clock_offset_secs: args.clock_offset,
            ..Default::default()
        })
        .with_session_delay(Duration::from_millis(args.session_ms)),
    );

    let mut runner = ProductionRunner::builder()
        .transport(transport)
        .node_config(config.node_config())
        .channel_capacity(config.runner.channel_capacity)
        .relay_refresh(Duration::from_secs(config.runner.relay_refresh_secs))
        .build()
        .context("building runner")?;
    let engine = runner.handle();
    let shutdown = runner.shutdown_handle().context("shutdown handle taken")?;
    let runner_task = tokio::spawn(runner.run());

    if let Some(units) = args.bolus {
        let engine = engine.clone();
        tokio::spawn(async move {
            match engine.request_dose(DoseKind::Bolus { units }).await {
                Ok(record) => info!(
                    dose = %record.id,
                    units,
                    attempts = record.attempts,
                    "Bolus confirmed"
                ),
                Err(e) => error!(error = %e, units, "Bolus failed"),
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Interrupted, shutting down");
    shutdown.shutdown();
    runner_task
        .await
        .context("runner task panicked")?
        .context("runner failed")?;

    if args.dump_metrics {
        println!("{}", metrics::gather_text().context("encoding metrics")?);
    }
    Ok(())
}
