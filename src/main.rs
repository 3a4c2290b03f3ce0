//! # CAN Log Agent
//!
//! Captures a CAN bus into rotated CSV files and uploads them when online.
//!
//! # Usage
//!
//! ```bash
//! canlog-agent [config.toml]
//! ```
//!
//! Without an argument `config/default.toml` is loaded. `RUST_LOG` overrides
//! `logging.level`, and `CANLOG_UPLOAD_TOKEN` overrides `upload.token`.
//!
//! # Exit
//!
//! - Ctrl+C: finalize, final upload attempt, exit 0
//! - bus silent and power lost past `shutdown.loss_threshold_s`: same, exit 0
//! - unrecoverable bus or filesystem error: same cleanup, exit non-zero

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use canlog_agent::agent::{CaptureAgent, ExitReason};
use canlog_agent::can::transport::CandumpTransport;
use canlog_agent::config::Config;
use canlog_agent::sensors::power::{AlwaysOn, PowerSensor, SysfsGpio};
use canlog_agent::sensors::temperature::W1Thermometers;
use canlog_agent::upload::uploader::{DropboxUploader, OfflineUploader, TcpProbe, Uploader};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&path).with_context(|| format!("loading configuration from {}", path))?;

    let _guard = init_logging(&config)?;
    info!("CAN Log Agent v{} starting with {}", env!("CARGO_PKG_VERSION"), path);

    let token = config.upload.token.clone().filter(|t| !t.is_empty());
    match token {
        Some(token) if config.upload.enabled => {
            let probe = TcpProbe::new(
                config.upload.probe_host.clone(),
                config.upload.probe_port,
                Duration::from_millis(config.upload.probe_timeout_ms),
            );
            with_power_sensor(config, Arc::new(DropboxUploader::new(token, probe))).await
        }
        _ => {
            if config.upload.enabled {
                warn!("No upload token configured, capture files stay local");
            }
            with_power_sensor(config, Arc::new(OfflineUploader)).await
        }
    }
}

/// Stderr output plus an optional daily-rolled file
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid logging.level")?;

    let (file_layer, guard) = match &config.logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "canlog-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn with_power_sensor<U: Uploader>(config: Config, uploader: Arc<U>) -> Result<()> {
    if config.power.enabled {
        let gpio = SysfsGpio::new(config.power.gpio_value_path.clone(), config.power.active_low);
        capture(config, uploader, gpio).await
    } else {
        info!("Power monitoring disabled, rail assumed up");
        capture(config, uploader, AlwaysOn).await
    }
}

async fn capture<U: Uploader, P: PowerSensor>(config: Config, uploader: Arc<U>, power: P) -> Result<()> {
    let transport = CandumpTransport::new(config.source.program.clone());
    let thermometers = Arc::new(W1Thermometers::new(config.sensors.w1_dir.clone()));

    let mut agent = CaptureAgent::new(config, transport, uploader)?;
    agent.start(thermometers, power);

    let stop = agent.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            stop.cancel();
        }
    });

    match agent.run().await? {
        ExitReason::Interrupted => info!("Stopped on request"),
        ExitReason::SourceAndPowerLost => info!("Vehicle switched off, stopped"),
    }
    Ok(())
}
