//! # Power Rail Monitor
//!
//! Polls a boolean rail reading and publishes it together with the time of
//! its last transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::observable::Observable;

/// Rail state in effect, replaced wholesale on every poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerState {
    pub up: bool,
    /// Time of the last transition (or of the first reading)
    pub since: DateTime<Utc>,
}

impl PowerState {
    pub fn up_at(since: DateTime<Utc>) -> Self {
        Self { up: true, since }
    }
}

/// Source of the rail reading
#[async_trait]
pub trait PowerSensor: Send + Sync + 'static {
    async fn read_rail(&self) -> Result<bool>;
}

/// GPIO input exported through sysfs (`/sys/class/gpio/gpioN/value`)
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    value_path: PathBuf,
    active_low: bool,
}

impl SysfsGpio {
    pub fn new(value_path: impl Into<PathBuf>, active_low: bool) -> Self {
        Self {
            value_path: value_path.into(),
            active_low,
        }
    }
}

#[async_trait]
impl PowerSensor for SysfsGpio {
    async fn read_rail(&self) -> Result<bool> {
        let raw = tokio::fs::read_to_string(&self.value_path)
            .await
            .map_err(|e| CaptureError::filesystem(&self.value_path, e))?;
        let level = match raw.trim() {
            "1" => true,
            "0" => false,
            other => {
                return Err(CaptureError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected GPIO value '{}'", other),
                )))
            }
        };
        Ok(level != self.active_low)
    }
}

/// Rail that is always up, for deployments without a power input
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOn;

#[async_trait]
impl PowerSensor for AlwaysOn {
    async fn read_rail(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Periodic task refreshing the power state
pub struct PowerMonitor<P> {
    sensor: P,
    interval: Duration,
    state: Observable<PowerState>,
}

impl<P: PowerSensor> PowerMonitor<P> {
    pub fn new(sensor: P, interval: Duration, state: Observable<PowerState>) -> Self {
        Self {
            sensor,
            interval,
            state,
        }
    }

    /// Read the rail once and publish
    ///
    /// A failed read keeps the previous state.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> PowerState {
        let previous = self.state.latest();

        let up = match self.sensor.read_rail().await {
            Ok(up) => up,
            Err(e) => {
                warn!("Power rail read failed, keeping last state: {}", e);
                return previous;
            }
        };

        if up == previous.up {
            return previous;
        }

        if up {
            info!("Power rail restored");
        } else {
            warn!("Power rail lost");
        }
        let next = PowerState { up, since: now };
        self.state.publish(next);
        next
    }

    /// Poll until `stop` is cancelled
    pub async fn run(self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once(Utc::now()).await;
                }
            }
        }
        debug!("Power monitor stopped");
    }
}
