//! # Temperature Sampler
//!
//! Periodically refreshes a fixed-width temperature snapshot.
//!
//! Every channel is read concurrently with its own timeout. A channel that
//! fails only turns its own entry into `Unavailable`; the others are still
//! published in the same cycle. Channels beyond the number of discovered
//! sensors are permanently `Unavailable`, so the record width never changes.
//!
//! ## 1-Wire sysfs format
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```
//!
//! `YES` confirms the CRC; `t=` is millidegrees Celsius.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::observable::Observable;

/// 1-Wire family codes of supported thermometers (DS18S20, DS1822, DS18B20, DS1825, DS28EA00)
const W1_THERM_FAMILIES: &[&str] = &["10-", "22-", "28-", "3b-", "42-"];

/// Errors from a single channel read
#[derive(Debug, Error)]
pub enum SensorReadError {
    /// Conversion not finished or CRC check failed
    #[error("sensor not ready: {0}")]
    NotReady(String),

    /// Reading could not be parsed
    #[error("malformed reading: {0}")]
    Malformed(String),

    /// The read did not finish within the sampling tick
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One channel's value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Celsius(f64),
    Unavailable,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Celsius(value) => write!(f, "{}", value),
            Reading::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Ordered channel index to reading map, replaced wholesale every tick
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorSnapshot {
    readings: BTreeMap<usize, Reading>,
}

impl SensorSnapshot {
    /// Snapshot with `channels` entries, all `Unavailable`
    pub fn unavailable(channels: usize) -> Self {
        Self {
            readings: (0..channels).map(|i| (i, Reading::Unavailable)).collect(),
        }
    }

    pub fn set(&mut self, channel: usize, reading: Reading) {
        self.readings.insert(channel, reading);
    }

    pub fn get(&self, channel: usize) -> Reading {
        self.readings.get(&channel).copied().unwrap_or(Reading::Unavailable)
    }

}

/// Source of temperature readings
#[async_trait]
pub trait TemperatureSource: Send + Sync + 'static {
    /// Stable, ordered list of sensor ids
    async fn list_channels(&self) -> Result<Vec<String>, SensorReadError>;

    /// Read one sensor in degrees Celsius
    async fn read(&self, id: &str) -> Result<f64, SensorReadError>;
}

/// 1-Wire thermometers exposed by the `w1_therm` kernel driver
#[derive(Debug, Clone)]
pub struct W1Thermometers {
    base_dir: PathBuf,
}

impl W1Thermometers {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl TemperatureSource for W1Thermometers {
    async fn list_channels(&self) -> Result<Vec<String>, SensorReadError> {
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if W1_THERM_FAMILIES.iter().any(|family| name.starts_with(family)) {
                ids.push(name);
            }
        }

        // Sorted for stable column assignment across restarts
        ids.sort();
        Ok(ids)
    }

    async fn read(&self, id: &str) -> Result<f64, SensorReadError> {
        let path = self.base_dir.join(id).join("w1_slave");
        let contents = tokio::fs::read_to_string(&path).await?;
        parse_w1_slave(&contents)
    }
}

/// Parse the two-line `w1_slave` output into degrees Celsius
pub fn parse_w1_slave(contents: &str) -> Result<f64, SensorReadError> {
    let mut lines = contents.lines();

    let crc_line = lines
        .next()
        .ok_or_else(|| SensorReadError::Malformed("empty reading".to_string()))?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(SensorReadError::NotReady(crc_line.trim().to_string()));
    }

    let value_line = lines
        .next()
        .ok_or_else(|| SensorReadError::Malformed("missing temperature line".to_string()))?;
    let (_, millis) = value_line
        .rsplit_once("t=")
        .ok_or_else(|| SensorReadError::Malformed(value_line.trim().to_string()))?;
    let millis: i32 = millis
        .trim()
        .parse()
        .map_err(|_| SensorReadError::Malformed(value_line.trim().to_string()))?;

    Ok(f64::from(millis) / 1000.0)
}

/// Periodic task refreshing the temperature snapshot
pub struct SensorSampler<S> {
    source: Arc<S>,
    channels: usize,
    interval: Duration,
    ids: Vec<String>,
    failing: Vec<bool>,
    snapshot: Observable<SensorSnapshot>,
}

impl<S: TemperatureSource> SensorSampler<S> {
    /// # Arguments
    ///
    /// * `source` - Temperature source
    /// * `channels` - Fixed number of temperature columns
    /// * `interval` - Sampling cadence; also the per-read timeout
    /// * `snapshot` - Cell the sampler publishes into
    pub fn new(
        source: Arc<S>,
        channels: usize,
        interval: Duration,
        snapshot: Observable<SensorSnapshot>,
    ) -> Self {
        Self {
            source,
            channels,
            interval,
            ids: Vec::new(),
            failing: vec![false; channels],
            snapshot,
        }
    }

    /// Discover sensors; channels without a sensor stay `Unavailable`
    pub async fn discover(&mut self) {
        match self.source.list_channels().await {
            Ok(mut ids) => {
                if ids.len() > self.channels {
                    warn!(
                        "Found {} temperature sensors, logging the first {}",
                        ids.len(),
                        self.channels
                    );
                    ids.truncate(self.channels);
                }
                info!("Discovered {} temperature sensor(s): {:?}", ids.len(), ids);
                self.ids = ids;
            }
            Err(e) => {
                warn!("Temperature sensor discovery failed: {}", e);
                self.ids.clear();
            }
        }
    }

    /// Read every channel once and publish the full snapshot
    pub async fn sample_once(&mut self) -> SensorSnapshot {
        let mut reads = JoinSet::new();
        for (index, id) in self.ids.iter().enumerate() {
            let source = Arc::clone(&self.source);
            let id = id.clone();
            let limit = self.interval;
            reads.spawn(async move {
                let result = match tokio::time::timeout(limit, source.read(&id)).await {
                    Ok(result) => result,
                    Err(_) => Err(SensorReadError::Timeout(limit)),
                };
                (index, result)
            });
        }

        let mut snapshot = SensorSnapshot::unavailable(self.channels);
        while let Some(joined) = reads.join_next().await {
            let Ok((index, result)) = joined else {
                continue;
            };
            match result {
                Ok(celsius) => {
                    if self.failing[index] {
                        info!("Temperature channel {} recovered", index + 1);
                        self.failing[index] = false;
                    }
                    snapshot.set(index, Reading::Celsius(celsius));
                }
                Err(e) => {
                    if !self.failing[index] {
                        warn!("Temperature channel {} ({}) unavailable: {}", index + 1, self.ids[index], e);
                        self.failing[index] = true;
                    }
                }
            }
        }

        self.snapshot.publish(snapshot.clone());
        snapshot
    }

    /// Sample until `stop` is cancelled
    pub async fn run(mut self, stop: CancellationToken) {
        self.discover().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.sample_once().await;
                    debug!("Temperature snapshot: {:?}", snapshot);
                }
            }
        }
        debug!("Temperature sampler stopped");
    }
}
