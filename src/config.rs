//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use chrono::FixedOffset;
use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::logger::rotator::RotationPolicy;

/// Environment variable that overrides `upload.token`
pub const UPLOAD_TOKEN_ENV: &str = "CANLOG_UPLOAD_TOKEN";

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub source: SourceConfig,
    pub output: OutputConfig,
    pub rotation: RotationConfig,
    pub sensors: SensorConfig,
    pub power: PowerConfig,
    pub upload: UploadConfig,
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bus source configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_program")]
    pub program: String,

    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
}

/// Capture file output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_file_name")]
    pub name: String,

    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,

    #[serde(default = "default_flush_every_records")]
    pub flush_every_records: usize,
}

/// Which rotation threshold is in effect
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationKind {
    Time,
    Size,
    Records,
}

/// File rotation configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RotationConfig {
    #[serde(default = "default_rotation_policy")]
    pub policy: RotationKind,

    #[serde(default = "default_rotation_interval_s")]
    pub interval_s: u64,

    #[serde(default = "default_rotation_max_bytes")]
    pub max_bytes: u64,

    #[serde(default = "default_rotation_max_records")]
    pub max_records: u64,
}

/// Temperature sampler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default = "default_w1_dir")]
    pub w1_dir: PathBuf,

    #[serde(default = "default_sensor_channels")]
    pub channels: usize,

    #[serde(default = "default_sensor_interval_ms")]
    pub interval_ms: u64,
}

/// Power rail monitor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PowerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_gpio_value_path")]
    pub gpio_value_path: PathBuf,

    #[serde(default)]
    pub active_low: bool,

    #[serde(default = "default_power_interval_ms")]
    pub interval_ms: u64,
}

/// Upload scheduler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_upload_enabled")]
    pub enabled: bool,

    #[serde(default = "default_check_interval_s")]
    pub check_interval_s: u64,

    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_probe_host")]
    pub probe_host: String,

    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_final_drain_timeout_s")]
    pub final_drain_timeout_s: u64,
}

/// Shutdown supervisor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_loss_threshold_s")]
    pub loss_threshold_s: u64,
}

/// Diagnostic logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default value functions
fn default_channel() -> String { "can0".to_string() }
fn default_program() -> String { "candump".to_string() }
fn default_receive_timeout_ms() -> u64 { 1000 }

fn default_output_dir() -> PathBuf { PathBuf::from("./logs") }
fn default_file_name() -> String { "can_log".to_string() }
fn default_utc_offset() -> String { "+00:00".to_string() }
fn default_flush_every_records() -> usize { 1 }

fn default_rotation_policy() -> RotationKind { RotationKind::Time }
fn default_rotation_interval_s() -> u64 { 600 }
fn default_rotation_max_bytes() -> u64 { 10 * 1024 * 1024 }
fn default_rotation_max_records() -> u64 { 100_000 }

fn default_w1_dir() -> PathBuf { PathBuf::from("/sys/bus/w1/devices") }
fn default_sensor_channels() -> usize { 6 }
fn default_sensor_interval_ms() -> u64 { 2000 }

fn default_gpio_value_path() -> PathBuf { PathBuf::from("/sys/class/gpio/gpio17/value") }
fn default_power_interval_ms() -> u64 { 1000 }

fn default_upload_enabled() -> bool { true }
fn default_check_interval_s() -> u64 { 60 }
fn default_remote_dir() -> String { "/".to_string() }
fn default_probe_host() -> String { "content.dropboxapi.com".to_string() }
fn default_probe_port() -> u16 { 443 }
fn default_probe_timeout_ms() -> u64 { 5000 }
fn default_final_drain_timeout_s() -> u64 { 30 }

fn default_loss_threshold_s() -> u64 { 300 }

fn default_log_level() -> String { "info".to_string() }

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            program: default_program(),
            receive_timeout_ms: default_receive_timeout_ms(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            name: default_file_name(),
            utc_offset: default_utc_offset(),
            flush_every_records: default_flush_every_records(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            policy: default_rotation_policy(),
            interval_s: default_rotation_interval_s(),
            max_bytes: default_rotation_max_bytes(),
            max_records: default_rotation_max_records(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            w1_dir: default_w1_dir(),
            channels: default_sensor_channels(),
            interval_ms: default_sensor_interval_ms(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gpio_value_path: default_gpio_value_path(),
            active_low: false,
            interval_ms: default_power_interval_ms(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: default_upload_enabled(),
            check_interval_s: default_check_interval_s(),
            remote_dir: default_remote_dir(),
            token: None,
            probe_host: default_probe_host(),
            probe_port: default_probe_port(),
            probe_timeout_ms: default_probe_timeout_ms(),
            final_drain_timeout_s: default_final_drain_timeout_s(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            loss_threshold_s: default_loss_threshold_s(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

fn invalid(msg: impl std::fmt::Display) -> CaptureError {
    CaptureError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use canlog_agent::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        if let Ok(token) = std::env::var(UPLOAD_TOKEN_ENV) {
            if !token.is_empty() {
                config.upload.token = Some(token);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.source.channel.is_empty() {
            return Err(invalid("source channel cannot be empty"));
        }

        if self.source.program.is_empty() {
            return Err(invalid("source program cannot be empty"));
        }

        if self.source.receive_timeout_ms == 0 || self.source.receive_timeout_ms > 10000 {
            return Err(invalid("receive_timeout_ms must be between 1 and 10000"));
        }

        if self.output.dir.as_os_str().is_empty() {
            return Err(invalid("output dir cannot be empty"));
        }

        if self.output.name.is_empty() || self.output.name.contains(['/', '\\']) {
            return Err(invalid("output name must be a non-empty file name prefix"));
        }

        self.utc_offset()?;

        if self.output.flush_every_records == 0 {
            return Err(invalid("flush_every_records must be greater than 0"));
        }

        match self.rotation.policy {
            RotationKind::Time if self.rotation.interval_s == 0 => {
                return Err(invalid("rotation interval_s must be greater than 0"));
            }
            RotationKind::Size if self.rotation.max_bytes == 0 => {
                return Err(invalid("rotation max_bytes must be greater than 0"));
            }
            RotationKind::Records if self.rotation.max_records == 0 => {
                return Err(invalid("rotation max_records must be greater than 0"));
            }
            _ => {}
        }

        if self.sensors.channels == 0 || self.sensors.channels > 32 {
            return Err(invalid("sensor channels must be between 1 and 32"));
        }

        if self.sensors.interval_ms == 0 || self.sensors.interval_ms > 60000 {
            return Err(invalid("sensor interval_ms must be between 1 and 60000"));
        }

        if self.power.interval_ms == 0 || self.power.interval_ms > 60000 {
            return Err(invalid("power interval_ms must be between 1 and 60000"));
        }

        if self.power.enabled && self.power.gpio_value_path.as_os_str().is_empty() {
            return Err(invalid("power gpio_value_path cannot be empty when enabled"));
        }

        if self.upload.check_interval_s == 0 {
            return Err(invalid("upload check_interval_s must be greater than 0"));
        }

        if self.upload.enabled && self.upload.probe_host.is_empty() {
            return Err(invalid("upload probe_host cannot be empty when enabled"));
        }

        if self.upload.probe_timeout_ms == 0 || self.upload.probe_timeout_ms > 60000 {
            return Err(invalid("probe_timeout_ms must be between 1 and 60000"));
        }

        if !self.upload.remote_dir.starts_with('/') {
            return Err(invalid("upload remote_dir must start with '/'"));
        }

        if self.shutdown.loss_threshold_s == 0 {
            return Err(invalid("shutdown loss_threshold_s must be greater than 0"));
        }

        Ok(())
    }

    /// Parsed timezone offset used for record timestamps
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        self.output
            .utc_offset
            .parse::<FixedOffset>()
            .map_err(|e| invalid(format!("invalid utc_offset '{}': {}", self.output.utc_offset, e)))
    }

    /// Rotation policy selected by `rotation.policy`
    pub fn rotation_policy(&self) -> RotationPolicy {
        match self.rotation.policy {
            RotationKind::Time => RotationPolicy::Elapsed(Duration::from_secs(self.rotation.interval_s)),
            RotationKind::Size => RotationPolicy::Bytes(self.rotation.max_bytes),
            RotationKind::Records => RotationPolicy::Records(self.rotation.max_records),
        }
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.source.receive_timeout_ms)
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sensors.interval_ms)
    }

    pub fn power_interval(&self) -> Duration {
        Duration::from_millis(self.power.interval_ms)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload.check_interval_s)
    }

    pub fn loss_threshold(&self) -> Duration {
        Duration::from_secs(self.shutdown.loss_threshold_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_config() -> Config {
        Config::default()
    }

    #[test]
    fn test_default_config() {
        assert!(create_valid_config().validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[source]
channel = "can1"

[output]
dir = "/tmp/canlog"
utc_offset = "+03:00"

[rotation]
policy = "size"
max_bytes = 4096

[sensors]

[power]

[upload]
remote_dir = "/truck-7/"

[shutdown]
loss_threshold_s = 120
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.source.channel, "can1");
        assert_eq!(config.rotation_policy(), RotationPolicy::Bytes(4096));
        assert_eq!(config.utc_offset().unwrap(), FixedOffset::east_opt(3 * 3600).unwrap());
        assert_eq!(config.loss_threshold(), Duration::from_secs(120));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_section_is_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("[source]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_rotation_policy_is_rejected() {
        let toml_content = r#"
[source]
[output]
[rotation]
policy = "weekly"
[sensors]
[power]
[upload]
[shutdown]
"#;
        let result: std::result::Result<Config, _> = toml::from_str(toml_content);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_channel() {
        let mut config = create_valid_config();
        config.source.channel = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_receive_timeout_zero() {
        let mut config = create_valid_config();
        config.source.receive_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_receive_timeout_too_high() {
        let mut config = create_valid_config();
        config.source.receive_timeout_ms = 10001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_name_with_separator() {
        let mut config = create_valid_config();
        config.output.name = "logs/can".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_utc_offset() {
        let mut config = create_valid_config();
        config.output.utc_offset = "Europe/Kyiv".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flush_every_records_zero() {
        let mut config = create_valid_config();
        config.output.flush_every_records = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_only_selected_rotation_threshold_is_checked() {
        let mut config = create_valid_config();
        config.rotation.policy = RotationKind::Records;
        config.rotation.max_records = 1;
        config.rotation.interval_s = 0;
        config.rotation.max_bytes = 0;
        assert!(config.validate().is_ok());
        assert_eq!(config.rotation_policy(), RotationPolicy::Records(1));

        config.rotation.policy = RotationKind::Time;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sensor_channels_out_of_range() {
        let mut config = create_valid_config();
        config.sensors.channels = 0;
        assert!(config.validate().is_err());
        config.sensors.channels = 33;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_dir_must_be_absolute() {
        let mut config = create_valid_config();
        config.upload.remote_dir = "logs".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loss_threshold_zero() {
        let mut config = create_valid_config();
        config.shutdown.loss_threshold_s = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_channel(), "can0");
        assert_eq!(default_program(), "candump");
        assert_eq!(default_file_name(), "can_log");
        assert_eq!(default_sensor_channels(), 6);
        assert_eq!(default_sensor_interval_ms(), 2000);
        assert_eq!(default_power_interval_ms(), 1000);
        assert_eq!(default_check_interval_s(), 60);
        assert_eq!(default_rotation_policy(), RotationKind::Time);
        assert!(default_upload_enabled());
    }
}
