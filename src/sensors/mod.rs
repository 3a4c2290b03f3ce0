//! # Sensors Module
//!
//! Out-of-band readings that enrich every log record.
//!
//! This module handles:
//! - Multi-channel temperature sampling (1-Wire thermometers via sysfs)
//! - Power rail monitoring (GPIO value via sysfs)
//! - Publishing both as `Observable` snapshots on their own cadence

pub mod temperature;
pub mod power;
