//! # Capture Log Module
//!
//! Writes the enriched event stream to rotated CSV files.
//!
//! This module handles:
//! - Rendering one CSV row per event with the sensor and power context
//! - Writing to a temporary `.part` file with a buffered writer
//! - Rotating on elapsed time, size, or record count
//! - Finalizing files durably (flush, fsync, atomic rename) before queueing them
//! - Recovering files left behind by an earlier run

pub mod record;
pub mod rotator;
