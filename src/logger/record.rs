//! # Log Record Format
//!
//! CSV row layout: `Timestamp,ID,Ext,RTR,Dir,Bus,Len,Data,Temperature_1..N,Power`.
//!
//! - Timestamp: ISO-8601 in the configured fixed offset, microsecond precision
//! - ID: hexadecimal with `0x` prefix
//! - Dir: the error-frame flag
//! - Data: space-separated upper-case byte pairs
//! - Temperature_N: degrees Celsius or `Unavailable`

use chrono::FixedOffset;
use std::fmt::Write;

use crate::can::frame::Event;
use crate::sensors::power::PowerState;
use crate::sensors::temperature::SensorSnapshot;

/// Columns preceding the temperature block
const EVENT_COLUMNS: &[&str] = &["Timestamp", "ID", "Ext", "RTR", "Dir", "Bus", "Len", "Data"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

/// Header row (without line terminator) for `channels` temperature columns
pub fn header(channels: usize) -> String {
    let mut line = EVENT_COLUMNS.join(",");
    for channel in 1..=channels {
        let _ = write!(line, ",Temperature_{}", channel);
    }
    line.push_str(",Power");
    line
}

/// Number of columns every row has
pub fn column_count(channels: usize) -> usize {
    EVENT_COLUMNS.len() + channels + 1
}

/// Payload as `DE AD BE EF`
pub fn format_payload(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// One event with the sensor and power context in effect when it was written
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    pub event: &'a Event,
    pub sensors: &'a SensorSnapshot,
    pub power: PowerState,
}

impl<'a> LogRecord<'a> {
    pub fn new(event: &'a Event, sensors: &'a SensorSnapshot, power: PowerState) -> Self {
        Self {
            event,
            sensors,
            power,
        }
    }

    /// Render the row (without line terminator)
    ///
    /// Always emits exactly `channels` temperature columns; snapshot entries
    /// outside `0..channels` are ignored and missing ones read `Unavailable`.
    pub fn render(&self, offset: &FixedOffset, channels: usize) -> String {
        let event = self.event;
        let mut line = String::with_capacity(96 + channels * 8);

        let _ = write!(
            line,
            "{},{:#x},{},{},{},{},{},{}",
            event.timestamp.with_timezone(offset).format(TIMESTAMP_FORMAT),
            event.id,
            event.extended,
            event.remote,
            event.error,
            event.channel,
            event.dlc,
            format_payload(&event.data),
        );

        for channel in 0..channels {
            let _ = write!(line, ",{}", self.sensors.get(channel));
        }

        let _ = write!(line, ",{}", self.power.up);
        line
    }
}
