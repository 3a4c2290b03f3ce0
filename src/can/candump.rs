//! # candump Log Line Parser
//!
//! Parses the compact log format written by `candump -L`:
//!
//! ```text
//! (1436509052.249713) can0 123#DEADBEEF        classic, 11-bit
//! (1436509052.249713) can0 12345678#0102       classic, 29-bit
//! (1436509052.249713) can0 123#R               remote, dlc 0
//! (1436509052.249713) can0 123#R4              remote, dlc 4
//! (1436509052.249713) can0 20000004#0004000000000000   error frame
//! (1436509052.249713) can0 123##1DEADBEEF      FD, flags nibble then data
//! ```
//!
//! Identifiers with three hex digits are standard, eight hex digits are
//! extended. An eight-digit identifier with `CAN_ERR_FLAG` set is an error
//! frame.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::frame::{Event, CAN_EFF_MASK, CAN_ERR_FLAG};
use crate::error::{CaptureError, Result};

fn frame_err(line: &str, reason: &str) -> CaptureError {
    CaptureError::Frame(format!("{}: '{}'", reason, line))
}

/// Parse one `candump -L` line into an `Event`
///
/// # Errors
///
/// Returns `CaptureError::Frame` when the line is not in candump log format
/// or describes a frame outside the CAN limits
///
/// # Examples
///
/// ```
/// use canlog_agent::can::candump::parse_line;
///
/// let event = parse_line("(1436509052.249713) can0 123#DEADBEEF")?;
/// assert_eq!(event.id, 0x123);
/// assert_eq!(event.dlc, 4);
/// # Ok::<(), canlog_agent::error::CaptureError>(())
/// ```
pub fn parse_line(line: &str) -> Result<Event> {
    let line = line.trim();
    let mut fields = line.split_whitespace();

    let (Some(stamp), Some(channel), Some(frame), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(frame_err(line, "expected '(timestamp) interface frame'"));
    };

    let timestamp = parse_timestamp(stamp).ok_or_else(|| frame_err(line, "invalid timestamp"))?;

    let (id_text, body) = frame
        .split_once('#')
        .ok_or_else(|| frame_err(line, "missing '#' separator"))?;

    let raw_id = u32::from_str_radix(id_text, 16).map_err(|_| frame_err(line, "invalid identifier"))?;
    let (id, extended, error) = match id_text.len() {
        3 => (raw_id, false, false),
        8 if raw_id & CAN_ERR_FLAG != 0 => (raw_id & CAN_EFF_MASK, false, true),
        8 => (raw_id & CAN_EFF_MASK, true, false),
        _ => return Err(frame_err(line, "identifier must have 3 or 8 hex digits")),
    };

    let mut remote = false;
    let mut fd = false;
    let mut dlc: Option<u8> = None;

    let data_text = if let Some(fd_body) = body.strip_prefix('#') {
        // First nibble carries the FD flags (BRS/ESI); they are not logged.
        fd = true;
        let mut chars = fd_body.chars();
        match chars.next() {
            Some(c) if c.is_ascii_hexdigit() => chars.as_str(),
            _ => return Err(frame_err(line, "missing FD flags")),
        }
    } else if let Some(rtr) = body.strip_prefix(['R', 'r']) {
        remote = true;
        if !rtr.is_empty() {
            let len = rtr.parse::<u8>().map_err(|_| frame_err(line, "invalid remote dlc"))?;
            if len > 8 {
                return Err(frame_err(line, "remote dlc above 8"));
            }
            dlc = Some(len);
        }
        ""
    } else {
        body
    };

    let data = parse_hex_bytes(data_text).ok_or_else(|| frame_err(line, "invalid payload"))?;

    let event = Event {
        timestamp,
        id,
        extended,
        remote,
        error,
        fd,
        channel: channel.to_string(),
        dlc: dlc.unwrap_or(data.len() as u8),
        data: Bytes::from(data),
    };
    event.validate()?;
    Ok(event)
}

/// `(seconds.fraction)` to UTC
fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    let inner = stamp.strip_prefix('(')?.strip_suffix(')')?;
    let (secs, frac) = inner.split_once('.').unwrap_or((inner, ""));
    let secs: i64 = secs.parse().ok()?;

    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos = if frac.is_empty() {
        0
    } else {
        frac.parse::<u32>().ok()? * 10u32.pow(9 - frac.len() as u32)
    };

    DateTime::from_timestamp(secs, nanos)
}

/// Hex pairs, optionally separated by '.'
fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|&b| b != b'.').collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}
