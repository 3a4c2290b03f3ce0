//! # CAN Frame Constants and Types
//!
//! Core definitions for events received from the bus.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{CaptureError, Result};

/// Largest 11-bit (standard) identifier
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;

/// Largest 29-bit (extended) identifier
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Error frame flag as it appears in a raw SocketCAN identifier
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;

/// Maximum payload of a CAN FD frame
pub const CANFD_MAX_DLEN: usize = 64;

/// One timestamped frame read from the bus
///
/// Built once by the transport and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Reception time
    pub timestamp: DateTime<Utc>,

    /// Arbitration identifier (11 or 29 bits, see `extended`)
    pub id: u32,

    /// 29-bit addressing
    pub extended: bool,

    /// Remote transmission request
    pub remote: bool,

    /// Error frame
    pub error: bool,

    /// FD framing (payload up to 64 bytes)
    pub fd: bool,

    /// Interface label, e.g. "can0"
    pub channel: String,

    /// Declared data length
    pub dlc: u8,

    /// Payload bytes
    pub data: Bytes,
}

impl Event {
    /// Create a classic data frame
    ///
    /// # Errors
    ///
    /// Returns error if the identifier does not fit the addressing mode or
    /// the payload is longer than 8 bytes
    pub fn new(
        timestamp: DateTime<Utc>,
        channel: impl Into<String>,
        id: u32,
        extended: bool,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let data = data.into();
        let event = Self {
            timestamp,
            id,
            extended,
            remote: false,
            error: false,
            fd: false,
            channel: channel.into(),
            dlc: data.len() as u8,
            data,
        };
        event.validate()?;
        Ok(event)
    }

    /// Check identifier and payload limits
    pub fn validate(&self) -> Result<()> {
        let id_limit = if self.extended || self.error { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if self.id > id_limit {
            return Err(CaptureError::Frame(format!(
                "identifier 0x{:X} exceeds {}-bit range",
                self.id,
                if self.extended { 29 } else { 11 }
            )));
        }

        let max_len = if self.fd { CANFD_MAX_DLEN } else { CAN_MAX_DLEN };
        if self.data.len() > max_len {
            return Err(CaptureError::Frame(format!(
                "payload size {} exceeds maximum {}",
                self.data.len(),
                max_len
            )));
        }

        // The label is written into a CSV column as is
        if self.channel.is_empty() || self.channel.contains([',', '\n', '\r']) {
            return Err(CaptureError::Frame(format!("unusable interface label '{}'", self.channel.escape_debug())));
        }

        if self.remote && !self.data.is_empty() {
            return Err(CaptureError::Frame("remote frame carries no payload".to_string()));
        }

        Ok(())
    }
}
