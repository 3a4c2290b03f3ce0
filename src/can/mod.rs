//! # CAN Bus Module
//!
//! Everything between the bus and the ingestion loop.
//!
//! This module handles:
//! - The `Event` record and CAN identifier/payload limits
//! - Parsing `candump -L` log lines (classic, extended, remote, error and FD frames)
//! - The transport seam: bounded-wait receive with an explicitly tracked handle

pub mod frame;
pub mod candump;
pub mod transport;
