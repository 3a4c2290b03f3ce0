//! # CAN Log Agent Library
//!
//! Field capture agent for vehicle CAN buses.
//!
//! Every bus event is enriched with the latest temperature and power readings
//! and written to rotated CSV capture files. Finalized files are uploaded
//! whenever the remote store is reachable and deleted once accepted. The
//! agent stops itself only when the bus has gone silent and the power rail
//! has dropped for longer than the configured threshold.

pub mod agent;
pub mod can;
pub mod config;
pub mod error;
pub mod logger;
pub mod observable;
pub mod sensors;
pub mod supervisor;
pub mod upload;
