//! # Upload Module
//!
//! Ships finalized capture files to the remote store when it is reachable.
//!
//! This module handles:
//! - The FIFO of finalized files and their upload lifecycle
//! - The uploader seam: cheap reachability probe plus authenticated put
//! - The periodic scheduler that drains the queue and deletes only on success

pub mod queue;
pub mod uploader;
pub mod scheduler;
