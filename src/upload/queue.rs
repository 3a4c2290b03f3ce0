//! # Upload Queue
//!
//! FIFO of finalized capture files. The rotator is the only producer and the
//! upload scheduler the only consumer; the lock is held just long enough to
//! move an entry, never across I/O.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::logger::rotator::{FileState, LogFile};

/// How many uploaded paths are remembered for duplicate rejection
///
/// Rotated names carry a monotonic sequence and are never reused, so only a
/// late duplicate of a recent upload can reach the queue.
pub const RETIRED_HISTORY: usize = 256;

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<LogFile>,
    /// Most recently uploaded paths, oldest first
    retired: VecDeque<PathBuf>,
}

/// Thread-safe handle to the shared queue
#[derive(Debug, Clone, Default)]
pub struct UploadQueue {
    inner: Arc<Mutex<Inner>>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries stay consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a finalized file
    ///
    /// Returns `false` if the path is already queued or was already uploaded.
    pub fn push(&self, mut file: LogFile) -> bool {
        let mut inner = self.lock();
        if inner.retired.contains(&file.path) || inner.pending.iter().any(|f| f.path == file.path) {
            debug!("Ignoring duplicate enqueue of {}", file.path.display());
            return false;
        }
        file.state = FileState::PendingUpload;
        inner.pending.push_back(file);
        true
    }

    /// Mark the oldest file `Uploading` and return a copy of it
    pub fn begin_next(&self) -> Option<LogFile> {
        let mut inner = self.lock();
        let front = inner.pending.front_mut()?;
        front.state = FileState::Uploading;
        Some(front.clone())
    }

    /// Remove an uploaded file; it can never be queued again
    pub fn complete(&self, path: &Path) -> Option<LogFile> {
        let mut inner = self.lock();
        let index = inner.pending.iter().position(|f| f.path == path)?;
        let mut file = inner.pending.remove(index)?;
        file.state = FileState::Uploaded;
        if inner.retired.len() == RETIRED_HISTORY {
            inner.retired.pop_front();
        }
        inner.retired.push_back(file.path.clone());
        Some(file)
    }

    /// Put a file back to `PendingUpload` after a retryable failure
    pub fn retry(&self, path: &Path) {
        let mut inner = self.lock();
        if let Some(file) = inner.pending.iter_mut().find(|f| f.path == path) {
            file.state = FileState::PendingUpload;
        }
    }

    /// Drop a file that disappeared from disk
    pub fn discard(&self, path: &Path) -> Option<LogFile> {
        let mut inner = self.lock();
        let index = inner.pending.iter().position(|f| f.path == path)?;
        inner.pending.remove(index)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Copy of the queued files, oldest first
    pub fn snapshot(&self) -> Vec<LogFile> {
        self.lock().pending.iter().cloned().collect()
    }
}
