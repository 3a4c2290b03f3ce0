//! # Upload Scheduler
//!
//! Each cycle probes reachability and, only when the store answers, drains
//! the queue oldest-first:
//!
//! - success: delete the local file, retire it from the queue
//! - transient failure: leave it queued and end this drain
//! - auth failure: end this drain and disable uploading for good
//!
//! Network I/O happens only here, so an unreachable store never stalls
//! capture or rotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::UploadQueue;
use super::uploader::{UploadOutcome, Uploader};
use crate::error::{CaptureError, Result};

/// Why a drain stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStop {
    /// Queue is empty
    Emptied,
    /// Probe failed, nothing attempted
    Unreachable,
    /// A retryable failure; the file stays queued
    Transient(String),
    /// Uploading was disabled by an earlier auth rejection
    Disabled,
}

/// Outcome of one scheduler cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub uploaded: usize,
    pub remaining: usize,
    pub stop: DrainStop,
}

/// `remote_dir` joined with `file_name`
pub fn remote_path(remote_dir: &str, file_name: &str) -> String {
    format!("{}/{}", remote_dir.trim_end_matches('/'), file_name)
}

/// Periodic drain of the upload queue
///
/// Clones share the queue, the disabled flag and the drain lock, so the
/// final shutdown drain never overlaps a periodic one.
pub struct UploadScheduler<U> {
    uploader: Arc<U>,
    queue: UploadQueue,
    remote_dir: String,
    disabled: Arc<AtomicBool>,
    drain_lock: Arc<Mutex<()>>,
}

impl<U> Clone for UploadScheduler<U> {
    fn clone(&self) -> Self {
        Self {
            uploader: Arc::clone(&self.uploader),
            queue: self.queue.clone(),
            remote_dir: self.remote_dir.clone(),
            disabled: Arc::clone(&self.disabled),
            drain_lock: Arc::clone(&self.drain_lock),
        }
    }
}

impl<U: Uploader> UploadScheduler<U> {
    pub fn new(uploader: Arc<U>, queue: UploadQueue, remote_dir: impl Into<String>) -> Self {
        Self {
            uploader,
            queue,
            remote_dir: remote_dir.into(),
            disabled: Arc::new(AtomicBool::new(false)),
            drain_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Whether an auth rejection has shut uploading down
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Probe, then drain if reachable
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::UploadAuth` the first time the store rejects
    /// our credentials. Later cycles report `DrainStop::Disabled`.
    pub async fn run_cycle(&self) -> Result<DrainReport> {
        let _guard = self.drain_lock.lock().await;

        if self.is_disabled() {
            return Ok(self.report(0, DrainStop::Disabled));
        }

        if self.queue.is_empty() {
            return Ok(self.report(0, DrainStop::Emptied));
        }

        if !self.uploader.reachable().await {
            debug!("Remote store unreachable, {} file(s) waiting", self.queue.len());
            return Ok(self.report(0, DrainStop::Unreachable));
        }

        self.drain().await
    }

    async fn drain(&self) -> Result<DrainReport> {
        let mut uploaded = 0;

        while let Some(file) = self.queue.begin_next() {
            if !file.path.exists() {
                warn!("Queued file {} vanished, dropping it", file.path.display());
                self.queue.discard(&file.path);
                continue;
            }

            let remote = remote_path(&self.remote_dir, &file.file_name());
            match self.uploader.put(&file.path, &remote).await {
                UploadOutcome::Success => {
                    match tokio::fs::remove_file(&file.path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!("Uploaded {} but could not delete it: {}", file.path.display(), e),
                    }
                    self.queue.complete(&file.path);
                    uploaded += 1;
                    info!("Uploaded {} to {}", file.path.display(), remote);
                }
                UploadOutcome::Transient(reason) => {
                    warn!("Upload of {} failed, will retry: {}", file.path.display(), reason);
                    self.queue.retry(&file.path);
                    return Ok(self.report(uploaded, DrainStop::Transient(reason)));
                }
                UploadOutcome::AuthError(reason) => {
                    error!("Remote store rejected credentials, uploading disabled: {}", reason);
                    self.queue.retry(&file.path);
                    self.disabled.store(true, Ordering::SeqCst);
                    return Err(CaptureError::UploadAuth(reason));
                }
            }
        }

        Ok(self.report(uploaded, DrainStop::Emptied))
    }

    fn report(&self, uploaded: usize, stop: DrainStop) -> DrainReport {
        DrainReport {
            uploaded,
            remaining: self.queue.len(),
            stop,
        }
    }

    /// Run cycles every `interval` until `stop` is cancelled or auth fails
    pub async fn run(self, interval: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // An interrupted cycle leaves its file queued
            let cycle = tokio::select! {
                _ = stop.cancelled() => break,
                cycle = self.run_cycle() => cycle,
            };

            match cycle {
                Ok(report) if report.uploaded > 0 => {
                    info!("Upload cycle: {} uploaded, {} remaining", report.uploaded, report.remaining);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Upload subsystem stopped: {}", e);
                    break;
                }
            }
        }
        debug!("Upload scheduler stopped");
    }
}
