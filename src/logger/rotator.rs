//! # Log Writer / Rotator
//!
//! Owns the single file in `Writing` state and moves it through the durable
//! finalize protocol:
//!
//! 1. records are appended to `<name>_<stamp>_<seq>.csv.part`
//! 2. on rotation the buffer is flushed and the file is `fsync`ed
//! 3. the file is renamed to `.csv` (atomic within the volume), then the
//!    directory is `fsync`ed
//! 4. only then is it pushed onto the `UploadQueue`
//!
//! The upload side never sees a `.part` name, so it can never pick up a
//! partially written file. A new `.part` file with its header row is opened
//! before the next record is accepted, so rotation is invisible to callers.

use chrono::{DateTime, FixedOffset, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::record::{header, LogRecord};
use crate::can::frame::Event;
use crate::config::Config;
use crate::error::{CaptureError, Result};
use crate::observable::Observable;
use crate::sensors::power::PowerState;
use crate::sensors::temperature::SensorSnapshot;
use crate::upload::queue::UploadQueue;

/// Extension of finalized capture files
pub const FINAL_EXTENSION: &str = "csv";

/// Suffix appended to files that are still being written
pub const TEMP_SUFFIX: &str = ".part";

/// When the active file is rotated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Elapsed time since the file was started
    Elapsed(Duration),
    /// Bytes written to the file, header included
    Bytes(u64),
    /// Data rows written to the file
    Records(u64),
}

/// Lifecycle of a capture file
///
/// `Writing -> Finalizing -> PendingUpload -> Uploading -> Uploaded`, with
/// `Uploading -> PendingUpload` on a retryable failure. There is no way back
/// to `Writing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Writing,
    Finalizing,
    PendingUpload,
    Uploading,
    Uploaded,
}

/// A capture file and its accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub bytes: u64,
    pub rows: u64,
    pub state: FileState,
}

impl LogFile {
    /// File name used for the remote copy
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Rotator parameters
#[derive(Debug, Clone)]
pub struct RotatorSettings {
    pub dir: PathBuf,
    pub name: String,
    pub channels: usize,
    pub offset: FixedOffset,
    pub policy: RotationPolicy,
    pub flush_every_records: usize,
}

impl RotatorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            dir: config.output.dir.clone(),
            name: config.output.name.clone(),
            channels: config.sensors.channels,
            offset: config.utc_offset()?,
            policy: config.rotation_policy(),
            flush_every_records: config.output.flush_every_records,
        })
    }
}

/// The file currently in `Writing` state
struct ActiveFile {
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    created_at: DateTime<Utc>,
    bytes: u64,
    rows: u64,
    unflushed: usize,
}

impl ActiveFile {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|e| CaptureError::filesystem(&self.temp_path, e))?;
        self.bytes += line.len() as u64 + 1;
        self.unflushed += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| CaptureError::filesystem(&self.temp_path, e))?;
        self.unflushed = 0;
        Ok(())
    }

    fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Appends enriched records and rotates capture files
///
/// Holds at most one `ActiveFile`, which is the only file in `Writing`
/// state. Every path that replaces it finalizes the old one first.
pub struct Rotator {
    settings: RotatorSettings,
    header: String,
    sensors: Observable<SensorSnapshot>,
    power: Observable<PowerState>,
    queue: UploadQueue,
    active: Option<ActiveFile>,
    seq: u64,
}

impl std::fmt::Debug for Rotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rotator")
            .field("dir", &self.settings.dir)
            .field("policy", &self.settings.policy)
            .field("active", &self.active.as_ref().map(|a| &a.temp_path))
            .finish_non_exhaustive()
    }
}

impl Rotator {
    /// Prepare the output directory, recover leftovers and open the first file
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Filesystem` if the directory or the first
    /// file cannot be created
    pub fn open(
        settings: RotatorSettings,
        sensors: Observable<SensorSnapshot>,
        power: Observable<PowerState>,
        queue: UploadQueue,
    ) -> Result<Self> {
        Self::open_at(settings, sensors, power, queue, Utc::now())
    }

    pub fn open_at(
        settings: RotatorSettings,
        sensors: Observable<SensorSnapshot>,
        power: Observable<PowerState>,
        queue: UploadQueue,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        fs::create_dir_all(&settings.dir).map_err(|e| CaptureError::filesystem(&settings.dir, e))?;

        let recovered = recover_orphans(&settings.dir, &settings.name, &queue)?;
        if recovered > 0 {
            info!("Queued {} capture file(s) left by an earlier run", recovered);
        }

        let mut rotator = Self {
            header: header(settings.channels),
            settings,
            sensors,
            power,
            queue,
            active: None,
            seq: 0,
        };
        rotator.start_file(now)?;
        Ok(rotator)
    }

    /// Append one event stamped with the current wall clock
    pub fn append(&mut self, event: &Event) -> Result<()> {
        self.append_at(event, Utc::now())
    }

    /// Append one event, using `now` for rotation decisions
    pub fn append_at(&mut self, event: &Event, now: DateTime<Utc>) -> Result<()> {
        self.rotate_if_expired(now)?;
        if self.active.is_none() {
            self.start_file(now)?;
        }

        let sensors = self.sensors.latest();
        let power = self.power.latest();
        let line = LogRecord::new(event, &sensors, power).render(&self.settings.offset, self.settings.channels);

        let flush_every = self.settings.flush_every_records;
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active.write_line(&line)?;
        active.rows += 1;
        if active.unflushed >= flush_every {
            active.flush()?;
        }

        let full = match self.settings.policy {
            RotationPolicy::Bytes(max) => active.bytes >= max,
            RotationPolicy::Records(max) => active.rows >= max,
            RotationPolicy::Elapsed(_) => false,
        };
        if full {
            self.rotate(now)?;
        }
        Ok(())
    }

    /// Idle tick from the ingestion loop; applies the time policy
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.rotate_if_expired(now)
    }

    /// Finalize the active file and open a new one
    pub fn rotate(&mut self, now: DateTime<Utc>) -> Result<()> {
        if let Some(active) = self.active.take() {
            self.finalize(active)?;
        }
        self.start_file(now)
    }

    /// Finalize the active file without opening a new one
    ///
    /// A file without data rows is removed instead of queued. Calling this
    /// again is a no-op.
    pub fn close(&mut self) -> Result<Option<LogFile>> {
        let Some(mut active) = self.active.take() else {
            return Ok(None);
        };

        if active.rows == 0 {
            drop(active.writer);
            fs::remove_file(&active.temp_path).map_err(|e| CaptureError::filesystem(&active.temp_path, e))?;
            debug!("Removed empty capture file {}", active.temp_path.display());
            return Ok(None);
        }

        active.flush()?;
        self.finalize(active).map(Some)
    }

    /// The file in `Writing` state, if any
    pub fn active(&self) -> Option<LogFile> {
        self.active.as_ref().map(|a| LogFile {
            path: a.temp_path.clone(),
            created_at: a.created_at,
            bytes: a.bytes,
            rows: a.rows,
            state: FileState::Writing,
        })
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    fn rotate_if_expired(&mut self, now: DateTime<Utc>) -> Result<()> {
        let RotationPolicy::Elapsed(limit) = self.settings.policy else {
            return Ok(());
        };
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.elapsed(now) < limit {
            return Ok(());
        }

        if active.rows == 0 {
            // Nothing captured in this window; keep the file and restart its clock.
            active.created_at = now;
            return Ok(());
        }
        self.rotate(now)
    }

    fn start_file(&mut self, now: DateTime<Utc>) -> Result<()> {
        let stamp = now.with_timezone(&self.settings.offset).format("%Y-%m-%d_%H-%M-%S");

        let (temp_path, final_path, file) = loop {
            self.seq += 1;
            let final_path = self
                .settings
                .dir
                .join(format!("{}_{}_{:04}.{}", self.settings.name, stamp, self.seq, FINAL_EXTENSION));
            if final_path.exists() {
                continue;
            }
            let temp_path = temp_path_for(&final_path);
            match OpenOptions::new().write(true).create_new(true).open(&temp_path) {
                Ok(file) => break (temp_path, final_path, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(CaptureError::filesystem(&temp_path, e)),
            }
        };

        let mut active = ActiveFile {
            temp_path,
            final_path,
            writer: BufWriter::new(file),
            created_at: now,
            bytes: 0,
            rows: 0,
            unflushed: 0,
        };
        active.write_line(&self.header)?;
        active.flush()?;

        debug!("Opened capture file {}", active.temp_path.display());
        self.active = Some(active);
        Ok(())
    }

    fn finalize(&mut self, mut active: ActiveFile) -> Result<LogFile> {
        let mut finalized = LogFile {
            path: active.temp_path.clone(),
            created_at: active.created_at,
            bytes: active.bytes,
            rows: active.rows,
            state: FileState::Finalizing,
        };
        debug!("Finalizing {} ({} rows, {} bytes)", finalized.path.display(), finalized.rows, finalized.bytes);

        active.flush()?;
        let file = active
            .writer
            .into_inner()
            .map_err(|e| CaptureError::filesystem(&active.temp_path, e.into_error()))?;
        file.sync_all().map_err(|e| CaptureError::filesystem(&active.temp_path, e))?;
        drop(file);

        fs::rename(&active.temp_path, &active.final_path)
            .map_err(|e| CaptureError::filesystem(&active.final_path, e))?;
        sync_dir(&self.settings.dir);

        // Durable under its final name; only now may the upload side see it
        finalized.path = active.final_path;
        finalized.state = FileState::PendingUpload;
        info!("Finalized {} ({} rows)", finalized.path.display(), finalized.rows);
        self.queue.push(finalized.clone());
        Ok(finalized)
    }
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Persist the rename itself; not every platform supports syncing a directory
fn sync_dir(dir: &Path) {
    match File::open(dir).and_then(|d| d.sync_all()) {
        Ok(()) => {}
        Err(e) => debug!("Directory sync skipped for {}: {}", dir.display(), e),
    }
}

/// Queue finalized files from an earlier run and salvage interrupted ones
///
/// A leftover `.part` file is cut back to its last complete line and then
/// finalized; one holding only the header is removed. Returns the number of
/// files queued.
pub fn recover_orphans(dir: &Path, name: &str, queue: &UploadQueue) -> Result<usize> {
    let prefix = format!("{}_", name);
    let final_suffix = format!(".{}", FINAL_EXTENSION);
    let temp_suffix = format!("{}{}", final_suffix, TEMP_SUFFIX);

    let entries = fs::read_dir(dir).map_err(|e| CaptureError::filesystem(dir, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CaptureError::filesystem(dir, e))?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.starts_with(&prefix) {
            names.push(file_name);
        }
    }

    for temp_name in names.iter().filter(|n| n.ends_with(&temp_suffix)) {
        let temp_path = dir.join(temp_name);
        let final_path = dir.join(&temp_name[..temp_name.len() - TEMP_SUFFIX.len()]);
        salvage_partial(&temp_path, &final_path)?;
    }

    // Re-list: salvage may have produced new final files
    let mut finals: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| CaptureError::filesystem(dir, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(&final_suffix))
        })
        .collect();
    finals.sort();

    let mut queued = 0;
    for path in finals {
        let contents = fs::read(&path).map_err(|e| CaptureError::filesystem(&path, e))?;
        let created_at = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let lines = contents.iter().filter(|&&b| b == b'\n').count() as u64;
        if queue.push(LogFile {
            path,
            created_at,
            bytes: contents.len() as u64,
            rows: lines.saturating_sub(1),
            state: FileState::PendingUpload,
        }) {
            queued += 1;
        }
    }
    Ok(queued)
}

fn salvage_partial(temp_path: &Path, final_path: &Path) -> Result<()> {
    let contents = fs::read(temp_path).map_err(|e| CaptureError::filesystem(temp_path, e))?;
    let complete = contents.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    let lines = contents[..complete].iter().filter(|&&b| b == b'\n').count();

    if lines <= 1 {
        fs::remove_file(temp_path).map_err(|e| CaptureError::filesystem(temp_path, e))?;
        debug!("Removed interrupted capture file without data {}", temp_path.display());
        return Ok(());
    }

    if complete < contents.len() {
        warn!(
            "Dropping {} trailing bytes of an incomplete record in {}",
            contents.len() - complete,
            temp_path.display()
        );
        let file = OpenOptions::new()
            .write(true)
            .open(temp_path)
            .map_err(|e| CaptureError::filesystem(temp_path, e))?;
        file.set_len(complete as u64)
            .and_then(|_| file.sync_all())
            .map_err(|e| CaptureError::filesystem(temp_path, e))?;
    }

    fs::rename(temp_path, final_path).map_err(|e| CaptureError::filesystem(final_path, e))?;
    info!("Recovered interrupted capture file {}", final_path.display());
    Ok(())
}
