//! # Capture Agent
//!
//! The ingestion loop and the owner of every background task.
//!
//! ## Tasks
//!
//! - ingestion loop (this struct): bounded-wait bus receive, append, supervise
//! - temperature sampler: publishes `SensorSnapshot`
//! - power monitor: publishes `PowerState`
//! - upload scheduler: drains the `UploadQueue` while the store is reachable
//!
//! They share only the two `Observable`s, the queue and one task
//! `CancellationToken`. The external stop token only ends the ingestion
//! loop; the tasks keep running until the shutdown sequence cancels theirs,
//! so an upload in flight at Ctrl+C still completes.
//!
//! ## Shutdown
//!
//! 1. finalize the active capture file
//! 2. best-effort final drain of the queue (bounded, skipped after an auth rejection)
//! 3. cancel the task token and join every background task
//! 4. close the bus handle, if one was ever opened
//!
//! Running the sequence a second time does nothing.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::can::transport::{BusHandle, Transport};
use crate::config::Config;
use crate::error::{CaptureError, Result};
use crate::logger::rotator::{Rotator, RotatorSettings};
use crate::observable::Observable;
use crate::sensors::power::{PowerMonitor, PowerSensor, PowerState};
use crate::sensors::temperature::{SensorSampler, SensorSnapshot, TemperatureSource};
use crate::supervisor::ShutdownSupervisor;
use crate::upload::queue::UploadQueue;
use crate::upload::scheduler::{DrainStop, UploadScheduler};
use crate::upload::uploader::Uploader;

/// Why the agent stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stop requested from outside (e.g. Ctrl+C)
    Interrupted,
    /// Data source silent and power lost past the threshold
    SourceAndPowerLost,
}

/// Field capture agent
pub struct CaptureAgent<T: Transport, U: Uploader> {
    config: Config,
    transport: T,
    handle: Option<T::Handle>,
    rotator: Rotator,
    scheduler: UploadScheduler<U>,
    sensors: Observable<SensorSnapshot>,
    power: Observable<PowerState>,
    supervisor: ShutdownSupervisor,
    stop: CancellationToken,
    tasks_stop: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    shut_down: bool,
}

impl<T: Transport, U: Uploader> CaptureAgent<T, U> {
    /// Prepare the output directory and the first capture file
    ///
    /// Files left by an earlier run are queued before anything new is written.
    pub fn new(config: Config, transport: T, uploader: Arc<U>) -> Result<Self> {
        let sensors = Observable::new(SensorSnapshot::unavailable(config.sensors.channels));
        let power = Observable::new(PowerState::up_at(Utc::now()));
        let queue = UploadQueue::new();

        let rotator = Rotator::open(
            RotatorSettings::from_config(&config)?,
            sensors.clone(),
            power.clone(),
            queue.clone(),
        )?;
        let scheduler = UploadScheduler::new(uploader, queue, config.upload.remote_dir.clone());
        let supervisor = ShutdownSupervisor::new(config.loss_threshold());

        Ok(Self {
            config,
            transport,
            handle: None,
            rotator,
            scheduler,
            sensors,
            power,
            supervisor,
            stop: CancellationToken::new(),
            tasks_stop: CancellationToken::new(),
            tasks: Vec::new(),
            shut_down: false,
        })
    }

    /// Token that ends capture when cancelled
    ///
    /// Background tasks are not tied to it; they stop inside `shutdown()`.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn queue(&self) -> &UploadQueue {
        self.rotator.queue()
    }

    pub fn sensors(&self) -> &Observable<SensorSnapshot> {
        &self.sensors
    }

    pub fn power(&self) -> &Observable<PowerState> {
        &self.power
    }

    /// Spawn the sampler, the power monitor and (if enabled) the upload scheduler
    pub fn start<S: TemperatureSource, P: PowerSensor>(&mut self, temperature: Arc<S>, power: P) {
        let sampler = SensorSampler::new(
            temperature,
            self.config.sensors.channels,
            self.config.sensor_interval(),
            self.sensors.clone(),
        );
        self.tasks.push(("temperature", tokio::spawn(sampler.run(self.tasks_stop.clone()))));

        let monitor = PowerMonitor::new(power, self.config.power_interval(), self.power.clone());
        self.tasks.push(("power", tokio::spawn(monitor.run(self.tasks_stop.clone()))));

        if self.config.upload.enabled {
            let scheduler = self.scheduler.clone();
            let interval = self.config.upload_interval();
            self.tasks.push(("upload", tokio::spawn(scheduler.run(interval, self.tasks_stop.clone()))));
        } else {
            info!("Uploading disabled, capture files stay in {}", self.config.output.dir.display());
        }
    }

    /// Open the bus and capture until stopped
    ///
    /// Always runs the shutdown sequence before returning.
    ///
    /// # Errors
    ///
    /// Returns the fatal error (transport or filesystem) that ended capture
    pub async fn run(&mut self) -> Result<ExitReason> {
        let outcome = self.capture().await;
        if let Err(e) = &outcome {
            error!("Capture stopped: {}", e);
        }

        let shutdown = self.shutdown().await;
        match (outcome, shutdown) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(reason), Ok(())) => Ok(reason),
        }
    }

    async fn capture(&mut self) -> Result<ExitReason> {
        let channel = self.config.source.channel.clone();
        let handle = self.transport.open(&channel).await?;
        self.handle = Some(handle);
        info!("Capturing from {} into {}", channel, self.config.output.dir.display());

        let timeout = self.config.receive_timeout();
        let stop = self.stop.clone();

        loop {
            let Some(handle) = self.handle.as_mut() else {
                return Err(CaptureError::TransportClosed);
            };

            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(ExitReason::Interrupted),
                received = handle.receive(timeout) => received,
            };

            let now = Instant::now();
            match received {
                Ok(Some(event)) => {
                    self.supervisor.observe_event(now);
                    self.rotator.append(&event)?;
                }
                Ok(None) => {
                    self.supervisor.observe_silence(now);
                    self.rotator.tick(Utc::now())?;
                }
                Err(e) if !e.is_fatal() => {
                    // The source is alive even if this record is unusable
                    self.supervisor.observe_event(now);
                    warn!("Skipping bus record: {}", e);
                }
                Err(e) => return Err(e),
            }

            self.supervisor.observe_power(self.power.latest().up, now);
            if self.supervisor.poll(now) {
                return Ok(ExitReason::SourceAndPowerLost);
            }
        }
    }

    /// Finalize, drain, stop tasks, release the bus
    ///
    /// Safe to call more than once; only the first call does any work.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        info!("Shutting down capture");

        let finalized = self.rotator.close();
        match &finalized {
            Ok(Some(file)) => debug!("Final capture file {}", file.path.display()),
            Ok(None) => {}
            Err(e) => error!("Failed to finalize active capture file: {}", e),
        }

        self.final_drain().await;

        self.tasks_stop.cancel();
        for (name, task) in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("{} task ended abnormally: {}", name, e);
            }
        }

        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                warn!("Failed to close bus handle: {}", e);
            }
        }

        info!("Capture stopped, {} file(s) left in the upload queue", self.queue().len());
        finalized.map(|_| ())
    }

    async fn final_drain(&self) {
        if !self.config.upload.enabled || self.scheduler.is_disabled() || self.queue().is_empty() {
            return;
        }

        let limit = Duration::from_secs(self.config.upload.final_drain_timeout_s);
        match tokio::time::timeout(limit, self.scheduler.run_cycle()).await {
            Ok(Ok(report)) => match report.stop {
                DrainStop::Emptied => info!("Final upload: {} file(s) uploaded", report.uploaded),
                other => info!(
                    "Final upload: {} uploaded, {} left ({:?})",
                    report.uploaded, report.remaining, other
                ),
            },
            Ok(Err(e)) => error!("Final upload failed: {}", e),
            Err(_) => warn!("Final upload timed out after {:?}", limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::frame::Event;
    use crate::config::RotationKind;
    use crate::logger::rotator::RotationPolicy;
    use crate::sensors::temperature::{Reading, SensorReadError};
    use crate::upload::uploader::UploadOutcome;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    enum Step {
        Frame(u32),
        Fail,
    }

    struct ScriptedTransport {
        steps: Mutex<Option<VecDeque<Step>>>,
        open_fails: bool,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(Some(steps.into())),
                open_fails: false,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct ScriptedHandle {
        steps: VecDeque<Step>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        type Handle = ScriptedHandle;

        async fn open(&self, _channel: &str) -> Result<ScriptedHandle> {
            if self.open_fails {
                return Err(CaptureError::Transport("no such device".to_string()));
            }
            Ok(ScriptedHandle {
                steps: self.steps.lock().unwrap().take().unwrap_or_default(),
                closed: Arc::clone(&self.closed),
            })
        }
    }

    #[async_trait]
    impl BusHandle for ScriptedHandle {
        async fn receive(&mut self, timeout: Duration) -> Result<Option<Event>> {
            match self.steps.pop_front() {
                Some(Step::Frame(id)) => Ok(Some(Event::new(Utc::now(), "can0", id, false, vec![0xAB])?)),
                Some(Step::Fail) => Err(CaptureError::Transport("bus-off".to_string())),
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(None)
                }
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        uploaded: Mutex<Vec<String>>,
        reject: bool,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn reachable(&self) -> bool {
            true
        }

        async fn put(&self, local_path: &Path, remote_name: &str) -> UploadOutcome {
            if self.reject {
                return UploadOutcome::AuthError("401".to_string());
            }
            assert!(local_path.exists());
            self.uploaded.lock().unwrap().push(remote_name.to_string());
            UploadOutcome::Success
        }
    }

    struct FixedTemperatures;

    #[async_trait]
    impl TemperatureSource for FixedTemperatures {
        async fn list_channels(&self) -> std::result::Result<Vec<String>, SensorReadError> {
            Ok(vec!["28-a".to_string()])
        }

        async fn read(&self, _id: &str) -> std::result::Result<f64, SensorReadError> {
            Ok(22.5)
        }
    }

    /// Takes a while per file and logs when each put starts and finishes
    #[derive(Default)]
    struct SlowUploader {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Uploader for SlowUploader {
        async fn reachable(&self) -> bool {
            true
        }

        async fn put(&self, _local_path: &Path, remote_name: &str) -> UploadOutcome {
            self.log.lock().unwrap().push(format!("start {}", remote_name));
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.log.lock().unwrap().push(format!("done {}", remote_name));
            UploadOutcome::Success
        }
    }

    struct Rail(bool);

    #[async_trait]
    impl PowerSensor for Rail {
        async fn read_rail(&self) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.output.dir = dir.to_path_buf();
        config.source.receive_timeout_ms = 10;
        config.rotation.policy = RotationKind::Records;
        config.rotation.max_records = 1;
        config.sensors.channels = 2;
        config.sensors.interval_ms = 10;
        config.power.interval_ms = 10;
        config.upload.check_interval_s = 3600;
        config.shutdown.loss_threshold_s = 1;
        config
    }

    fn files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_three_events_rotate_and_upload_in_one_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let queue = UploadQueue::new();
        let mut rotator = Rotator::open(
            RotatorSettings::from_config(&config).unwrap(),
            Observable::new(SensorSnapshot::unavailable(2)),
            Observable::new(PowerState::up_at(Utc::now())),
            queue.clone(),
        )
        .unwrap();
        assert_eq!(config.rotation_policy(), RotationPolicy::Records(1));

        for id in [0x100, 0x200, 0x7FF] {
            rotator.append(&Event::new(Utc::now(), "can0", id, false, vec![1, 2]).unwrap()).unwrap();
        }

        let finalized: Vec<PathBuf> = files(dir.path())
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == "csv"))
            .collect();
        assert_eq!(finalized.len(), 3);
        for path in &finalized {
            let contents = std::fs::read_to_string(path).unwrap();
            assert_eq!(contents.lines().count(), 2, "header plus one row in {}", path.display());
        }

        let uploader = Arc::new(RecordingUploader::default());
        let scheduler = UploadScheduler::new(Arc::clone(&uploader), queue.clone(), "/");
        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.uploaded, 3);
        for path in &finalized {
            assert!(!path.exists());
        }
        assert!(queue.is_empty());
        assert_eq!(uploader.uploaded.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transport_failure_finalizes_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            Step::Frame(0x100),
            Step::Frame(0x200),
            Step::Frame(0x7FF),
            Step::Fail,
        ]);
        let closed = Arc::clone(&transport.closed);
        let uploader = Arc::new(RecordingUploader::default());

        let mut agent = CaptureAgent::new(test_config(dir.path()), transport, Arc::clone(&uploader)).unwrap();
        agent.start(Arc::new(FixedTemperatures), Rail(true));

        let result = agent.run().await;
        assert!(matches!(result, Err(CaptureError::Transport(_))));
        assert!(closed.load(Ordering::SeqCst));

        let mut uploaded = uploader.uploaded.lock().unwrap().clone();
        uploaded.sort();
        assert_eq!(uploaded.len(), 3);
        assert!(uploaded.iter().all(|name| name.starts_with("/can_log_") && name.ends_with(".csv")));
        // Empty trailing file is removed, uploaded ones are deleted
        assert!(files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_source_and_power_loss_stops_agent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.rotation.policy = RotationKind::Time;
        config.upload.enabled = false;

        let transport = ScriptedTransport::new(vec![Step::Frame(0x123)]);
        let closed = Arc::clone(&transport.closed);
        let mut agent = CaptureAgent::new(config, transport, Arc::new(RecordingUploader::default())).unwrap();
        agent.start(Arc::new(FixedTemperatures), Rail(false));

        let result = tokio::time::timeout(Duration::from_secs(10), agent.run()).await.unwrap();
        assert_eq!(result.unwrap(), ExitReason::SourceAndPowerLost);
        assert!(closed.load(Ordering::SeqCst));

        // Upload disabled: the one captured row stays on disk, finalized
        let remaining = files(dir.path());
        assert_eq!(remaining.len(), 1);
        let contents = std::fs::read_to_string(&remaining[0]).unwrap();
        let row = contents.lines().nth(1).unwrap();
        assert!(row.contains(",0x123,"));
        assert_eq!(agent.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_during_upload_lets_it_finish_once() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join("can_log_2020-01-01_00-00-00_0001.csv");
        std::fs::write(&leftover, "Timestamp,ID\n2020-01-01T00:00:00.000000+00:00,0x100\n").unwrap();

        let uploader = Arc::new(SlowUploader::default());
        let mut agent =
            CaptureAgent::new(test_config(dir.path()), ScriptedTransport::new(vec![]), Arc::clone(&uploader)).unwrap();
        assert_eq!(agent.queue().len(), 1);
        agent.start(Arc::new(FixedTemperatures), Rail(true));

        // Lands while the periodic put of the leftover file is in flight
        let stop = agent.stop_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stop.cancel();
        });

        assert_eq!(agent.run().await.unwrap(), ExitReason::Interrupted);

        let log = uploader.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "start /can_log_2020-01-01_00-00-00_0001.csv".to_string(),
                "done /can_log_2020-01-01_00-00-00_0001.csv".to_string(),
            ]
        );
        assert!(agent.queue().is_empty());
        assert!(files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_external_stop_and_repeated_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![]);
        let closed = Arc::clone(&transport.closed);
        let mut agent =
            CaptureAgent::new(test_config(dir.path()), transport, Arc::new(RecordingUploader::default())).unwrap();
        agent.start(Arc::new(FixedTemperatures), Rail(true));

        let stop = agent.stop_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.cancel();
        });

        assert_eq!(agent.run().await.unwrap(), ExitReason::Interrupted);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(agent.sensors().latest().get(0), Reading::Celsius(22.5));
        assert!(agent.shutdown().await.is_ok());
        assert!(agent.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_failure_skips_handle_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = ScriptedTransport::new(vec![]);
        transport.open_fails = true;
        let closed = Arc::clone(&transport.closed);
        let mut agent =
            CaptureAgent::new(test_config(dir.path()), transport, Arc::new(RecordingUploader::default())).unwrap();
        agent.start(Arc::new(FixedTemperatures), Rail(true));

        assert!(matches!(agent.run().await, Err(CaptureError::Transport(_))));
        assert!(!closed.load(Ordering::SeqCst));
        assert!(files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_auth_rejection_keeps_files_and_still_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![Step::Frame(0x100), Step::Fail]);
        let uploader = Arc::new(RecordingUploader {
            uploaded: Mutex::new(Vec::new()),
            reject: true,
        });
        let mut agent = CaptureAgent::new(test_config(dir.path()), transport, uploader).unwrap();
        agent.start(Arc::new(FixedTemperatures), Rail(true));

        assert!(agent.run().await.is_err());
        assert_eq!(agent.queue().len(), 1);
        assert_eq!(files(dir.path()).len(), 1);
    }
}
