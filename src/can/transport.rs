//! Transport abstraction over the bus source, to enable testing
//!
//! `Transport` opens a channel and hands back a `BusHandle`; the handle does
//! the bounded-wait receive. Keeping the handle a separate value lets the
//! ingestion loop track whether a bus was ever opened, so cleanup is a no-op
//! when it was not.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::candump::parse_line;
use super::frame::Event;
use crate::error::{CaptureError, Result};

/// Opens bus channels
#[async_trait]
pub trait Transport: Send + Sync {
    type Handle: BusHandle;

    /// Open `channel` (e.g. "can0")
    async fn open(&self, channel: &str) -> Result<Self::Handle>;
}

/// An open bus channel
#[async_trait]
pub trait BusHandle: Send {
    /// Wait at most `timeout` for the next event
    ///
    /// `Ok(None)` means nothing arrived in time and is not an error.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Event>>;

    /// Release the channel
    async fn close(&mut self) -> Result<()>;
}

/// Reads the bus through a supervised `candump -L <channel>` process
#[derive(Debug, Clone)]
pub struct CandumpTransport {
    program: String,
}

impl CandumpTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Transport for CandumpTransport {
    type Handle = CandumpHandle<BufReader<ChildStdout>>;

    async fn open(&self, channel: &str) -> Result<Self::Handle> {
        debug!("Spawning {} -L {}", self.program, channel);

        let mut child = Command::new(&self.program)
            .arg("-L")
            .arg(channel)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Transport(format!("Failed to start {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Transport("candump stdout not captured".to_string()))?;

        info!("Opened bus channel {} via {}", channel, self.program);
        Ok(CandumpHandle::with_child(BufReader::new(stdout), child))
    }
}

/// Line-oriented handle over candump output
///
/// Generic over the reader so tests can feed it canned output.
pub struct CandumpHandle<R> {
    lines: Lines<R>,
    child: Option<Child>,
}

impl<R> std::fmt::Debug for CandumpHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandumpHandle")
            .field("child", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

impl<R: AsyncBufRead + Unpin> CandumpHandle<R> {
    /// Handle over any buffered reader producing candump lines
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            child: None,
        }
    }

    fn with_child(reader: R, child: Child) -> Self {
        Self {
            lines: reader.lines(),
            child: Some(child),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> BusHandle for CandumpHandle<R> {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Event>> {
        // next_line is cancel safe, a partially read line survives the timeout.
        match tokio::time::timeout(timeout, self.lines.next_line()).await {
            Err(_) => Ok(None),
            Ok(Ok(Some(line))) if line.trim().is_empty() => Ok(None),
            Ok(Ok(Some(line))) => parse_line(&line).map(Some),
            Ok(Ok(None)) => Err(CaptureError::TransportClosed),
            Ok(Err(e)) => Err(CaptureError::Transport(format!("Failed to read bus: {}", e))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        match child.kill().await {
            Ok(()) => debug!("Stopped bus capture process"),
            // Already exited on its own
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => {
                warn!("Failed to stop bus capture process: {}", e);
                return Err(CaptureError::Transport(format!("Failed to stop capture: {}", e)));
            }
        }
        Ok(())
    }
}
