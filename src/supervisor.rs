//! # Shutdown Supervisor
//!
//! Two independent loss clocks, one for data-source silence and one for
//! power loss. Each resets the moment its condition is healthy again.
//! Shutdown is requested only when *both* clocks have run past the
//! threshold, i.e. the vehicle has been switched off rather than a single
//! input dropping out.

use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Time since a monitored condition was last healthy
#[derive(Debug, Clone, Copy, Default)]
pub struct LossClock {
    lost_since: Option<Instant>,
}

impl LossClock {
    /// Record the condition's health at `now`
    pub fn observe(&mut self, healthy: bool, now: Instant) {
        if healthy {
            self.lost_since = None;
        } else if self.lost_since.is_none() {
            self.lost_since = Some(now);
        }
    }

    /// Zero while healthy
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.lost_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_lost(&self) -> bool {
        self.lost_since.is_some()
    }
}

/// Conjunction of source and power loss
#[derive(Debug, Clone)]
pub struct ShutdownSupervisor {
    threshold: Duration,
    source: LossClock,
    power: LossClock,
    triggered: bool,
}

impl ShutdownSupervisor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            source: LossClock::default(),
            power: LossClock::default(),
            triggered: false,
        }
    }

    /// An event arrived
    pub fn observe_event(&mut self, now: Instant) {
        if self.source.is_lost() {
            info!("Data source active again");
        }
        self.source.observe(true, now);
    }

    /// A receive tick passed without an event
    pub fn observe_silence(&mut self, now: Instant) {
        self.source.observe(false, now);
    }

    /// Latest power rail reading
    pub fn observe_power(&mut self, up: bool, now: Instant) {
        self.power.observe(up, now);
    }

    pub fn source_loss(&self, now: Instant) -> Duration {
        self.source.elapsed(now)
    }

    pub fn power_loss(&self, now: Instant) -> Duration {
        self.power.elapsed(now)
    }

    /// True exactly once: the first time both clocks reach the threshold
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.triggered {
            return false;
        }
        let source = self.source_loss(now);
        let power = self.power_loss(now);
        let due = self.source.is_lost()
            && self.power.is_lost()
            && source >= self.threshold
            && power >= self.threshold;
        if due {
            warn!(
                "No data for {:?} and no power for {:?}, shutting down",
                source, power
            );
            self.triggered = true;
        }
        due
    }
}
