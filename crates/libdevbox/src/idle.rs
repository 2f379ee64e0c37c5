use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::probe::ActivityProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    Active,
    Counting,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleState {
    pub phase: IdlePhase,
    pub accumulated_idle_secs: u64,
    pub last_sample_at: Option<SystemTime>,
}

/// Idle accounting without any clock or sleeping.
///
/// Every inactive sample adds one poll interval; an active sample resets the
/// count. Once the count reaches the threshold the tracker is expired and
/// stays that way.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    threshold_secs: u64,
    poll_interval_secs: u64,
    state: IdleState,
}

impl IdleTracker {
    pub fn new(threshold_secs: u64, poll_interval_secs: u64) -> Self {
        Self {
            threshold_secs,
            poll_interval_secs,
            state: IdleState {
                phase: IdlePhase::Active,
                accumulated_idle_secs: 0,
                last_sample_at: None,
            },
        }
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn remaining_secs(&self) -> u64 {
        self.threshold_secs.saturating_sub(self.state.accumulated_idle_secs)
    }

    /// Feed one sample. A probe error counts as "nobody connected".
    pub fn observe(&mut self, sample: Result<bool>) -> IdleState {
        if self.state.phase == IdlePhase::Expired {
            return self.state;
        }
        self.state.last_sample_at = Some(SystemTime::now());

        let active = match sample {
            Ok(active) => active,
            Err(err) => {
                warn!("activity probe failed, counting tick as idle: {err}");
                false
            }
        };

        if active {
            self.state.accumulated_idle_secs = 0;
            self.state.phase = IdlePhase::Active;
        } else {
            self.state.accumulated_idle_secs = self
                .state
                .accumulated_idle_secs
                .saturating_add(self.poll_interval_secs);
            self.state.phase = if self.state.accumulated_idle_secs >= self.threshold_secs {
                IdlePhase::Expired
            } else {
                IdlePhase::Counting
            };
        }
        self.state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Expired { idle_secs: u64 },
    Cancelled,
}

/// Poll `probe` until the session has been idle for the threshold or
/// `shutdown` flips to true.
///
/// The first sample is taken one full interval after start, so a fresh
/// session always gets a grace window.
pub async fn run(
    tracker: &mut IdleTracker,
    probe: &dyn ActivityProbe,
    mut shutdown: watch::Receiver<bool>,
) -> MonitorExit {
    info!(
        threshold_secs = tracker.threshold_secs,
        poll_interval_secs = tracker.poll_interval_secs,
        "session will shut down after {}m{}s of inactivity",
        tracker.threshold_secs / 60,
        tracker.threshold_secs % 60
    );

    loop {
        if *shutdown.borrow() {
            info!("shutdown requested, leaving idle monitor");
            return MonitorExit::Cancelled;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender means nobody can cancel us anymore; keep polling.
                if changed.is_err() {
                    tokio::time::sleep(tracker.poll_interval()).await;
                } else {
                    continue;
                }
            }
            _ = tokio::time::sleep(tracker.poll_interval()) => {}
        }

        let state = tracker.observe(probe.is_active());
        match state.phase {
            IdlePhase::Active => debug!("active connection present"),
            IdlePhase::Counting => info!(
                idle_secs = state.accumulated_idle_secs,
                "no active connection, shutting down in {}s",
                tracker.remaining_secs()
            ),
            IdlePhase::Expired => {
                info!(
                    idle_secs = state.accumulated_idle_secs,
                    "idle timeout of {}s reached",
                    tracker.threshold_secs
                );
                return MonitorExit::Expired {
                    idle_secs: state.accumulated_idle_secs,
                };
            }
        }
    }
}
