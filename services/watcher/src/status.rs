//! Per-tank health and counters.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::info;

/// Lifecycle state of a tank runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Running,
    Reconnecting,
    /// No frame within the stall window
    Stalled,
    /// Source could not be acquired; the runner has stopped
    Failed,
    Stopped,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Running => "running",
            HealthState::Reconnecting => "reconnecting",
            HealthState::Stalled => "stalled",
            HealthState::Failed => "failed",
            HealthState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one tank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TankStatus {
    pub tank_id: String,
    pub tank_name: String,
    pub state: HealthState,
    pub frames_ingested: u64,
    pub frames_dropped: u64,
    pub alerts_fired: u64,
    pub clips_written: u64,
    pub clips_failed: u64,
    pub clips_in_flight: usize,
    pub reconnects: u32,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Live counters shared between a runner and whoever watches it.
#[derive(Debug)]
pub struct TankHealth {
    tank_id: String,
    tank_name: String,
    state: RwLock<HealthState>,
    last_frame_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    frames_ingested: AtomicU64,
    frames_dropped: AtomicU64,
    alerts_fired: AtomicU64,
    clips_written: AtomicU64,
    clips_failed: AtomicU64,
    clips_in_flight: AtomicUsize,
    reconnects: AtomicU32,
}

impl TankHealth {
    pub fn new(tank_id: impl Into<String>, tank_name: impl Into<String>) -> Self {
        Self {
            tank_id: tank_id.into(),
            tank_name: tank_name.into(),
            state: RwLock::new(HealthState::Starting),
            last_frame_at: RwLock::new(None),
            last_error: RwLock::new(None),
            frames_ingested: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            alerts_fired: AtomicU64::new(0),
            clips_written: AtomicU64::new(0),
            clips_failed: AtomicU64::new(0),
            clips_in_flight: AtomicUsize::new(0),
            reconnects: AtomicU32::new(0),
        }
    }

    pub fn tank_id(&self) -> &str {
        &self.tank_id
    }

    pub fn state(&self) -> HealthState {
        *self.state.read()
    }

    /// Move to `next`, logging the transition if it is one.
    pub fn set_state(&self, next: HealthState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            info!(
                tank_id = %self.tank_id,
                from = %previous,
                to = %next,
                "Tank state changed"
            );
        }
    }

    pub fn fail(&self, error: impl Into<String>) {
        self.set_error(error);
        self.set_state(HealthState::Failed);
    }

    pub fn set_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
    }

    pub fn record_frame(&self, captured_at: DateTime<Utc>) {
        self.frames_ingested.fetch_add(1, Ordering::Relaxed);
        *self.last_frame_at.write() = Some(captured_at);
    }

    pub fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert(&self) {
        self.alerts_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clip_started(&self) {
        self.clips_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// A clip job ended, successfully or not.
    pub fn clip_finished(&self, written: bool) {
        // saturating: a panicked runner may never have counted the start
        let _ = self
            .clips_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if written {
            self.clips_written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.clips_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TankStatus {
        TankStatus {
            tank_id: self.tank_id.clone(),
            tank_name: self.tank_name.clone(),
            state: self.state(),
            frames_ingested: self.frames_ingested.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
            clips_written: self.clips_written.load(Ordering::Relaxed),
            clips_failed: self.clips_failed.load(Ordering::Relaxed),
            clips_in_flight: self.clips_in_flight.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_frame_at: *self.last_frame_at.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}
