//! Alert kinds, raw detection signals and confirmed alert events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Kind of condition a detector reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Fish inactive for longer than the no-motion threshold
    NoMotion,
    /// Activity far above the learned baseline
    MotionSpike,
    /// Water colour drifted away from its baseline (cloudiness, algae)
    WaterColorChange,
    /// Prolonged activity near the water surface
    SurfaceActivity,
    /// Activity concentrated in one part of the tank
    Clustering,
    /// Visible fish count differs from the expected count
    CountChange,
    /// Feeding frenzy, reported as a cool moment
    FeedingFrenzy,
}

impl AlertKind {
    /// Every built-in kind, in registration order.
    pub const ALL: [AlertKind; 7] = [
        AlertKind::NoMotion,
        AlertKind::MotionSpike,
        AlertKind::WaterColorChange,
        AlertKind::SurfaceActivity,
        AlertKind::Clustering,
        AlertKind::CountChange,
        AlertKind::FeedingFrenzy,
    ];

    /// Stable identifier used in file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::NoMotion => "no_motion",
            AlertKind::MotionSpike => "motion_spike",
            AlertKind::WaterColorChange => "water_color_change",
            AlertKind::SurfaceActivity => "surface_activity",
            AlertKind::Clustering => "clustering",
            AlertKind::CountChange => "count_change",
            AlertKind::FeedingFrenzy => "feeding_frenzy",
        }
    }

    /// Positive moments get different framing downstream.
    pub fn is_cool_moment(&self) -> bool {
        matches!(self, AlertKind::FeedingFrenzy)
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output of a detector for the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSignal {
    pub kind: AlertKind,

    /// Confidence or severity in `0.0..=1.0`
    pub severity: f32,

    /// Short human readable evidence
    pub evidence: String,

    /// Stream timestamp of the frame that produced the signal
    pub timestamp: Duration,

    /// Wall-clock time of that frame
    pub captured_at: DateTime<Utc>,
}

impl DetectionSignal {
    pub fn new(
        kind: AlertKind,
        severity: f32,
        evidence: impl Into<String>,
        timestamp: Duration,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            severity: severity.clamp(0.0, 1.0),
            evidence: evidence.into(),
            timestamp,
            captured_at,
        }
    }
}

/// A confirmed, de-duplicated alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub tank_id: String,
    pub kind: AlertKind,
    pub is_cool_moment: bool,

    /// Stream timestamp of the triggering frame
    #[serde(with = "duration_secs")]
    pub triggered_at: Duration,

    /// Wall-clock time of the triggering frame
    pub triggered_wall: DateTime<Utc>,

    /// Registry key the cooldown was recorded under
    pub cooldown_key: String,

    pub severity: f32,
    pub evidence: String,
}

impl AlertEvent {
    /// Build an event from the signal that fired it.
    pub fn from_signal(tank_id: &str, signal: &DetectionSignal) -> Self {
        Self {
            id: Uuid::new_v4(),
            tank_id: tank_id.to_string(),
            kind: signal.kind,
            is_cool_moment: signal.kind.is_cool_moment(),
            triggered_at: signal.timestamp,
            triggered_wall: signal.captured_at,
            cooldown_key: format!("{}:{}", tank_id, signal.kind),
            severity: signal.severity,
            evidence: signal.evidence.clone(),
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
