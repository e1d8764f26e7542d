//! Alert debouncing.
//!
//! The arbiter turns raw detection signals into alert events, allowing at
//! most one event per kind per cooldown window. The firing time is recorded
//! before the event is returned, so a slow recording or notification can
//! never let a duplicate through.

use crate::alert::{AlertEvent, AlertKind, DetectionSignal};
use crate::config::AlertConfig;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Cooldown state of one alert kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    /// The next signal of this kind fires
    Quiet,
    /// Fired recently; signals are dropped until the cooldown elapses
    Fired { remaining: Duration },
}

#[derive(Debug, Default, Clone, Copy)]
struct KindEntry {
    last_fired: Option<Duration>,
    fired: u64,
    suppressed: u64,
}

/// Per-tank, per-kind cooldown registry.
pub struct AlertArbiter {
    tank_id: String,
    alerts: AlertConfig,
    registry: HashMap<AlertKind, KindEntry>,
}

impl AlertArbiter {
    pub fn new(tank_id: impl Into<String>, alerts: AlertConfig) -> Self {
        Self {
            tank_id: tank_id.into(),
            alerts,
            registry: HashMap::new(),
        }
    }

    /// Decide whether `signal` becomes an event.
    pub fn consider(&mut self, signal: &DetectionSignal) -> Option<AlertEvent> {
        let cooldown = self.alerts.cooldown_for(signal.kind);
        let entry = self.registry.entry(signal.kind).or_default();

        if let Some(last) = entry.last_fired {
            let elapsed = signal.timestamp.saturating_sub(last);
            if signal.timestamp < last || elapsed < cooldown {
                entry.suppressed += 1;
                metrics::counter!(
                    "tankwatch_alerts_suppressed_total",
                    "tank" => self.tank_id.clone(),
                    "kind" => signal.kind.as_str()
                )
                .increment(1);
                debug!(
                    tank_id = %self.tank_id,
                    kind = %signal.kind,
                    remaining_secs = (cooldown - elapsed).as_secs_f64(),
                    "Signal suppressed by cooldown"
                );
                return None;
            }
        }

        entry.last_fired = Some(signal.timestamp);
        entry.fired += 1;

        let event = AlertEvent::from_signal(&self.tank_id, signal);
        metrics::counter!(
            "tankwatch_alerts_fired_total",
            "tank" => self.tank_id.clone(),
            "kind" => signal.kind.as_str()
        )
        .increment(1);
        info!(
            tank_id = %self.tank_id,
            event_id = %event.id,
            kind = %event.kind,
            cool_moment = event.is_cool_moment,
            severity = event.severity,
            triggered_at = event.triggered_at.as_secs_f64(),
            evidence = %event.evidence,
            "Alert fired"
        );
        Some(event)
    }

    /// Consider every signal from one tick, in order.
    pub fn consider_all(&mut self, signals: &[DetectionSignal]) -> Vec<AlertEvent> {
        signals.iter().filter_map(|s| self.consider(s)).collect()
    }

    /// Cooldown state of `kind` at stream time `now`.
    pub fn state(&self, kind: AlertKind, now: Duration) -> ArbiterState {
        let cooldown = self.alerts.cooldown_for(kind);
        match self.registry.get(&kind).and_then(|e| e.last_fired) {
            Some(last) if now.saturating_sub(last) < cooldown => ArbiterState::Fired {
                remaining: cooldown - now.saturating_sub(last),
            },
            _ => ArbiterState::Quiet,
        }
    }

    /// Signals of `kind` dropped by the cooldown so far.
    pub fn suppressed(&self, kind: AlertKind) -> u64 {
        self.registry.get(&kind).map_or(0, |e| e.suppressed)
    }

    /// Events of `kind` fired so far.
    pub fn fired(&self, kind: AlertKind) -> u64 {
        self.registry.get(&kind).map_or(0, |e| e.fired)
    }

    /// Total events fired across kinds.
    pub fn total_fired(&self) -> u64 {
        self.registry.values().map(|e| e.fired).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_epoch;

    fn signal(kind: AlertKind, secs: u64) -> DetectionSignal {
        DetectionSignal::new(kind, 0.8, "test", Duration::from_secs(secs), test_epoch())
    }

    fn arbiter(cooldown_secs: u64) -> AlertArbiter {
        AlertArbiter::new(
            "reef",
            AlertConfig {
                cooldown_secs,
                per_kind: HashMap::new(),
            },
        )
    }

    #[test]
    fn test_cooldown_drops_and_refires() {
        let mut arbiter = arbiter(60);
        assert!(arbiter.consider(&signal(AlertKind::MotionSpike, 0)).is_some());
        assert!(arbiter.consider(&signal(AlertKind::MotionSpike, 30)).is_none());
        assert!(arbiter.consider(&signal(AlertKind::MotionSpike, 65)).is_some());

        assert_eq!(arbiter.fired(AlertKind::MotionSpike), 2);
        assert_eq!(arbiter.suppressed(AlertKind::MotionSpike), 1);
    }

    #[test]
    fn test_cooldown_boundary_inclusive() {
        let mut arbiter = arbiter(60);
        assert!(arbiter.consider(&signal(AlertKind::NoMotion, 10)).is_some());
        assert!(arbiter.consider(&signal(AlertKind::NoMotion, 69)).is_none());
        assert!(arbiter.consider(&signal(AlertKind::NoMotion, 70)).is_some());
    }

    #[test]
    fn test_kinds_independent_in_same_tick() {
        let mut arbiter = arbiter(60);
        let events = arbiter.consider_all(&[
            signal(AlertKind::MotionSpike, 5),
            signal(AlertKind::SurfaceActivity, 5),
            signal(AlertKind::FeedingFrenzy, 5),
        ]);
        assert_eq!(events.len(), 3);
        assert!(events[2].is_cool_moment);
        assert!(!events[0].is_cool_moment);
        assert_eq!(events[1].cooldown_key, "reef:surface_activity");
    }

    #[test]
    fn test_per_kind_override() {
        let mut alerts = AlertConfig {
            cooldown_secs: 60,
            per_kind: HashMap::new(),
        };
        alerts.per_kind.insert(AlertKind::FeedingFrenzy, 10);
        let mut arbiter = AlertArbiter::new("reef", alerts);

        assert!(arbiter.consider(&signal(AlertKind::FeedingFrenzy, 0)).is_some());
        assert!(arbiter.consider(&signal(AlertKind::FeedingFrenzy, 10)).is_some());
        assert!(arbiter.consider(&signal(AlertKind::MotionSpike, 0)).is_some());
        assert!(arbiter.consider(&signal(AlertKind::MotionSpike, 10)).is_none());
    }

    #[test]
    fn test_state_query() {
        let mut arbiter = arbiter(60);
        let at = Duration::from_secs;
        assert_eq!(arbiter.state(AlertKind::Clustering, at(0)), ArbiterState::Quiet);

        arbiter.consider(&signal(AlertKind::Clustering, 100));
        assert_eq!(
            arbiter.state(AlertKind::Clustering, at(120)),
            ArbiterState::Fired { remaining: at(40) }
        );
        assert_eq!(arbiter.state(AlertKind::Clustering, at(160)), ArbiterState::Quiet);
        assert_eq!(arbiter.total_fired(), 1);
    }

    #[test]
    fn test_zero_cooldown_fires_every_signal() {
        let mut arbiter = arbiter(0);
        for t in 0..5 {
            assert!(arbiter.consider(&signal(AlertKind::CountChange, t)).is_some());
        }
    }
}
