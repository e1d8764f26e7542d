//! Detectors looking at where in the tank the activity happens.

use super::{Detector, DetectorError, DetectorSettings};
use crate::alert::{AlertKind, DetectionSignal};
use crate::analysis::{MotionTracker, Sustained};
use crate::buffer::HistoryView;
use crate::frame::Frame;

/// Active share of the surface zone that counts as surface activity.
const SURFACE_ACTIVITY_PERCENT: f32 = 5.0;

/// Share of all activity in one region that counts as clustering.
const CLUSTER_SHARE: f32 = 0.7;

/// Activity below this percentage is too sparse to judge clustering.
const CLUSTER_MIN_ACTIVITY_PERCENT: f32 = 1.0;

const REGION_NAMES: [&str; 9] = [
    "upper-left",
    "upper-centre",
    "upper-right",
    "middle-left",
    "centre",
    "middle-right",
    "lower-left",
    "lower-centre",
    "lower-right",
];

/// Reports prolonged activity in the surface zone (gasping, jumping).
pub struct SurfaceActivityDetector {
    tracker: MotionTracker,
    zone_percent: u8,
    threshold_percent: f32,
    sustained: Sustained,
}

impl SurfaceActivityDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            tracker: MotionTracker::new(),
            zone_percent: settings.surface_zone_percent,
            threshold_percent: SURFACE_ACTIVITY_PERCENT * settings.scale,
            sustained: Sustained::from_secs(settings.surface_sustain_secs),
        }
    }
}

impl Detector for SurfaceActivityDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::SurfaceActivity
    }

    fn analyze(
        &mut self,
        frame: &Frame,
        history: &HistoryView<'_>,
    ) -> Result<Vec<DetectionSignal>, DetectorError> {
        let Some(mask) = self.tracker.observe(frame, history) else {
            return Ok(Vec::new());
        };

        let zone_activity = mask.rows_percent(0, mask.top_rows(self.zone_percent));
        let active = zone_activity > self.threshold_percent;

        let Some(held) = self.sustained.update(active, frame.timestamp) else {
            return Ok(Vec::new());
        };

        Ok(vec![DetectionSignal::new(
            self.kind(),
            zone_activity / 100.0,
            format!(
                "Activity in the top {}% of the tank for {:.0}s ({:.1}% of the zone moving)",
                self.zone_percent,
                held.as_secs_f64(),
                zone_activity
            ),
            frame.timestamp,
            frame.captured_at,
        )])
    }
}

/// Reports activity that stays concentrated in one region of the tank.
pub struct ClusteringDetector {
    tracker: MotionTracker,
    share: f32,
    sustained: Sustained,
}

impl ClusteringDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            tracker: MotionTracker::new(),
            share: (CLUSTER_SHARE * settings.scale).clamp(0.34, 1.0),
            sustained: Sustained::from_secs(settings.cluster_sustain_secs),
        }
    }
}

impl Detector for ClusteringDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::Clustering
    }

    fn analyze(
        &mut self,
        frame: &Frame,
        history: &HistoryView<'_>,
    ) -> Result<Vec<DetectionSignal>, DetectorError> {
        let Some(mask) = self.tracker.observe(frame, history) else {
            return Ok(Vec::new());
        };

        let regions = mask.region_counts(3);
        let total: usize = regions.iter().sum();
        let (densest, count) = regions
            .iter()
            .copied()
            .enumerate()
            .max_by_key(|(_, count)| *count)
            .unwrap_or((0, 0));

        let concentration = if total == 0 {
            0.0
        } else {
            count as f32 / total as f32
        };
        let clustered =
            mask.activity_percent() >= CLUSTER_MIN_ACTIVITY_PERCENT && concentration >= self.share;

        let Some(held) = self.sustained.update(clustered, frame.timestamp) else {
            return Ok(Vec::new());
        };

        Ok(vec![DetectionSignal::new(
            self.kind(),
            concentration,
            format!(
                "{:.0}% of activity in the {} region for {:.0}s",
                concentration * 100.0,
                REGION_NAMES[densest],
                held.as_secs_f64()
            ),
            frame.timestamp,
            frame.captured_at,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{run_frames, test_settings};
    use crate::test_support::frame_with;
    use std::time::Duration;

    fn flicker(t: u64) -> u8 {
        if t % 2 == 0 {
            0
        } else {
            255
        }
    }

    #[test]
    fn test_surface_activity_sustained() {
        let mut detector = SurfaceActivityDetector::new(&test_settings());
        let frames = (0..12u64).map(|t| {
            let squares: Vec<_> = (0..11).map(|i| (i * 3, 0, 3, flicker(t))).collect();
            frame_with(t, t as f64, 0, &squares)
        });

        let signals = run_frames(&mut detector, frames);
        assert_eq!(signals.len(), 1);
        // active from t=1, sustained for 5s
        assert_eq!(signals[0].timestamp, Duration::from_secs(6));
        assert!(signals[0].evidence.contains("top 15%"));
    }

    #[test]
    fn test_surface_ignores_bottom_activity() {
        let mut detector = SurfaceActivityDetector::new(&test_settings());
        let frames = (0..12u64).map(|t| {
            let squares: Vec<_> = (0..11).map(|i| (i * 3, 20, 3, flicker(t))).collect();
            frame_with(t, t as f64, 0, &squares)
        });
        assert!(run_frames(&mut detector, frames).is_empty());
    }

    #[test]
    fn test_clustering_in_one_corner() {
        let mut detector = ClusteringDetector::new(&test_settings());
        let frames = (0..10u64).map(|t| frame_with(t, t as f64, 0, &[(2, 18, 4, flicker(t))]));

        let signals = run_frames(&mut detector, frames);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].timestamp, Duration::from_secs(6));
        assert!(signals[0].evidence.contains("lower-left"));
        assert_eq!(signals[0].severity, 1.0);
    }

    #[test]
    fn test_spread_activity_not_clustered() {
        let mut detector = ClusteringDetector::new(&test_settings());
        let frames = (0..10u64).map(|t| {
            frame_with(t, t as f64, 0, &[(2, 18, 4, flicker(t)), (26, 2, 4, flicker(t))])
        });
        assert!(run_frames(&mut detector, frames).is_empty());
    }
}
