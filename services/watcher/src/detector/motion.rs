//! Whole-frame activity detectors: stillness, spikes and feeding frenzies.

use super::{Detector, DetectorError, DetectorSettings};
use crate::alert::{AlertKind, DetectionSignal};
use crate::analysis::{Ema, MotionTracker, Sustained, Warmup};
use crate::buffer::HistoryView;
use crate::frame::Frame;

/// Activity percentage below which the tank counts as still.
const STILL_ACTIVITY_PERCENT: f32 = 5.0;

/// Baseline multiple treated as a spike.
const SPIKE_FACTOR: f64 = 3.0;

/// Activity percentage a spike must exceed even on a dead-calm baseline.
const SPIKE_FLOOR_PERCENT: f64 = 2.0;

/// Baseline multiple for a feeding frenzy.
const FRENZY_FACTOR: f64 = 2.0;

/// Activity percentage a frenzy must exceed.
const FRENZY_FLOOR_PERCENT: f64 = 8.0;

/// Share of activity that must sit in the upper part of the tank.
const FRENZY_TOP_SHARE: f32 = 0.4;

const BASELINE_ALPHA: f64 = 0.05;

/// Reports fish that have not moved for the configured threshold.
pub struct NoMotionDetector {
    tracker: MotionTracker,
    threshold_percent: f32,
    still: Sustained,
}

impl NoMotionDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            tracker: MotionTracker::new(),
            threshold_percent: STILL_ACTIVITY_PERCENT * settings.scale,
            still: Sustained::new(settings.no_motion_threshold),
        }
    }
}

impl Detector for NoMotionDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::NoMotion
    }

    fn analyze(
        &mut self,
        frame: &Frame,
        history: &HistoryView<'_>,
    ) -> Result<Vec<DetectionSignal>, DetectorError> {
        // the first frame has nothing to differ from and counts as still
        let activity = self
            .tracker
            .observe(frame, history)
            .map(|mask| mask.activity_percent())
            .unwrap_or(0.0);

        let still = activity < self.threshold_percent;
        let Some(held) = self.still.update(still, frame.timestamp) else {
            return Ok(Vec::new());
        };

        let ratio = held.as_secs_f32() / self.still.min().as_secs_f32().max(1.0);
        Ok(vec![DetectionSignal::new(
            self.kind(),
            ratio.min(1.0),
            format!(
                "No significant motion for {:.0}s (activity {:.1}% < {:.1}%)",
                held.as_secs_f64(),
                activity,
                self.threshold_percent
            ),
            frame.timestamp,
            frame.captured_at,
        )])
    }
}

/// Reports activity far above the learned baseline.
pub struct MotionSpikeDetector {
    tracker: MotionTracker,
    baseline: Ema,
    warmup: Warmup,
    factor: f64,
    sustained: Sustained,
}

impl MotionSpikeDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            tracker: MotionTracker::new(),
            baseline: Ema::new(BASELINE_ALPHA),
            warmup: Warmup::new(settings.warmup),
            factor: SPIKE_FACTOR * f64::from(settings.scale),
            sustained: Sustained::from_secs(settings.spike_sustain_secs),
        }
    }
}

impl Detector for MotionSpikeDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::MotionSpike
    }

    fn analyze(
        &mut self,
        frame: &Frame,
        history: &HistoryView<'_>,
    ) -> Result<Vec<DetectionSignal>, DetectorError> {
        let Some(mask) = self.tracker.observe(frame, history) else {
            return Ok(Vec::new());
        };
        let activity = f64::from(mask.activity_percent());
        let learned = self.warmup.observe(frame.timestamp);

        let baseline = self.baseline.value().unwrap_or(activity);
        let threshold = (baseline * self.factor).max(SPIKE_FLOOR_PERCENT);
        let spiking = learned && activity > threshold;

        // the baseline only learns from normal behaviour
        if !spiking {
            self.baseline.update(activity);
        }

        if self.sustained.update(spiking, frame.timestamp).is_none() {
            return Ok(Vec::new());
        }

        Ok(vec![DetectionSignal::new(
            self.kind(),
            (activity / (threshold * 2.0)).min(1.0) as f32,
            format!(
                "Activity {:.1}% against a baseline of {:.1}% (threshold {:.1}%)",
                activity, baseline, threshold
            ),
            frame.timestamp,
            frame.captured_at,
        )])
    }
}

/// Reports sudden, sustained activity concentrated near the surface.
pub struct FeedingFrenzyDetector {
    tracker: MotionTracker,
    baseline: Ema,
    warmup: Warmup,
    factor: f64,
    top_percent: u8,
    sustained: Sustained,
}

impl FeedingFrenzyDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            tracker: MotionTracker::new(),
            baseline: Ema::new(BASELINE_ALPHA),
            warmup: Warmup::new(settings.warmup),
            factor: FRENZY_FACTOR * f64::from(settings.scale),
            // food lands on the surface, fish chase it a little lower
            top_percent: settings.surface_zone_percent.saturating_mul(2).min(100),
            sustained: Sustained::from_secs(settings.frenzy_sustain_secs),
        }
    }
}

impl Detector for FeedingFrenzyDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::FeedingFrenzy
    }

    fn analyze(
        &mut self,
        frame: &Frame,
        history: &HistoryView<'_>,
    ) -> Result<Vec<DetectionSignal>, DetectorError> {
        let Some(mask) = self.tracker.observe(frame, history) else {
            return Ok(Vec::new());
        };
        let activity = f64::from(mask.activity_percent());
        let learned = self.warmup.observe(frame.timestamp);

        let active = mask.active_count();
        let top_share = if active == 0 {
            0.0
        } else {
            mask.active_in_rows(0, mask.top_rows(self.top_percent)) as f32 / active as f32
        };

        let baseline = self.baseline.value().unwrap_or(activity);
        let threshold = (baseline * self.factor).max(FRENZY_FLOOR_PERCENT);
        let frenzy = learned && activity > threshold && top_share >= FRENZY_TOP_SHARE;

        if !frenzy {
            self.baseline.update(activity);
        }

        let Some(held) = self.sustained.update(frenzy, frame.timestamp) else {
            return Ok(Vec::new());
        };

        Ok(vec![DetectionSignal::new(
            self.kind(),
            (activity / 100.0).max(f64::from(top_share) * 0.5) as f32,
            format!(
                "Feeding frenzy: {:.1}% activity for {:.1}s, {:.0}% of it in the upper tank",
                activity,
                held.as_secs_f64(),
                top_share * 100.0
            ),
            frame.timestamp,
            frame.captured_at,
        )])
    }
}
