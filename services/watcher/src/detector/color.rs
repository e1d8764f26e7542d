//! Water colour drift (cloudiness, algae bloom, tannins).

use super::{Detector, DetectorError, DetectorSettings};
use crate::alert::{AlertKind, DetectionSignal};
use crate::analysis::{ColorSignature, Sustained, Warmup};
use crate::buffer::HistoryView;
use crate::frame::Frame;

/// Histogram drift treated as a colour change at nominal sensitivity.
const HISTOGRAM_DRIFT: f32 = 0.35;

/// Adaptation rate of the baseline while the water looks normal.
const BASELINE_ADAPT_RATE: f32 = 0.001;

/// Compares the centre of the frame against a colour baseline learned during
/// warm-up.
pub struct WaterColorDetector {
    warmup: Warmup,
    samples: Vec<ColorSignature>,
    baseline: Option<ColorSignature>,
    mean_threshold: f32,
    drift_threshold: f32,
    sustained: Sustained,
}

impl WaterColorDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            warmup: Warmup::new(settings.warmup),
            samples: Vec::new(),
            baseline: None,
            mean_threshold: settings.color_change_threshold * settings.scale,
            drift_threshold: HISTOGRAM_DRIFT * settings.scale,
            sustained: Sustained::from_secs(settings.color_sustain_secs),
        }
    }
}

impl Detector for WaterColorDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::WaterColorChange
    }

    fn analyze(
        &mut self,
        frame: &Frame,
        _history: &HistoryView<'_>,
    ) -> Result<Vec<DetectionSignal>, DetectorError> {
        let signature = ColorSignature::from_frame(frame);

        if self.baseline.is_none() {
            let learned = self.warmup.observe(frame.timestamp);
            self.samples.push(signature);
            if learned {
                let samples = std::mem::take(&mut self.samples);
                let average = ColorSignature::average(&samples).ok_or_else(|| {
                    DetectorError::Analysis("no colour samples collected".to_string())
                })?;
                self.baseline = Some(average);
            }
            return Ok(Vec::new());
        }
        let Some(baseline) = self.baseline.as_mut() else {
            return Ok(Vec::new());
        };

        let distance = signature.mean_distance(baseline);
        let drift = signature.histogram_drift(baseline);
        let changed = distance > self.mean_threshold || drift > self.drift_threshold;

        if !changed {
            baseline.blend(&signature, BASELINE_ADAPT_RATE);
        }

        let Some(held) = self.sustained.update(changed, frame.timestamp) else {
            return Ok(Vec::new());
        };

        let [r, g, b] = signature.mean;
        let [br, bg, bb] = baseline.mean;
        Ok(vec![DetectionSignal::new(
            self.kind(),
            (distance / (self.mean_threshold * 2.0)).max(drift),
            format!(
                "Water colour shifted for {:.0}s: mean RGB ({:.0}, {:.0}, {:.0}) vs baseline ({:.0}, {:.0}, {:.0}), histogram drift {:.2}",
                held.as_secs_f64(),
                r,
                g,
                b,
                br,
                bg,
                bb,
                drift
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
    use crate::test_support::color_frame;
    use std::time::Duration;

    #[test]
    fn test_colour_change_after_warmup() {
        let mut detector = WaterColorDetector::new(&test_settings());
        let frames = (0..16u64).map(|t| {
            let rgb = if t < 6 { [30, 80, 120] } else { [90, 110, 60] };
            color_frame(t, t as f64, rgb)
        });

        let signals = run_frames(&mut detector, frames);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].timestamp, Duration::from_secs(11));
        assert_eq!(signals[0].severity, 1.0);
        assert!(signals[0].evidence.contains("baseline (30, 80, 120)"));
    }

    #[test]
    fn test_small_lighting_shift_ignored() {
        let mut detector = WaterColorDetector::new(&test_settings());
        let frames = (0..30u64).map(|t| {
            let rgb = if t < 6 { [30, 80, 120] } else { [33, 83, 123] };
            color_frame(t, t as f64, rgb)
        });
        assert!(run_frames(&mut detector, frames).is_empty());
    }

    #[test]
    fn test_short_change_not_reported() {
        let mut detector = WaterColorDetector::new(&test_settings());
        // four seconds of murk, then clear again
        let frames = (0..30u64).map(|t| {
            let rgb = if (10..14).contains(&t) { [90, 110, 60] } else { [30, 80, 120] };
            color_frame(t, t as f64, rgb)
        });
        assert!(run_frames(&mut detector, frames).is_empty());
    }
}
