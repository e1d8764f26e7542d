//! Visible fish count against the expected count.
//!
//! Fish are counted as foreground blobs against a slowly learned background.
//! The count is noisy frame to frame (fish overlap, hide behind decor), so the
//! detector compares the most frequent count over a short window.

use super::{Detector, DetectorError, DetectorSettings};
use crate::alert::{AlertKind, DetectionSignal};
use crate::analysis::{BackgroundModel, LumaGrid, ModeWindow, Sustained, Warmup};
use crate::buffer::HistoryView;
use crate::frame::Frame;

const BACKGROUND_LEARNING_RATE: f32 = 0.01;

/// Frames the stable count is taken over.
const COUNT_WINDOW: usize = 30;

/// Smallest blob, in grid cells, counted as a fish.
const MIN_BLOB_CELLS: usize = 1;

pub struct CountChangeDetector {
    expected: u32,
    background: BackgroundModel,
    counts: ModeWindow,
    warmup: Warmup,
    sustained: Sustained,
    shape: Option<(u32, u32)>,
}

impl CountChangeDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            expected: settings.expected_fish,
            background: BackgroundModel::new(BACKGROUND_LEARNING_RATE),
            counts: ModeWindow::new(COUNT_WINDOW),
            warmup: Warmup::new(settings.warmup),
            sustained: Sustained::from_secs(settings.count_sustain_secs),
            shape: None,
        }
    }
}

impl Detector for CountChangeDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::CountChange
    }

    fn analyze(
        &mut self,
        frame: &Frame,
        _history: &HistoryView<'_>,
    ) -> Result<Vec<DetectionSignal>, DetectorError> {
        let shape = (frame.width, frame.height);
        match self.shape.replace(shape) {
            Some(expected) if expected != shape => {
                // the learned background is useless at another resolution
                self.background.reset();
                return Err(DetectorError::FrameMismatch {
                    expected,
                    actual: shape,
                });
            }
            _ => {}
        }

        let grid = LumaGrid::from_frame(frame);
        let visible = self.background.apply(&grid).blobs(MIN_BLOB_CELLS).len();
        self.counts.push(visible);

        if !self.warmup.observe(frame.timestamp) {
            return Ok(Vec::new());
        }

        let Some(stable) = self.counts.mode() else {
            return Ok(Vec::new());
        };
        let expected = self.expected as usize;
        let deviates = stable != expected;

        let Some(held) = self.sustained.update(deviates, frame.timestamp) else {
            return Ok(Vec::new());
        };

        let difference = stable.abs_diff(expected) as f32;
        Ok(vec![DetectionSignal::new(
            self.kind(),
            difference / expected.max(1) as f32,
            format!(
                "Expected {} fish, counting {} for {:.0}s",
                expected,
                stable,
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
    use crate::buffer::RollingBuffer;
    use crate::detector::{run_frames, test_settings};
    use crate::test_support::{frame_with, solid_frame};
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_expected_count_is_quiet() {
        let mut detector = CountChangeDetector::new(&test_settings());
        let frames = (0..20u64).map(|t| {
            if t == 0 {
                solid_frame(t, 0.0, 0)
            } else {
                frame_with(t, t as f64, 0, &[(3, 3, 3, 255), (20, 14, 3, 255)])
            }
        });
        assert!(run_frames(&mut detector, frames).is_empty());
    }

    #[test]
    fn test_missing_fish_reported() {
        let mut detector = CountChangeDetector::new(&test_settings());
        let frames = (0..20u64).map(|t| {
            if t == 0 {
                solid_frame(t, 0.0, 0)
            } else {
                frame_with(t, t as f64, 0, &[(3, 3, 3, 255)])
            }
        });

        let signals = run_frames(&mut detector, frames);
        assert_eq!(signals.len(), 1);
        // deviation visible once warm at t=5, sustained for 5s
        assert_eq!(signals[0].timestamp, Duration::from_secs(10));
        assert_eq!(signals[0].evidence, "Expected 2 fish, counting 1 for 5s");
        assert_eq!(signals[0].severity, 0.5);
    }

    #[test]
    fn test_resolution_change_is_an_error() {
        let mut detector = CountChangeDetector::new(&test_settings());
        let buffer = RollingBuffer::new(Duration::from_secs(10));

        let first = solid_frame(0, 0.0, 0);
        buffer.push(first.clone()).unwrap();
        assert!(detector.analyze(&first, &buffer.history()).is_ok());

        let small = Frame::new(1, Duration::from_secs(1), Utc::now(), 4, 4, vec![0u8; 48]).unwrap();
        buffer.push(small.clone()).unwrap();
        assert!(matches!(
            detector.analyze(&small, &buffer.history()),
            Err(DetectorError::FrameMismatch { .. })
        ));
    }
}
