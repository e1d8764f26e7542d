//! Detectors turn the current frame plus buffered history into raw signals.
//!
//! Each detector keeps its own private state (baselines, hysteresis) and is
//! only ever driven by one tank's runner. A [`DetectorSet`] runs every
//! registered detector on each frame and keeps one misbehaving detector from
//! taking the others down with it.

mod color;
mod count;
mod motion;
mod zone;

pub use color::WaterColorDetector;
pub use count::CountChangeDetector;
pub use motion::{FeedingFrenzyDetector, MotionSpikeDetector, NoMotionDetector};
pub use zone::{ClusteringDetector, SurfaceActivityDetector};

use crate::alert::{AlertKind, DetectionSignal};
use crate::analysis::sensitivity_scale;
use crate::buffer::HistoryView;
use crate::config::{DetectionConfig, FishConfig};
use crate::frame::Frame;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors raised by a single detector for a single frame.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Frame size changed from {expected:?} to {actual:?}")]
    FrameMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Analysis failed: {0}")]
    Analysis(String),
}

/// A frame analyzer producing zero or more signals per frame.
pub trait Detector: Send {
    /// Kind of signal this detector reports.
    fn kind(&self) -> AlertKind;

    /// Analyze `frame`; `history` holds the buffered frames, newest last.
    fn analyze(
        &mut self,
        frame: &Frame,
        history: &HistoryView<'_>,
    ) -> Result<Vec<DetectionSignal>, DetectorError>;
}

/// Thresholds shared by the built-in detectors, derived from tank config.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Multiplier applied to every nominal threshold
    pub scale: f32,
    pub warmup: Duration,
    pub no_motion_threshold: Duration,
    pub color_change_threshold: f32,
    pub surface_zone_percent: u8,
    pub spike_sustain_secs: f64,
    pub surface_sustain_secs: f64,
    pub color_sustain_secs: f64,
    pub cluster_sustain_secs: f64,
    pub count_sustain_secs: f64,
    pub frenzy_sustain_secs: f64,
    pub expected_fish: u32,
}

impl DetectorSettings {
    pub fn new(detection: &DetectionConfig, fish: &FishConfig) -> Self {
        Self {
            scale: sensitivity_scale(detection.motion_sensitivity),
            warmup: Duration::from_secs(detection.baseline_warmup_secs),
            no_motion_threshold: Duration::from_secs(detection.no_motion_threshold_secs),
            color_change_threshold: detection.color_change_threshold,
            surface_zone_percent: detection.surface_zone_percent,
            spike_sustain_secs: detection.spike_sustain_secs,
            surface_sustain_secs: detection.surface_sustain_secs,
            color_sustain_secs: detection.color_sustain_secs,
            cluster_sustain_secs: detection.cluster_sustain_secs,
            count_sustain_secs: detection.count_sustain_secs,
            frenzy_sustain_secs: detection.frenzy_sustain_secs,
            expected_fish: fish.count,
        }
    }
}

/// Ordered collection of detectors run on every frame.
#[derive(Default)]
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the built-in detectors enabled for a tank.
    pub fn from_config(detection: &DetectionConfig, fish: &FishConfig) -> Self {
        let settings = DetectorSettings::new(detection, fish);
        let mut set = Self::new();

        for kind in AlertKind::ALL {
            if !detection.enabled.contains(&kind) {
                continue;
            }
            match built_in(kind, &settings) {
                Some(detector) => set.register(detector),
                None => info!(kind = %kind, "Detector skipped, no expected fish count configured"),
            }
        }

        set
    }

    pub fn register(&mut self, detector: Box<dyn Detector>) {
        debug!(kind = %detector.kind(), "Registered detector");
        self.detectors.push(detector);
    }

    /// Kinds of the registered detectors, in registration order.
    pub fn kinds(&self) -> Vec<AlertKind> {
        self.detectors.iter().map(|d| d.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run every detector on `frame`.
    ///
    /// A detector that errors or panics contributes nothing for this frame;
    /// the rest still run.
    pub fn analyze(&mut self, frame: &Frame, history: &HistoryView<'_>) -> Vec<DetectionSignal> {
        let mut signals = Vec::new();

        for detector in self.detectors.iter_mut() {
            let kind = detector.kind();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.analyze(frame, history)));

            match outcome {
                Ok(Ok(found)) => signals.extend(found),
                Ok(Err(e)) => {
                    metrics::counter!("tankwatch_detector_errors_total", "kind" => kind.as_str())
                        .increment(1);
                    warn!(kind = %kind, sequence = frame.sequence, error = %e, "Detector failed");
                }
                Err(_) => {
                    metrics::counter!("tankwatch_detector_errors_total", "kind" => kind.as_str())
                        .increment(1);
                    error!(kind = %kind, sequence = frame.sequence, "Detector panicked");
                }
            }
        }

        signals
    }
}

fn built_in(kind: AlertKind, settings: &DetectorSettings) -> Option<Box<dyn Detector>> {
    let detector: Box<dyn Detector> = match kind {
        AlertKind::NoMotion => Box::new(NoMotionDetector::new(settings)),
        AlertKind::MotionSpike => Box::new(MotionSpikeDetector::new(settings)),
        AlertKind::WaterColorChange => Box::new(WaterColorDetector::new(settings)),
        AlertKind::SurfaceActivity => Box::new(SurfaceActivityDetector::new(settings)),
        AlertKind::Clustering => Box::new(ClusteringDetector::new(settings)),
        AlertKind::CountChange => {
            if settings.expected_fish == 0 {
                return None;
            }
            Box::new(CountChangeDetector::new(settings))
        }
        AlertKind::FeedingFrenzy => Box::new(FeedingFrenzyDetector::new(settings)),
    };
    Some(detector)
}

#[cfg(test)]
pub(crate) fn test_settings() -> DetectorSettings {
    DetectorSettings {
        scale: 1.0,
        warmup: Duration::from_secs(5),
        no_motion_threshold: Duration::from_secs(300),
        color_change_threshold: 15.0,
        surface_zone_percent: 15,
        spike_sustain_secs: 2.0,
        surface_sustain_secs: 5.0,
        color_sustain_secs: 5.0,
        cluster_sustain_secs: 5.0,
        count_sustain_secs: 5.0,
        frenzy_sustain_secs: 3.0,
        expected_fish: 2,
    }
}

/// Drive a detector over frames through a real buffer; returns every signal.
#[cfg(test)]
pub(crate) fn run_frames(
    detector: &mut dyn Detector,
    frames: impl IntoIterator<Item = Frame>,
) -> Vec<DetectionSignal> {
    let buffer = crate::buffer::RollingBuffer::new(Duration::from_secs(10));
    let mut signals = Vec::new();
    for frame in frames {
        buffer.push(frame.clone()).unwrap();
        let history = buffer.history();
        signals.extend(detector.analyze(&frame, &history).unwrap());
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RollingBuffer;
    use crate::test_support::solid_frame;

    struct Exploding;

    impl Detector for Exploding {
        fn kind(&self) -> AlertKind {
            AlertKind::MotionSpike
        }

        fn analyze(&mut self, _: &Frame, _: &HistoryView<'_>) -> Result<Vec<DetectionSignal>, DetectorError> {
            panic!("boom");
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn kind(&self) -> AlertKind {
            AlertKind::Clustering
        }

        fn analyze(&mut self, _: &Frame, _: &HistoryView<'_>) -> Result<Vec<DetectionSignal>, DetectorError> {
            Err(DetectorError::Analysis("nope".to_string()))
        }
    }

    struct Always;

    impl Detector for Always {
        fn kind(&self) -> AlertKind {
            AlertKind::SurfaceActivity
        }

        fn analyze(&mut self, frame: &Frame, _: &HistoryView<'_>) -> Result<Vec<DetectionSignal>, DetectorError> {
            Ok(vec![DetectionSignal::new(
                self.kind(),
                0.5,
                "always",
                frame.timestamp,
                frame.captured_at,
            )])
        }
    }

    #[test]
    fn test_from_config_respects_enabled() {
        let mut detection = DetectionConfig::default();
        detection.enabled = vec![AlertKind::FeedingFrenzy, AlertKind::NoMotion];
        let set = DetectorSet::from_config(&detection, &FishConfig::default());
        // registration follows the built-in order
        assert_eq!(set.kinds(), vec![AlertKind::NoMotion, AlertKind::FeedingFrenzy]);
    }

    #[test]
    fn test_count_detector_needs_expected_count() {
        let detection = DetectionConfig::default();
        let set = DetectorSet::from_config(&detection, &FishConfig::default());
        assert!(!set.kinds().contains(&AlertKind::CountChange));
        assert_eq!(set.len(), AlertKind::ALL.len() - 1);

        let fish = FishConfig {
            count: 3,
            profiles: vec![],
        };
        let set = DetectorSet::from_config(&detection, &fish);
        assert!(set.kinds().contains(&AlertKind::CountChange));
    }

    #[test]
    fn test_failures_isolated() {
        let mut set = DetectorSet::new();
        set.register(Box::new(Exploding));
        set.register(Box::new(Failing));
        set.register(Box::new(Always));

        let buffer = RollingBuffer::new(Duration::from_secs(10));
        let frame = solid_frame(0, 0.0, 0);
        buffer.push(frame.clone()).unwrap();

        let signals = set.analyze(&frame, &buffer.history());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, AlertKind::SurfaceActivity);

        // still usable on the next frame
        let frame = solid_frame(1, 1.0, 0);
        buffer.push(frame.clone()).unwrap();
        assert_eq!(set.analyze(&frame, &buffer.history()).len(), 1);
    }
}
