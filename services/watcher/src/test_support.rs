//! Shared fixtures for unit tests: synthetic frames, a scripted frame source,
//! an in-memory clip encoder and a collecting notifier.

use crate::alert::AlertKind;
use crate::config::{create_test_tank, TankConfig};
use crate::encoder::{ClipEncoder, EncodeError};
use crate::frame::{frame_size, Frame};
use crate::notifier::{AlertNotice, Notifier, NotifyError};
use crate::source::{FrameSource, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_WIDTH: u32 = 32;
pub const TEST_HEIGHT: u32 = 24;

/// Wall-clock time of stream second zero in tests.
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_564_800, 0).unwrap()
}

fn captured_at(ts: Duration) -> DateTime<Utc> {
    test_epoch() + chrono::Duration::from_std(ts).unwrap()
}

/// Test tank that alerts quickly: no-motion only, after 5 s, with a 2 s
/// pre-roll and 3 s post-roll at 1 fps.
pub fn quick_tank(id: &str) -> TankConfig {
    let mut tank = create_test_tank(id);
    tank.recording.pre_roll_secs = 2;
    tank.recording.post_roll_secs = 3;
    tank.recording.timestamp_overlay = false;
    tank.detection.no_motion_threshold_secs = 5;
    tank.detection.enabled = vec![AlertKind::NoMotion];
    tank
}

/// A uniformly grey frame.
pub fn solid_frame(sequence: u64, ts_secs: f64, value: u8) -> Frame {
    frame_with(sequence, ts_secs, value, &[])
}

/// A frame with a background value and square patches `(x, y, size, value)`.
pub fn frame_with(sequence: u64, ts_secs: f64, background: u8, squares: &[(u32, u32, u32, u8)]) -> Frame {
    let mut data = vec![background; frame_size(TEST_WIDTH, TEST_HEIGHT)];
    for &(x0, y0, size, value) in squares {
        for y in y0..(y0 + size).min(TEST_HEIGHT) {
            for x in x0..(x0 + size).min(TEST_WIDTH) {
                let idx = ((y * TEST_WIDTH + x) * 3) as usize;
                data[idx..idx + 3].fill(value);
            }
        }
    }
    let ts = Duration::from_secs_f64(ts_secs);
    Frame::new(sequence, ts, captured_at(ts), TEST_WIDTH, TEST_HEIGHT, data).unwrap()
}

/// A frame filled with one RGB colour.
pub fn color_frame(sequence: u64, ts_secs: f64, rgb: [u8; 3]) -> Frame {
    let data: Vec<u8> = std::iter::repeat(rgb)
        .take((TEST_WIDTH * TEST_HEIGHT) as usize)
        .flatten()
        .collect();
    let ts = Duration::from_secs_f64(ts_secs);
    Frame::new(sequence, ts, captured_at(ts), TEST_WIDTH, TEST_HEIGHT, data).unwrap()
}

/// One scripted source step.
#[derive(Debug)]
pub enum Step {
    Frame(Frame),
    Error(SourceError),
    /// Hold the next step back for a while
    Wait(Duration),
    /// Never produce another frame
    Pending,
    End,
}

/// Frame source replaying a fixed script.
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    connect_failures: u32,
    pub connects: Arc<AtomicU32>,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            connect_failures: 0,
            connects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Solid frames at `fps` for `secs` seconds, then end of stream.
    pub fn steady(secs: u64, fps: u32, value: u8) -> Self {
        Self::new(steady_steps(secs, fps, value).chain([Step::End]))
    }

    /// Fail the first `n` connection attempts.
    pub fn failing_connects(mut self, n: u32) -> Self {
        self.connect_failures = n;
        self
    }
}

/// Solid frames at `fps` for `secs` seconds.
pub fn steady_steps(secs: u64, fps: u32, value: u8) -> impl Iterator<Item = Step> {
    (0..secs * u64::from(fps)).map(move |i| Step::Frame(solid_frame(i, i as f64 / f64::from(fps), value)))
}

#[async_trait]
impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(SourceError::ConnectionFailed("scripted failure".to_string()));
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        // a cancelled wait stays queued so no step is lost
        while let Some(Step::Wait(delay)) = self.steps.front() {
            tokio::time::sleep(*delay).await;
            self.steps.pop_front();
        }
        match self.steps.pop_front() {
            Some(Step::Frame(frame)) => Ok(Some(frame)),
            Some(Step::Error(err)) => Err(err),
            Some(Step::Pending) => {
                self.steps.push_front(Step::Pending);
                futures::future::pending().await
            }
            Some(Step::Wait(_)) | Some(Step::End) | None => Ok(None),
        }
    }

    async fn disconnect(&mut self) {}
}

/// A clip the memory encoder was asked to write.
#[derive(Debug, Clone)]
pub struct EncodedClip {
    pub path: PathBuf,
    pub sequences: Vec<u64>,
    pub first: Duration,
    pub last: Duration,
}

/// Encoder that records what it was given and writes a tiny placeholder file.
#[derive(Clone, Default)]
pub struct MemoryEncoder {
    pub clips: Arc<Mutex<Vec<EncodedClip>>>,
    pub fail: bool,
}

impl MemoryEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ClipEncoder for MemoryEncoder {
    fn name(&self) -> &str {
        "memory"
    }

    async fn encode(&self, frames: &[Frame], _fps: f32, output: &Path) -> Result<(), EncodeError> {
        if self.fail {
            return Err(EncodeError::Failed("memory encoder told to fail".to_string()));
        }
        let (first, last) = match (frames.first(), frames.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return Err(EncodeError::NoFrames),
        };
        tokio::fs::write(output, format!("frames={}", frames.len())).await?;
        self.clips.lock().push(EncodedClip {
            path: output.to_path_buf(),
            sequences: frames.iter().map(|f| f.sequence).collect(),
            first,
            last,
        });
        Ok(())
    }
}

/// Notifier that keeps every notice, optionally failing the first attempts.
#[derive(Clone, Default)]
pub struct CollectingNotifier {
    pub notices: Arc<Mutex<Vec<AlertNotice>>>,
    pub attempts: Arc<AtomicU32>,
    failures: Arc<AtomicU32>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: u32) -> Self {
        let notifier = Self::default();
        notifier.failures.store(n, Ordering::SeqCst);
        notifier
    }

    pub fn notices(&self) -> Vec<AlertNotice> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn notify(&self, notice: &AlertNotice) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(NotifyError::Delivery("collecting notifier told to fail".to_string()));
        }
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}
