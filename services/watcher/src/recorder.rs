//! Clip recording.
//!
//! When an alert fires the recorder takes the pre-roll frames from a buffer
//! snapshot and starts a clip job. The runner keeps feeding live frames to
//! the job through its [`ClipHandle`] until the post-roll window is covered.
//! The job then encodes the clip and moves the finished file
//! into the tank's clip directory without replacing an existing clip.
//!
//! A job whose feed stops (source stall, shutdown) finalizes early with the
//! frames it has and is flagged partial.

use crate::alert::AlertEvent;
use crate::config::{RecordingConfig, SourceConfig};
use crate::encoder::{ClipEncoder, EncodeError};
use crate::frame::Frame;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors raised while finalizing a clip.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("Clip has no frames")]
    NoFrames,

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Finalization task failed: {0}")]
    Task(String),
}

/// Message from the runner to a clip job.
#[derive(Debug)]
pub enum ClipFeed {
    Frame(Frame),
    /// The post-roll window is covered
    Complete,
}

/// Result of feeding one frame to a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// The clip wants more frames
    Recording,
    /// The clip has its full post-roll
    Complete,
    /// The job is gone
    Closed,
}

/// Runner-side handle of an in-flight clip.
pub struct ClipHandle {
    pub event_id: Uuid,
    ends_at: Duration,
    tx: mpsc::Sender<ClipFeed>,
    /// Set once a frame past the window has been seen
    complete: Arc<AtomicBool>,
}

impl ClipHandle {
    /// Stream time at which the post-roll is complete.
    pub fn ends_at(&self) -> Duration {
        self.ends_at
    }

    /// Hand a live frame to the clip.
    pub fn feed(&self, frame: &Frame) -> FeedStatus {
        if frame.timestamp >= self.ends_at {
            self.complete.store(true, Ordering::Release);
            // a full queue still ends cleanly once the handle is dropped
            if let Err(TrySendError::Full(_)) = self.tx.try_send(ClipFeed::Complete) {
                debug!(event_id = %self.event_id, "Clip queue full at post-roll end");
            }
            return FeedStatus::Complete;
        }

        match self.tx.try_send(ClipFeed::Frame(frame.clone())) {
            Ok(()) => FeedStatus::Recording,
            Err(TrySendError::Full(_)) => {
                warn!(event_id = %self.event_id, sequence = frame.sequence, "Clip queue full, frame dropped");
                FeedStatus::Recording
            }
            Err(TrySendError::Closed(_)) => FeedStatus::Closed,
        }
    }
}

/// A finished clip file.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipArtifact {
    pub path: PathBuf,
    pub partial: bool,
    pub frames: usize,
    /// Time between the first and last frame
    pub span: Duration,
}

/// What became of one alert's clip.
#[derive(Debug)]
pub struct ClipOutcome {
    pub event: AlertEvent,
    pub result: Result<ClipArtifact, RecordingError>,
}

/// Background half of a clip: collects post-roll frames and finalizes.
pub struct ClipJob {
    event: AlertEvent,
    frames: Vec<Frame>,
    ends_at: Duration,
    rx: mpsc::Receiver<ClipFeed>,
    complete: Arc<AtomicBool>,
    settings: Arc<RecorderSettings>,
}

struct RecorderSettings {
    tank_id: String,
    clips_dir: PathBuf,
    fps: f32,
    stall_timeout: Duration,
    encoder: Arc<dyn ClipEncoder>,
}

/// Creates clip jobs for one tank.
pub struct ClipRecorder {
    pre_roll: Duration,
    post_roll: Duration,
    queue_size: usize,
    settings: Arc<RecorderSettings>,
}

impl ClipRecorder {
    pub fn new(
        tank_id: impl Into<String>,
        clips_dir: impl Into<PathBuf>,
        recording: &RecordingConfig,
        source: &SourceConfig,
        encoder: Arc<dyn ClipEncoder>,
    ) -> Self {
        let post_roll = recording.post_roll();
        let queue_size = (post_roll.as_secs_f32() * source.fps).ceil() as usize + 16;

        Self {
            pre_roll: recording.pre_roll(),
            post_roll,
            queue_size,
            settings: Arc::new(RecorderSettings {
                tank_id: tank_id.into(),
                clips_dir: clips_dir.into(),
                fps: source.fps,
                stall_timeout: source.stall_timeout(),
                encoder,
            }),
        }
    }

    pub fn clips_dir(&self) -> &Path {
        &self.settings.clips_dir
    }

    /// File name for an event's clip: sortable time prefix, kind suffix.
    pub fn clip_file_name(event: &AlertEvent) -> String {
        format!(
            "{}_{}.mp4",
            event.triggered_wall.format("%Y%m%d_%H%M%S"),
            event.kind
        )
    }

    /// Start a clip for `event` from a buffer snapshot taken at trigger time.
    ///
    /// Snapshot frames from `trigger - pre_roll` up to and including the
    /// trigger frame are kept; frames after the trigger must be fed through
    /// the returned handle.
    pub fn record(&self, event: AlertEvent, snapshot: Vec<Frame>) -> (ClipHandle, ClipJob) {
        let trigger = event.triggered_at;
        let start = trigger.saturating_sub(self.pre_roll);
        let ends_at = trigger + self.post_roll;

        let frames: Vec<Frame> = snapshot
            .into_iter()
            .filter(|f| f.timestamp >= start && f.timestamp <= trigger)
            .collect();

        debug!(
            tank_id = %self.settings.tank_id,
            event_id = %event.id,
            pre_roll_frames = frames.len(),
            ends_at = ends_at.as_secs_f64(),
            "Clip job created"
        );

        let (tx, rx) = mpsc::channel(self.queue_size);
        let complete = Arc::new(AtomicBool::new(false));
        let handle = ClipHandle {
            event_id: event.id,
            ends_at,
            tx,
            complete: complete.clone(),
        };
        let job = ClipJob {
            event,
            frames,
            ends_at,
            rx,
            complete,
            settings: self.settings.clone(),
        };
        (handle, job)
    }
}

impl ClipJob {
    pub fn event(&self) -> &AlertEvent {
        &self.event
    }

    /// Collect the post-roll, then finalize.
    pub async fn run(mut self) -> ClipOutcome {
        let settings = self.settings.clone();
        let mut partial = false;

        loop {
            match timeout(settings.stall_timeout, self.rx.recv()).await {
                Ok(Some(ClipFeed::Frame(frame))) => {
                    let newer = self
                        .frames
                        .last()
                        .map_or(true, |last| frame.timestamp > last.timestamp);
                    if newer && frame.timestamp < self.ends_at {
                        self.frames.push(frame);
                    }
                }
                Ok(Some(ClipFeed::Complete)) => break,
                Ok(None) if self.complete.load(Ordering::Acquire) => break,
                Ok(None) => {
                    partial = true;
                    info!(
                        tank_id = %settings.tank_id,
                        event_id = %self.event.id,
                        "Clip feed closed before post-roll completed"
                    );
                    break;
                }
                Err(_) => {
                    partial = true;
                    warn!(
                        tank_id = %settings.tank_id,
                        event_id = %self.event.id,
                        stall_secs = settings.stall_timeout.as_secs_f64(),
                        "No frames for clip, finalizing early"
                    );
                    break;
                }
            }
        }
        drop(self.rx);

        let result = finalize(&settings, &self.event, self.frames, partial).await;
        match &result {
            Ok(artifact) => {
                metrics::counter!("tankwatch_clips_written_total", "tank" => settings.tank_id.clone())
                    .increment(1);
                info!(
                    tank_id = %settings.tank_id,
                    event_id = %self.event.id,
                    kind = %self.event.kind,
                    path = %artifact.path.display(),
                    frames = artifact.frames,
                    span_secs = artifact.span.as_secs_f64(),
                    partial = artifact.partial,
                    "Clip written"
                );
            }
            Err(e) => {
                metrics::counter!("tankwatch_clips_failed_total", "tank" => settings.tank_id.clone())
                    .increment(1);
                error!(
                    tank_id = %settings.tank_id,
                    event_id = %self.event.id,
                    kind = %self.event.kind,
                    error = %e,
                    "Clip recording failed"
                );
            }
        }

        ClipOutcome {
            event: self.event,
            result,
        }
    }
}

async fn finalize(
    settings: &RecorderSettings,
    event: &AlertEvent,
    frames: Vec<Frame>,
    partial: bool,
) -> Result<ClipArtifact, RecordingError> {
    let (first, last) = match (frames.first(), frames.last()) {
        (Some(first), Some(last)) => (first.timestamp, last.timestamp),
        _ => return Err(RecordingError::NoFrames),
    };
    let count = frames.len();

    tokio::fs::create_dir_all(&settings.clips_dir).await?;

    let name = ClipRecorder::clip_file_name(event);
    let tmp = settings
        .clips_dir
        .join(format!(".{}.{}.part", name, event.id.simple()));

    if let Err(e) = settings.encoder.encode(&frames, settings.fps, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    let placed = place(&tmp, &settings.clips_dir, &name, event).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    let path = placed?;

    Ok(ClipArtifact {
        path,
        partial,
        frames: count,
        span: last - first,
    })
}

/// Link the encoded file under the first free candidate name. A hard link
/// fails instead of replacing, so two writers never clobber each other.
async fn place(tmp: &Path, dir: &Path, name: &str, event: &AlertEvent) -> Result<PathBuf, RecordingError> {
    let stem = name.trim_end_matches(".mp4");
    let id = event.id.simple().to_string();
    let candidates = [
        name.to_string(),
        format!("{}_{}.mp4", stem, &id[..8]),
        format!("{}_{}.mp4", stem, id),
    ];

    for candidate in &candidates {
        let path = dir.join(candidate);
        match tokio::fs::hard_link(tmp, &path).await {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                // no hard links on this filesystem
                debug!(error = %e, "Hard link failed, falling back to rename");
                if tokio::fs::try_exists(&path).await? {
                    continue;
                }
                tokio::fs::rename(tmp, &path).await?;
                return Ok(path);
            }
        }
    }

    Err(RecordingError::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("No free clip name for {}", name),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertKind, DetectionSignal};
    use crate::buffer::RollingBuffer;
    use crate::config::create_test_tank;
    use crate::test_support::{solid_frame, MemoryEncoder};
    use tempfile::TempDir;

    fn recorder(dir: &Path, encoder: MemoryEncoder) -> ClipRecorder {
        let tank = create_test_tank("reef");
        ClipRecorder::new(
            "reef",
            dir.join("reef"),
            &tank.recording,
            &tank.source,
            Arc::new(encoder),
        )
    }

    fn event_at(frame: &Frame) -> AlertEvent {
        let signal = DetectionSignal::new(
            AlertKind::MotionSpike,
            0.9,
            "spike",
            frame.timestamp,
            frame.captured_at,
        );
        AlertEvent::from_signal("reef", &signal)
    }

    /// Buffer filled at 1 fps up to and including `trigger`.
    fn buffer_until(trigger: u64) -> RollingBuffer {
        let buffer = RollingBuffer::new(Duration::from_secs(10));
        for t in 0..=trigger {
            buffer.push(solid_frame(t, t as f64, 0)).unwrap();
        }
        buffer
    }

    #[tokio::test]
    async fn test_clip_spans_pre_and_post_roll() {
        let dir = TempDir::new().unwrap();
        let encoder = MemoryEncoder::new();
        let recorder = recorder(dir.path(), encoder.clone());

        let buffer = buffer_until(50);
        let event = event_at(&buffer.latest().unwrap());
        let (handle, job) = recorder.record(event.clone(), buffer.snapshot());
        let task = tokio::spawn(job.run());

        for t in 51..=90u64 {
            if handle.feed(&solid_frame(t, t as f64, 0)) == FeedStatus::Complete {
                assert_eq!(t, 80);
                break;
            }
        }

        let outcome = task.await.unwrap();
        let artifact = outcome.result.unwrap();
        assert!(!artifact.partial);
        assert_eq!(artifact.frames, 40);
        assert_eq!(artifact.span, Duration::from_secs(39));
        assert!(artifact.path.exists());
        assert_eq!(
            artifact.path.file_name().unwrap().to_string_lossy(),
            "20240501_120050_motion_spike.mp4"
        );

        let clips = encoder.clips.lock();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].sequences, (40..80).collect::<Vec<u64>>());
        // trigger sits at offset pre_roll
        assert_eq!(event.triggered_at - clips[0].first, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_short_history_keeps_what_exists() {
        let dir = TempDir::new().unwrap();
        let encoder = MemoryEncoder::new();
        let recorder = recorder(dir.path(), encoder.clone());

        let buffer = buffer_until(3);
        let (handle, job) = recorder.record(event_at(&buffer.latest().unwrap()), buffer.snapshot());
        let task = tokio::spawn(job.run());
        for t in 4..=33u64 {
            handle.feed(&solid_frame(t, t as f64, 0));
        }

        let artifact = task.await.unwrap().result.unwrap();
        assert_eq!(artifact.frames, 33);
        assert!(!artifact.partial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_feed_finalizes_partial() {
        let dir = TempDir::new().unwrap();
        let encoder = MemoryEncoder::new();
        let recorder = recorder(dir.path(), encoder.clone());

        let buffer = buffer_until(50);
        let (handle, job) = recorder.record(event_at(&buffer.latest().unwrap()), buffer.snapshot());
        let task = tokio::spawn(job.run());
        for t in 51..=60u64 {
            assert_eq!(handle.feed(&solid_frame(t, t as f64, 0)), FeedStatus::Recording);
        }

        // the source goes quiet; the stall timeout ends the clip
        let artifact = task.await.unwrap().result.unwrap();
        assert!(artifact.partial);
        assert_eq!(artifact.frames, 21);
        assert!(artifact.path.exists());
        drop(handle);
    }

    #[tokio::test]
    async fn test_dropped_handle_finalizes_partial() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(dir.path(), MemoryEncoder::new());

        let buffer = buffer_until(20);
        let (handle, job) = recorder.record(event_at(&buffer.latest().unwrap()), buffer.snapshot());
        drop(handle);

        let artifact = job.run().await.result.unwrap();
        assert!(artifact.partial);
        assert_eq!(artifact.frames, 11);
    }

    #[tokio::test]
    async fn test_encoder_failure_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(dir.path(), MemoryEncoder::failing());

        let buffer = buffer_until(20);
        let (handle, job) = recorder.record(event_at(&buffer.latest().unwrap()), buffer.snapshot());
        drop(handle);

        let outcome = job.run().await;
        assert!(matches!(outcome.result, Err(RecordingError::Encode(_))));
        let leftovers = std::fs::read_dir(dir.path().join("reef")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_same_second_clips_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(dir.path(), MemoryEncoder::new());
        let buffer = buffer_until(20);
        let latest = buffer.latest().unwrap();

        let mut paths = Vec::new();
        for _ in 0..2 {
            let (handle, job) = recorder.record(event_at(&latest), buffer.snapshot());
            drop(handle);
            paths.push(job.run().await.result.unwrap().path);
        }
        assert_ne!(paths[0], paths[1]);
        assert!(paths.iter().all(|p| p.exists()));
    }

    #[tokio::test]
    async fn test_existing_clip_is_never_replaced() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(dir.path(), MemoryEncoder::new());
        let buffer = buffer_until(20);
        let latest = buffer.latest().unwrap();
        let event = event_at(&latest);

        // another writer already owns the plain name
        let taken = dir.path().join("reef").join(ClipRecorder::clip_file_name(&event));
        std::fs::create_dir_all(taken.parent().unwrap()).unwrap();
        std::fs::write(&taken, b"other clip").unwrap();

        let (handle, job) = recorder.record(event, buffer.snapshot());
        drop(handle);
        let path = job.run().await.result.unwrap().path;

        assert_ne!(path, taken);
        assert_eq!(std::fs::read(&taken).unwrap(), b"other clip");
        let names: Vec<String> = std::fs::read_dir(dir.path().join("reef"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.ends_with(".part")));
    }

    #[tokio::test]
    async fn test_full_queue_at_window_end_is_not_partial() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(dir.path(), MemoryEncoder::new());

        let buffer = buffer_until(50);
        let (handle, job) = recorder.record(event_at(&buffer.latest().unwrap()), buffer.snapshot());

        // nothing drains the queue until the window has ended
        let repeat = solid_frame(60, 60.0, 0);
        while handle.tx.capacity() > 0 {
            assert_eq!(handle.feed(&repeat), FeedStatus::Recording);
        }
        assert_eq!(handle.feed(&solid_frame(61, 80.0, 0)), FeedStatus::Complete);
        drop(handle);

        let artifact = job.run().await.result.unwrap();
        assert!(!artifact.partial);
        assert_eq!(artifact.frames, 12);
    }

    #[test]
    fn test_feed_completes_at_window_end() {
        let recorder = recorder(Path::new("/tmp/unused"), MemoryEncoder::new());
        let frame = solid_frame(0, 100.0, 0);
        let (handle, _job) = recorder.record(event_at(&frame), vec![frame.clone()]);
        assert_eq!(handle.ends_at(), Duration::from_secs(130));
        assert_eq!(handle.feed(&solid_frame(1, 129.0, 0)), FeedStatus::Recording);
        assert_eq!(handle.feed(&solid_frame(2, 130.0, 0)), FeedStatus::Complete);
    }
}
