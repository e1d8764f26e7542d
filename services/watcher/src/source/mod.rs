//! Frame sources.
//!
//! A source decodes a camera feed into timestamped RGB24 frames. Decoding
//! happens off the runner task (a subprocess reader or GStreamer streaming
//! thread). Frames are stamped there, when they are produced, and handed over
//! through a bounded channel, so `next_frame` is cancel-safe, never blocks the
//! runtime and a backlog keeps its capture spacing.

mod ffmpeg;
#[cfg(feature = "gstreamer")]
mod gst_source;

pub use self::ffmpeg::FfmpegFrameSource;
#[cfg(feature = "gstreamer")]
pub use self::gst_source::GstFrameSource;

use crate::config::{SourceBackend, SourceConfig};
use crate::frame::{Frame, FrameError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Errors raised by frame sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No frame within {0:?} of connecting")]
    Timeout(Duration),

    #[error("Stream disconnected unexpectedly")]
    Disconnected,

    #[error("Source is not connected")]
    NotConnected,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Errors that affect one frame and leave the connection usable.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Decode(_) | SourceError::Frame(_))
    }
}

/// A connectable stream of decoded frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Short description for logs (never includes credentials).
    fn describe(&self) -> String;

    /// Open the stream; succeeds once the first frame has been decoded.
    async fn connect(&mut self) -> Result<(), SourceError>;

    /// Next decoded frame, `Ok(None)` at end of stream.
    ///
    /// Cancel-safe: dropping the future loses no frame.
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Release the stream. Safe to call when not connected.
    async fn disconnect(&mut self);
}

/// What kind of input a source string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// rtsp://, rtsps://, http(s):// streams
    Network,
    /// V4L2 capture device
    Device,
    /// Recorded video file; ends instead of disconnecting
    File,
}

impl InputKind {
    pub fn classify(input: &str) -> Self {
        let lower = input.to_ascii_lowercase();
        if ["rtsp://", "rtsps://", "http://", "https://", "rtmp://"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
        {
            InputKind::Network
        } else if lower.starts_with("/dev/video") {
            InputKind::Device
        } else {
            InputKind::File
        }
    }

    /// Whether end of input is normal termination rather than a dropout.
    pub fn is_finite(&self) -> bool {
        matches!(self, InputKind::File)
    }
}

/// Input string with any `user:password@` removed.
pub fn redact(input: &str) -> String {
    match (input.find("://"), input.find('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &input[..scheme_end], &input[at + 1..])
        }
        _ => input.to_string(),
    }
}

/// Message from a decoder thread or task to its source.
#[derive(Debug)]
pub(crate) enum Decoded {
    Frame(Frame),
    Failed(SourceError),
    EndOfStream,
}

/// Stamps frames with a monotonic time that survives reconnects.
///
/// Clones share the epoch and sequence counter, so the producer side of a
/// connection can stamp frames at capture. Only one producer stamps at a time.
#[derive(Debug, Clone)]
pub(crate) struct SourceClock {
    epoch: Instant,
    sequence: Arc<AtomicU64>,
}

impl SourceClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build the next frame from pixel data decoded just now.
    pub fn frame(&self, width: u32, height: u32, data: Bytes) -> Result<Frame, FrameError> {
        let timestamp = self.epoch.elapsed();
        let captured_at: DateTime<Utc> = Utc::now();
        let sequence = self.sequence.load(Ordering::Acquire);
        let frame = Frame::new(sequence, timestamp, captured_at, width, height, data)?;
        self.sequence.store(sequence + 1, Ordering::Release);
        Ok(frame)
    }
}

/// Build the configured source for a tank.
pub fn create_source(tank_id: &str, config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    match config.backend {
        SourceBackend::Ffmpeg => Ok(Box::new(FfmpegFrameSource::new(tank_id, config.clone()))),
        #[cfg(feature = "gstreamer")]
        SourceBackend::Gstreamer => Ok(Box::new(GstFrameSource::new(tank_id, config.clone())?)),
        #[cfg(not(feature = "gstreamer"))]
        SourceBackend::Gstreamer => Err(SourceError::Backend(
            "built without the gstreamer feature".to_string(),
        )),
    }
}
