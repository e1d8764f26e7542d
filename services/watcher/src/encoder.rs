//! Clip encoding.
//!
//! The default encoder pipes raw RGB24 frames into an FFmpeg subprocess that
//! writes browser-playable H.264 MP4 (yuv420p, moov atom up front) and can
//! burn in a timestamp caption.

use crate::config::RecordingConfig;
use crate::frame::Frame;
use crate::overlay;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Errors raised while encoding a clip.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("No frames to encode")]
    NoFrames,

    #[error("Frame {sequence} is {actual:?}, clip is {expected:?}")]
    InconsistentFrames {
        sequence: u64,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Encoder failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes a sequence of frames to a video file.
#[async_trait]
pub trait ClipEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// Encode `frames` at `fps` into `output`, replacing any existing file.
    async fn encode(&self, frames: &[Frame], fps: f32, output: &Path) -> Result<(), EncodeError>;
}

/// H.264 encoder backed by an FFmpeg subprocess.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    crf: u8,
    preset: String,
    timestamp_overlay: bool,
}

impl FfmpegEncoder {
    pub fn new(crf: u8, preset: impl Into<String>) -> Self {
        Self {
            crf,
            preset: preset.into(),
            timestamp_overlay: false,
        }
    }

    pub fn with_timestamp_overlay(mut self, enabled: bool) -> Self {
        self.timestamp_overlay = enabled;
        self
    }

    pub fn from_config(recording: &RecordingConfig) -> Self {
        Self::new(recording.crf, recording.preset.clone())
            .with_timestamp_overlay(recording.timestamp_overlay)
    }

    /// FFmpeg arguments for a raw RGB24 stdin input, captioned from
    /// `caption_start` when given.
    pub fn build_args(
        &self,
        width: u32,
        height: u32,
        fps: f32,
        caption_start: Option<DateTime<Utc>>,
        output: &Path,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into(), "-v".into(), "error".into()];

        // Input: raw frames on stdin
        args.extend([
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", width, height),
            "-r".into(),
            format!("{}", fps),
            "-i".into(),
            "pipe:0".into(),
        ]);

        // yuv420p needs even dimensions
        let mut filters = String::from("scale=trunc(iw/2)*2:trunc(ih/2)*2");
        if let Some(start) = caption_start {
            filters.push(',');
            filters.push_str(&overlay::drawtext_filter(start, height));
        }

        // Output: H.264
        args.extend([
            "-vf".into(),
            filters,
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            self.preset.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            output.to_string_lossy().to_string(),
        ]);

        args
    }
}

#[async_trait]
impl ClipEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn encode(&self, frames: &[Frame], fps: f32, output: &Path) -> Result<(), EncodeError> {
        let first = frames.first().ok_or(EncodeError::NoFrames)?;
        let expected = (first.width, first.height);
        if let Some(odd) = frames.iter().find(|f| (f.width, f.height) != expected) {
            return Err(EncodeError::InconsistentFrames {
                sequence: odd.sequence,
                expected,
                actual: (odd.width, odd.height),
            });
        }

        let ffmpeg = which::which("ffmpeg").map_err(|_| EncodeError::FfmpegNotFound)?;
        let caption_start = self.timestamp_overlay.then_some(first.captured_at);
        let args = self.build_args(first.width, first.height, fps, caption_start, output);
        debug!(output = %output.display(), frames = frames.len(), "Spawning FFmpeg encoder");

        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncodeError::Failed("FFmpeg stdin unavailable".to_string()))?;

        let mut write_error = None;
        for frame in frames {
            if let Err(e) = stdin.write_all(&frame.data).await {
                write_error = Some(e);
                break;
            }
        }
        // closing stdin ends the input stream
        drop(stdin);

        let result = child.wait_with_output().await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(EncodeError::Failed(format!(
                "FFmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }
        if let Some(e) = write_error {
            return Err(EncodeError::Io(e));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_build_args_browser_playable() {
        let encoder = FfmpegEncoder::new(23, "veryfast");
        let args = encoder.build_args(640, 480, 15.0, None, &PathBuf::from("/tmp/clip.tmp"));

        let joined = args.join(" ");
        assert!(!joined.contains("drawtext"));
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 640x480 -r 15 -i pipe:0"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.contains("-crf 23"));
        assert_eq!(args.last().unwrap(), "/tmp/clip.tmp");
    }

    #[test]
    fn test_build_args_with_caption() {
        use crate::test_support::test_epoch;

        let encoder = FfmpegEncoder::new(23, "veryfast").with_timestamp_overlay(true);
        let args = encoder.build_args(640, 480, 15.0, Some(test_epoch()), &PathBuf::from("/tmp/clip.tmp"));

        let vf = args.iter().position(|a| a == "-vf").unwrap();
        let filters = &args[vf + 1];
        assert!(filters.starts_with("scale=trunc(iw/2)*2:trunc(ih/2)*2,drawtext="));
        assert!(filters.contains("gmtime\\:1714564800.000"));
    }

    #[test]
    fn test_from_config_carries_overlay_flag() {
        let mut recording = RecordingConfig::default();
        recording.timestamp_overlay = true;
        assert!(FfmpegEncoder::from_config(&recording).timestamp_overlay);
        recording.timestamp_overlay = false;
        assert!(!FfmpegEncoder::from_config(&recording).timestamp_overlay);
    }

    #[tokio::test]
    async fn test_encode_rejects_empty_clip() {
        let encoder = FfmpegEncoder::new(23, "veryfast");
        let err = encoder
            .encode(&[], 15.0, &PathBuf::from("/tmp/never.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::NoFrames));
    }

    #[tokio::test]
    async fn test_encode_rejects_mixed_sizes() {
        use crate::test_support::solid_frame;
        use chrono::Utc;
        use std::time::Duration;

        let small = Frame::new(9, Duration::from_secs(9), Utc::now(), 2, 2, vec![0u8; 12]).unwrap();
        let frames = vec![solid_frame(0, 0.0, 0), small];
        let encoder = FfmpegEncoder::new(23, "veryfast");
        let err = encoder
            .encode(&frames, 15.0, &PathBuf::from("/tmp/never.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::InconsistentFrames { sequence: 9, .. }));
    }
}
