//! FFmpeg subprocess frame source.
//!
//! FFmpeg decodes the input, rescales to the configured size and writes raw
//! RGB24 frames to stdout. A reader task slices stdout into frames, stamps
//! them as they arrive and hands them to the source through a bounded channel.

use super::{redact, Decoded, FrameSource, InputKind, SourceClock, SourceError};
use crate::config::SourceConfig;
use crate::frame::{frame_size, Frame};
use async_trait::async_trait;
use bytes::BytesMut;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct FfmpegFrameSource {
    tank_id: String,
    config: SourceConfig,
    kind: InputKind,
    clock: SourceClock,
    child: Option<Child>,
    frames: Option<mpsc::Receiver<Decoded>>,
    tasks: Vec<JoinHandle<()>>,
    /// First frame, read while confirming the connection
    pending: Option<Frame>,
}

impl FfmpegFrameSource {
    pub fn new(tank_id: &str, config: SourceConfig) -> Self {
        let kind = InputKind::classify(&config.input);
        Self {
            tank_id: tank_id.to_string(),
            config,
            kind,
            clock: SourceClock::new(),
            child: None,
            frames: None,
            tasks: Vec::new(),
            pending: None,
        }
    }

    /// FFmpeg command-line arguments for this source.
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostdin".into(),
        ];

        match self.kind {
            InputKind::Network if self.config.input.to_ascii_lowercase().starts_with("rtsp") => {
                let transport = match self.config.transport.as_str() {
                    "udp" => "udp",
                    _ => "tcp",
                };
                args.extend(["-rtsp_transport".into(), transport.into()]);
            }
            InputKind::Network => {
                args.extend(["-reconnect".into(), "1".into()]);
            }
            InputKind::Device => {
                args.extend([
                    "-f".into(),
                    "v4l2".into(),
                    "-framerate".into(),
                    format!("{}", self.config.fps),
                ]);
            }
            // pace files at their native rate so timestamps look live
            InputKind::File => args.push("-re".into()),
        }

        args.extend([
            "-i".into(),
            self.config.input.clone(),
            "-an".into(),
            "-vf".into(),
            format!(
                "fps={},scale={}:{}",
                self.config.fps, self.config.width, self.config.height
            ),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "pipe:1".into(),
        ]);

        args
    }

    async fn receive(&mut self) -> Result<Option<Frame>, SourceError> {
        let frames = self.frames.as_mut().ok_or(SourceError::NotConnected)?;

        match frames.recv().await {
            Some(Decoded::Frame(frame)) => Ok(Some(frame)),
            Some(Decoded::Failed(e)) => Err(e),
            Some(Decoded::EndOfStream) | None => {
                if self.kind.is_finite() {
                    info!(tank_id = %self.tank_id, "End of input file");
                    Ok(None)
                } else {
                    Err(SourceError::Disconnected)
                }
            }
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    fn describe(&self) -> String {
        format!("ffmpeg {}", redact(&self.config.input))
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        self.disconnect().await;

        let ffmpeg = which::which("ffmpeg").map_err(|_| SourceError::FfmpegNotFound)?;
        let args = self.build_args();
        debug!(tank_id = %self.tank_id, source = %self.describe(), "Spawning FFmpeg decoder");

        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::ConnectionFailed(format!("Failed to spawn FFmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::ConnectionFailed("FFmpeg stdout unavailable".to_string()))?;
        let (tx, rx) = mpsc::channel(self.config.queue_size);
        self.tasks.push(tokio::spawn(read_frames(
            stdout,
            self.config.width,
            self.config.height,
            self.clock.clone(),
            tx,
        )));

        if let Some(stderr) = child.stderr.take() {
            let tank_id = self.tank_id.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(tank_id = %tank_id, "ffmpeg: {}", line);
                }
            }));
        }

        self.child = Some(child);
        self.frames = Some(rx);

        // the stream is only up once a frame has been decoded
        let connect_timeout = self.config.connection_timeout();
        match timeout(connect_timeout, self.receive()).await {
            Ok(Ok(Some(frame))) => {
                self.pending = Some(frame);
                info!(
                    tank_id = %self.tank_id,
                    source = %self.describe(),
                    width = self.config.width,
                    height = self.config.height,
                    fps = self.config.fps,
                    "Connected to frame source"
                );
                Ok(())
            }
            Ok(Ok(None)) => {
                self.disconnect().await;
                Err(SourceError::ConnectionFailed("Input contains no frames".to_string()))
            }
            Ok(Err(e)) => {
                self.disconnect().await;
                Err(SourceError::ConnectionFailed(e.to_string()))
            }
            Err(_) => {
                self.disconnect().await;
                Err(SourceError::Timeout(connect_timeout))
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.receive().await
    }

    async fn disconnect(&mut self) {
        self.frames = None;
        self.pending = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
            debug!(tank_id = %self.tank_id, "FFmpeg decoder stopped");
        }
    }
}

/// Slice a raw RGB24 byte stream into frames, stamped when read.
async fn read_frames<R>(mut reader: R, width: u32, height: u32, clock: SourceClock, tx: mpsc::Sender<Decoded>)
where
    R: AsyncRead + Unpin,
{
    let size = frame_size(width, height);
    loop {
        let mut buf = BytesMut::zeroed(size);
        match reader.read_exact(&mut buf).await {
            Ok(_) => {
                let decoded = match clock.frame(width, height, buf.freeze()) {
                    Ok(frame) => Decoded::Frame(frame),
                    Err(e) => Decoded::Failed(e.into()),
                };
                if tx.send(decoded).await.is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let _ = tx.send(Decoded::EndOfStream).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Decoded::Failed(SourceError::Io(e))).await;
                return;
            }
        }
    }
}
