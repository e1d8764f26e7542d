//! GStreamer appsink frame source (`gstreamer` feature).
//!
//! Builds a decode pipeline ending in an appsink forced to RGB at the
//! configured size. The appsink callback runs on a GStreamer streaming thread,
//! stamps each sample as it arrives and forwards it through a bounded channel;
//! a bus watcher forwards errors and end-of-stream.

use super::{redact, Decoded, FrameSource, InputKind, SourceClock, SourceError};
use crate::config::SourceConfig;
use crate::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub struct GstFrameSource {
    tank_id: String,
    config: SourceConfig,
    kind: InputKind,
    clock: SourceClock,
    pipeline: Option<gst::Pipeline>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    frames: Option<mpsc::Receiver<Decoded>>,
    pending: Option<Frame>,
}

impl GstFrameSource {
    pub fn new(tank_id: &str, config: SourceConfig) -> Result<Self, SourceError> {
        gst::init().map_err(|e| SourceError::Backend(format!("GStreamer init failed: {}", e)))?;

        Ok(Self {
            tank_id: tank_id.to_string(),
            kind: InputKind::classify(&config.input),
            config,
            clock: SourceClock::new(),
            pipeline: None,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            frames: None,
            pending: None,
        })
    }

    /// Frames dropped because the runner fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Build the GStreamer pipeline description.
    pub fn build_pipeline_string(&self) -> String {
        let decode = match self.kind {
            InputKind::Network if self.config.input.to_ascii_lowercase().starts_with("rtsp") => {
                let protocols = match self.config.transport.as_str() {
                    "udp" => "0",
                    "udp-mcast" => "1",
                    _ => "2", // tcp
                };
                format!(
                    "rtspsrc location={} protocols={} latency=200 ! decodebin",
                    self.config.input, protocols
                )
            }
            InputKind::Device => format!("v4l2src device={} ! decodebin", self.config.input),
            InputKind::Network => format!("uridecodebin uri={}", self.config.input),
            InputKind::File => format!("filesrc location={} ! decodebin", self.config.input),
        };

        format!(
            "{decode} ! videoconvert ! videoscale ! videorate \
             ! video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1000 \
             ! appsink name=sink emit-signals=true sync={sync} max-buffers=2 drop=true",
            decode = decode,
            width = self.config.width,
            height = self.config.height,
            fps = (self.config.fps * 1000.0).round() as u32,
            // files play at their native rate, live sources as fast as they arrive
            sync = self.kind.is_finite(),
        )
    }

    fn start_pipeline(&mut self, tx: mpsc::Sender<Decoded>) -> Result<gst::Pipeline, SourceError> {
        let description = self.build_pipeline_string();
        debug!(tank_id = %self.tank_id, pipeline = %redact(&description), "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| SourceError::Backend(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SourceError::Backend("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| SourceError::Backend("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| SourceError::Backend("Could not cast to AppSink".to_string()))?;

        self.configure_appsink(&appsink, tx.clone());

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;

        self.watch_bus(&pipeline, tx)?;
        Ok(pipeline)
    }

    fn configure_appsink(&self, appsink: &gst_app::AppSink, sender: mpsc::Sender<Decoded>) {
        let running = self.running.clone();
        let dropped = self.dropped.clone();
        let tank_id = self.tank_id.clone();
        let clock = self.clock.clone();

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    if !running.load(Ordering::SeqCst) {
                        return Err(gst::FlowError::Eos);
                    }

                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;

                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let data = pack_rows(
                        map.as_slice(),
                        info.width(),
                        info.height(),
                        info.stride()[0] as usize,
                    );

                    let decoded = match clock.frame(info.width(), info.height(), data) {
                        Ok(frame) => Decoded::Frame(frame),
                        Err(e) => Decoded::Failed(e.into()),
                    };

                    match sender.try_send(decoded) {
                        Ok(()) => Ok(gst::FlowSuccess::Ok),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            debug!(tank_id = %tank_id, "Frame dropped due to backpressure");
                            Ok(gst::FlowSuccess::Ok)
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => Err(gst::FlowError::Eos),
                    }
                })
                .build(),
        );
    }

    /// Forward pipeline errors and end-of-stream into the frame channel.
    fn watch_bus(&self, pipeline: &gst::Pipeline, tx: mpsc::Sender<Decoded>) -> Result<(), SourceError> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| SourceError::Backend("Pipeline has no bus".to_string()))?;
        let running = self.running.clone();
        let tank_id = self.tank_id.clone();

        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                    continue;
                };
                match msg.view() {
                    gst::MessageView::Error(err) => {
                        error!(
                            tank_id = %tank_id,
                            error = %err.error(),
                            debug = ?err.debug(),
                            "GStreamer pipeline error"
                        );
                        let _ = tx.blocking_send(Decoded::Failed(SourceError::Backend(
                            err.error().to_string(),
                        )));
                        break;
                    }
                    gst::MessageView::Eos(_) => {
                        let _ = tx.blocking_send(Decoded::EndOfStream);
                        break;
                    }
                    gst::MessageView::Warning(w) => {
                        warn!(tank_id = %tank_id, warning = %w.error(), "GStreamer warning");
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Frame>, SourceError> {
        let frames = self.frames.as_mut().ok_or(SourceError::NotConnected)?;
        match frames.recv().await {
            Some(Decoded::Frame(frame)) => Ok(Some(frame)),
            Some(Decoded::Failed(e)) => Err(e),
            Some(Decoded::EndOfStream) | None if self.kind.is_finite() => Ok(None),
            Some(Decoded::EndOfStream) | None => Err(SourceError::Disconnected),
        }
    }
}

/// Copy frame rows, dropping any stride padding.
fn pack_rows(src: &[u8], width: u32, height: u32, stride: usize) -> Bytes {
    let row = width as usize * 3;
    if stride == row {
        return Bytes::copy_from_slice(&src[..row * height as usize]);
    }
    let mut packed = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        packed.extend_from_slice(&src[y * stride..y * stride + row]);
    }
    Bytes::from(packed)
}

#[async_trait]
impl FrameSource for GstFrameSource {
    fn describe(&self) -> String {
        format!("gstreamer {}", redact(&self.config.input))
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        self.disconnect().await;

        let (tx, rx) = mpsc::channel(self.config.queue_size);
        self.running.store(true, Ordering::SeqCst);
        let pipeline = match self.start_pipeline(tx) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.pipeline = Some(pipeline);
        self.frames = Some(rx);

        let connect_timeout = self.config.connection_timeout();
        match timeout(connect_timeout, self.receive()).await {
            Ok(Ok(Some(frame))) => {
                self.pending = Some(frame);
                info!(tank_id = %self.tank_id, source = %self.describe(), "Connected to frame source");
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
        self.running.store(false, Ordering::SeqCst);
        self.frames = None;
        self.pending = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::create_test_tank;

    fn source_for(input: &str, transport: &str) -> GstFrameSource {
        let mut tank = create_test_tank("reef");
        tank.source.input = input.to_string();
        tank.source.transport = transport.to_string();
        GstFrameSource::new(&tank.id, tank.source).unwrap()
    }

    #[test]
    fn test_pipeline_string_tcp() {
        let pipeline = source_for("rtsp://test:554/stream", "tcp").build_pipeline_string();
        assert!(pipeline.contains("protocols=2"));
        assert!(pipeline.contains("rtsp://test:554/stream"));
        assert!(pipeline.contains("format=RGB,width=32,height=24"));
    }

    #[test]
    fn test_pipeline_string_udp() {
        let pipeline = source_for("rtsp://test:554/stream", "udp").build_pipeline_string();
        assert!(pipeline.contains("protocols=0"));
    }

    #[test]
    fn test_pipeline_string_file_syncs() {
        let pipeline = source_for("reef.mp4", "tcp").build_pipeline_string();
        assert!(pipeline.starts_with("filesrc location=reef.mp4"));
        assert!(pipeline.contains("sync=true"));
    }

    #[test]
    fn test_pack_rows_strips_padding() {
        // 1x2 RGB with 4-byte stride
        let src = [1, 2, 3, 0, 4, 5, 6, 0];
        assert_eq!(&pack_rows(&src, 1, 2, 4)[..], &[1, 2, 3, 4, 5, 6]);
    }
}
