//! Per-tank pipeline.
//!
//! ```text
//! FrameSource -> RollingBuffer -> DetectorSet -> AlertArbiter -> ClipRecorder -> Notifier
//! ```
//!
//! One runner task owns one tank. Ingestion and detection happen on the same
//! tick; clip finalization runs in background jobs whose outcomes come back
//! through a `JoinSet` and are handed to the tank's notifier queue.

use crate::alert::AlertEvent;
use crate::arbiter::AlertArbiter;
use crate::buffer::RollingBuffer;
use crate::config::{ShutdownPolicy, TankConfig};
use crate::detector::DetectorSet;
use crate::encoder::ClipEncoder;
use crate::frame::Frame;
use crate::notifier::{AlertNotice, NotifierHandle};
use crate::recorder::{ClipHandle, ClipOutcome, ClipRecorder, FeedStatus, RecordingError};
use crate::source::{FrameSource, SourceError};
use crate::status::{HealthState, TankHealth};
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that stop a tank runner.
#[derive(Debug, Error)]
pub enum TankError {
    #[error("Source unavailable after {attempts} connection attempts: {last_error}")]
    SourceUnavailable {
        attempts: u32,
        #[source]
        last_error: SourceError,
    },

    #[error("Source setup failed: {0}")]
    Source(#[from] SourceError),

    #[error("Tank {0} is already supervised")]
    DuplicateTank(String),

    #[error("Tank runner cancelled")]
    Cancelled,
}

/// Why the watch loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    EndOfStream,
}

/// Drives one tank from frames to notices.
pub struct TankRunner {
    tank: TankConfig,
    source: Box<dyn FrameSource>,
    buffer: RollingBuffer,
    detectors: DetectorSet,
    arbiter: AlertArbiter,
    recorder: ClipRecorder,
    notifier: NotifierHandle,
    health: Arc<TankHealth>,
    cancel: CancellationToken,
    clips: JoinSet<ClipOutcome>,
    active: Vec<ClipHandle>,
}

impl TankRunner {
    pub fn new(
        tank: TankConfig,
        clips_dir: PathBuf,
        source: Box<dyn FrameSource>,
        encoder: Arc<dyn ClipEncoder>,
        notifier: NotifierHandle,
        cancel: CancellationToken,
    ) -> Self {
        let buffer = RollingBuffer::with_frame_rate(tank.recording.pre_roll(), tank.source.fps);
        let detectors = DetectorSet::from_config(&tank.detection, &tank.fish);
        let arbiter = AlertArbiter::new(tank.id.clone(), tank.alerts.clone());
        let recorder = ClipRecorder::new(
            tank.id.clone(),
            clips_dir,
            &tank.recording,
            &tank.source,
            encoder,
        );
        let health = Arc::new(TankHealth::new(tank.id.clone(), tank.display_name()));

        Self {
            tank,
            source,
            buffer,
            detectors,
            arbiter,
            recorder,
            notifier,
            health,
            cancel,
            clips: JoinSet::new(),
            active: Vec::new(),
        }
    }

    pub fn health(&self) -> Arc<TankHealth> {
        self.health.clone()
    }

    /// Run until cancelled, end of stream, or the source is lost for good.
    pub async fn run(mut self) -> Result<(), TankError> {
        info!(
            tank_id = %self.tank.id,
            tank_name = %self.tank.display_name(),
            source = %self.source.describe(),
            detectors = ?self.detectors.kinds(),
            clips_dir = %self.recorder.clips_dir().display(),
            "Tank runner starting"
        );

        let result = match self.watch().await {
            Err(TankError::Cancelled) => Ok(Exit::Cancelled),
            other => other,
        };

        if matches!(result, Ok(Exit::Cancelled))
            && self.tank.recording.shutdown_policy == ShutdownPolicy::Drain
            && !self.active.is_empty()
        {
            self.drain().await;
        }
        self.source.disconnect().await;
        self.finish_clips().await;
        self.notifier.close().await;

        match result {
            Ok(exit) => {
                self.health.set_state(HealthState::Stopped);
                info!(
                    tank_id = %self.tank.id,
                    reason = ?exit,
                    alerts = self.arbiter.total_fired(),
                    "Tank runner stopped"
                );
                Ok(())
            }
            Err(e) => {
                self.health.fail(e.to_string());
                error!(tank_id = %self.tank.id, error = %e, "Tank runner failed");
                Err(e)
            }
        }
    }

    async fn watch(&mut self) -> Result<Exit, TankError> {
        self.connect_with_retry().await?;

        let stall_timeout = self.tank.source.stall_timeout();
        let max_errors = self.tank.source.max_consecutive_errors;
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(Exit::Cancelled),

                Some(joined) = self.clips.join_next(), if !self.clips.is_empty() => {
                    self.on_clip_done(joined);
                }

                next = timeout(stall_timeout, self.source.next_frame()) => match next {
                    Ok(Ok(Some(frame))) => {
                        consecutive_errors = 0;
                        self.on_frame(frame);
                    }
                    Ok(Ok(None)) => {
                        info!(tank_id = %self.tank.id, "Source reached end of stream");
                        return Ok(Exit::EndOfStream);
                    }
                    Ok(Err(e)) if e.is_transient() => {
                        consecutive_errors += 1;
                        self.health.record_drop();
                        metrics::counter!("tankwatch_frames_dropped_total", "tank" => self.tank.id.clone())
                            .increment(1);
                        warn!(
                            tank_id = %self.tank.id,
                            consecutive = consecutive_errors,
                            error = %e,
                            "Frame decode error"
                        );
                        if consecutive_errors >= max_errors {
                            self.reconnect(format!("{} consecutive decode errors", consecutive_errors))
                                .await?;
                            consecutive_errors = 0;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(tank_id = %self.tank.id, error = %e, "Source error, reconnecting");
                        self.reconnect(e.to_string()).await?;
                        consecutive_errors = 0;
                    }
                    Err(_) => {
                        self.health.set_state(HealthState::Stalled);
                        metrics::counter!("tankwatch_source_stalls_total", "tank" => self.tank.id.clone())
                            .increment(1);
                        warn!(
                            tank_id = %self.tank.id,
                            stall_secs = stall_timeout.as_secs_f64(),
                            "No frame within stall window"
                        );
                        self.reconnect(format!("No frame for {:.1}s", stall_timeout.as_secs_f64()))
                            .await?;
                        consecutive_errors = 0;
                    }
                }
            }
        }
    }

    /// One tick: buffer, detect, arbitrate, feed clips, start clips.
    fn on_frame(&mut self, frame: Frame) {
        if let Err(e) = self.buffer.push(frame.clone()) {
            self.health.record_drop();
            metrics::counter!("tankwatch_frames_dropped_total", "tank" => self.tank.id.clone())
                .increment(1);
            warn!(tank_id = %self.tank.id, sequence = frame.sequence, error = %e, "Frame dropped");
            return;
        }
        self.health.record_frame(frame.captured_at);
        self.health.set_state(HealthState::Running);
        metrics::counter!("tankwatch_frames_ingested_total", "tank" => self.tank.id.clone())
            .increment(1);

        let signals = {
            let history = self.buffer.history();
            self.detectors.analyze(&frame, &history)
        };
        if !signals.is_empty() {
            metrics::counter!("tankwatch_signals_total", "tank" => self.tank.id.clone())
                .increment(signals.len() as u64);
        }

        // clips already recording get this frame as post-roll
        self.active
            .retain(|clip| clip.feed(&frame) == FeedStatus::Recording);

        for event in self.arbiter.consider_all(&signals) {
            self.health.record_alert();
            self.start_clip(event);
        }
    }

    fn start_clip(&mut self, event: AlertEvent) {
        let limit = self.tank.recording.max_concurrent_clips;
        if self.clips.len() >= limit {
            warn!(
                tank_id = %self.tank.id,
                event_id = %event.id,
                in_flight = self.clips.len(),
                limit = limit,
                "Too many clips in flight, alert reported without clip"
            );
            self.notify(event, None, false);
            return;
        }

        let (handle, job) = self.recorder.record(event, self.buffer.snapshot());
        let event = job.event().clone();
        self.active.push(handle);
        self.health.clip_started();

        self.clips.spawn(async move {
            match AssertUnwindSafe(job.run()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => ClipOutcome {
                    event,
                    result: Err(RecordingError::Task("clip job panicked".to_string())),
                },
            }
        });
    }

    fn on_clip_done(&mut self, joined: Result<ClipOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                self.health.clip_finished(false);
                error!(tank_id = %self.tank.id, error = %e, "Clip task lost");
                return;
            }
        };

        match outcome.result {
            Ok(artifact) => {
                self.health.clip_finished(true);
                self.notify(outcome.event, Some(artifact.path), artifact.partial);
            }
            Err(e) => {
                self.health.clip_finished(false);
                self.health.set_error(e.to_string());
                self.notify(outcome.event, None, false);
            }
        }
    }

    fn notify(&self, event: AlertEvent, clip: Option<PathBuf>, clip_partial: bool) {
        let notice = AlertNotice {
            tank_id: self.tank.id.clone(),
            tank_name: self.tank.display_name().to_string(),
            event,
            clip,
            clip_partial,
            fish: self.tank.fish.clone(),
        };
        // a refused notice is logged by the handle
        let _ = self.notifier.submit(notice);
    }

    async fn reconnect(&mut self, reason: String) -> Result<(), TankError> {
        self.health.record_reconnect();
        self.health.set_error(reason);
        self.source.disconnect().await;
        self.connect_with_retry().await
    }

    /// Connect with exponential backoff, bounded by `max_reconnect_attempts`
    /// unless it is 0.
    async fn connect_with_retry(&mut self) -> Result<(), TankError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.tank.source.reconnect_base_delay(),
            max_interval: self.tank.source.reconnect_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        let max_attempts = self.tank.source.max_reconnect_attempts;
        let mut attempts = 0u32;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TankError::Cancelled),
                result = self.source.connect() => result,
            };

            match result {
                Ok(()) => {
                    info!(
                        tank_id = %self.tank.id,
                        source = %self.source.describe(),
                        attempts = attempts,
                        "Connected to frame source"
                    );
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    self.health.set_error(e.to_string());

                    if max_attempts > 0 && attempts >= max_attempts {
                        error!(
                            tank_id = %self.tank.id,
                            attempts = attempts,
                            error = %e,
                            "Max reconnection attempts exceeded"
                        );
                        return Err(TankError::SourceUnavailable {
                            attempts,
                            last_error: e,
                        });
                    }

                    self.health.set_state(HealthState::Reconnecting);
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.tank.source.reconnect_max_delay());
                    warn!(
                        tank_id = %self.tank.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TankError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Keep feeding in-flight clips after cancellation until their post-roll
    /// is covered, bounded by the post-roll plus the stall window.
    async fn drain(&mut self) {
        let stall_timeout = self.tank.source.stall_timeout();
        let window = self.tank.recording.post_roll() + stall_timeout;
        info!(
            tank_id = %self.tank.id,
            clips = self.active.len(),
            window_secs = window.as_secs_f64(),
            "Draining in-flight clips"
        );

        let drained = timeout(window, async {
            while !self.active.is_empty() {
                match timeout(stall_timeout, self.source.next_frame()).await {
                    Ok(Ok(Some(frame))) => {
                        if self.buffer.push(frame.clone()).is_err() {
                            self.health.record_drop();
                            continue;
                        }
                        self.health.record_frame(frame.captured_at);
                        self.active
                            .retain(|clip| clip.feed(&frame) == FeedStatus::Recording);
                    }
                    Ok(Err(e)) if e.is_transient() => self.health.record_drop(),
                    _ => break,
                }
            }
        })
        .await;

        if drained.is_err() || !self.active.is_empty() {
            warn!(
                tank_id = %self.tank.id,
                clips = self.active.len(),
                "Drain ended with clips still recording"
            );
        }
    }

    /// Close every clip feed and wait for the jobs to finish.
    async fn finish_clips(&mut self) {
        if !self.active.is_empty() {
            info!(
                tank_id = %self.tank.id,
                clips = self.active.len(),
                "Finalizing in-flight clips as partial"
            );
        }
        // dropping a handle ends its clip with the frames it has
        self.active.clear();

        while let Some(joined) = self.clips.join_next().await {
            self.on_clip_done(joined);
        }
        debug!(tank_id = %self.tank.id, "All clip jobs finished");
    }
}
