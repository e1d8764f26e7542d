//! Multi-tank supervision.
//!
//! Each tank gets its own runner task, source, encoder handle and notifier
//! queue. Nothing mutable is shared between tanks: one tank stalling, failing
//! or panicking only changes that tank's status.

use crate::config::{TankConfig, WatcherConfig};
use crate::encoder::{ClipEncoder, FfmpegEncoder};
use crate::notifier::{AlertLogNotifier, LogNotifier, Notifier, NotifierHandle};
use crate::runner::{TankError, TankRunner};
use crate::source::{create_source, FrameSource};
use crate::status::{TankHealth, TankStatus};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct TankSlot {
    health: Arc<TankHealth>,
    task: Option<JoinHandle<()>>,
}

/// Owns every tank runner.
pub struct Supervisor {
    config: WatcherConfig,
    cancel: CancellationToken,
    tanks: Vec<TankSlot>,
}

impl Supervisor {
    /// Empty supervisor; tanks are added with [`Supervisor::add_tank`].
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            tanks: Vec::new(),
        }
    }

    /// Start a runner for every configured tank with the built-in source,
    /// encoder and notifiers.
    pub fn from_config(config: WatcherConfig) -> Result<Self, TankError> {
        let mut supervisor = Self::new(config.clone());

        for tank in &config.tanks {
            let source = create_source(&tank.id, &tank.source)?;
            let encoder: Arc<dyn ClipEncoder> = Arc::new(FfmpegEncoder::from_config(&tank.recording));

            let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
            if config.notifier.alert_log {
                notifiers.push(Arc::new(
                    AlertLogNotifier::in_dir(&tank.data_dir(&config.output))
                        .with_max_entries(config.notifier.alert_log_max_entries),
                ));
            }

            supervisor.add_tank(tank.clone(), source, encoder, notifiers)?;
        }

        Ok(supervisor)
    }

    /// Spawn a runner for `tank`.
    pub fn add_tank(
        &mut self,
        tank: TankConfig,
        source: Box<dyn FrameSource>,
        encoder: Arc<dyn ClipEncoder>,
        notifiers: Vec<Arc<dyn Notifier>>,
    ) -> Result<(), TankError> {
        if self.tanks.iter().any(|slot| slot.health.tank_id() == tank.id) {
            return Err(TankError::DuplicateTank(tank.id));
        }

        let notifier = NotifierHandle::spawn(tank.id.clone(), notifiers, &self.config.notifier);
        let clips_dir = tank.clips_dir(&self.config.output);
        let runner = TankRunner::new(
            tank.clone(),
            clips_dir,
            source,
            encoder,
            notifier,
            self.cancel.child_token(),
        );
        let health = runner.health();

        let task = tokio::spawn({
            let health = health.clone();
            let tank_id = tank.id.clone();
            async move {
                match AssertUnwindSafe(runner.run()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    // the runner has already logged and recorded the failure
                    Ok(Err(_)) => {}
                    Err(_) => {
                        error!(tank_id = %tank_id, "Tank runner panicked");
                        health.fail("Tank runner panicked");
                    }
                }
            }
        });

        info!(tank_id = %tank.id, tank_name = %tank.display_name(), "Tank supervised");
        self.tanks.push(TankSlot {
            health,
            task: Some(task),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tanks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tanks.is_empty()
    }

    /// Token cancelling every tank.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Status of every tank, in the order they were added.
    pub fn statuses(&self) -> Vec<TankStatus> {
        self.tanks.iter().map(|slot| slot.health.snapshot()).collect()
    }

    pub fn status(&self, tank_id: &str) -> Option<TankStatus> {
        self.tanks
            .iter()
            .find(|slot| slot.health.tank_id() == tank_id)
            .map(|slot| slot.health.snapshot())
    }

    /// Periodically log every tank's status until shutdown.
    pub fn spawn_health_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let healths: Vec<Arc<TankHealth>> = self.tanks.iter().map(|slot| slot.health.clone()).collect();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for health in &healths {
                            log_status(&health.snapshot());
                        }
                    }
                }
            }
        })
    }

    /// Wait until every runner has stopped on its own.
    pub async fn wait(&mut self) {
        // cleared only once joined
        for slot in &mut self.tanks {
            if let Some(task) = slot.task.as_mut() {
                let joined = task.await;
                slot.task = None;
                if let Err(e) = joined {
                    error!(tank_id = %slot.health.tank_id(), error = %e, "Tank task ended abnormally");
                }
            }
        }
    }

    /// Cancel every runner and wait for them to wind down.
    pub async fn shutdown(&mut self) {
        info!(tanks = self.tanks.len(), "Stopping all tanks");
        self.cancel.cancel();
        self.wait().await;
    }
}

/// One status line per tank.
pub fn log_status(status: &TankStatus) {
    info!(
        tank_id = %status.tank_id,
        state = %status.state,
        frames_ingested = status.frames_ingested,
        frames_dropped = status.frames_dropped,
        alerts = status.alerts_fired,
        clips_written = status.clips_written,
        clips_failed = status.clips_failed,
        clips_in_flight = status.clips_in_flight,
        reconnects = status.reconnects,
        last_frame_at = ?status.last_frame_at,
        last_error = ?status.last_error,
        "Tank status"
    );
}
