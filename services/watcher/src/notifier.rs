//! Alert notification handoff.
//!
//! The runner never talks to notifiers directly: it submits notices to a
//! per-tank queue and a dispatcher task delivers them to every configured
//! notifier with bounded exponential-backoff retries. A full queue or an
//! exhausted retry budget is logged and the notice dropped; the pipeline is
//! never blocked by delivery.

use crate::alert::AlertEvent;
use crate::config::{FishConfig, NotifierConfig};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors raised while delivering a notice.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Notification queue full")]
    QueueFull,

    #[error("Notification dispatcher stopped")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a notifier gets for one alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertNotice {
    pub tank_id: String,
    pub tank_name: String,
    pub event: AlertEvent,
    /// Finished clip, `None` when recording failed or was skipped
    pub clip: Option<PathBuf>,
    /// The clip ended before its full post-roll
    pub clip_partial: bool,
    /// Passed through from tank configuration unmodified
    pub fish: FishConfig,
}

/// Receives alert notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notice: &AlertNotice) -> Result<(), NotifyError>;
}

/// Writes every notice to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, notice: &AlertNotice) -> Result<(), NotifyError> {
        let clip = notice
            .clip
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string());

        let message = if notice.event.is_cool_moment {
            "Cool moment"
        } else {
            "Tank alert"
        };
        info!(
            tank_id = %notice.tank_id,
            tank_name = %notice.tank_name,
            event_id = %notice.event.id,
            kind = %notice.event.kind,
            severity = notice.event.severity,
            evidence = %notice.event.evidence,
            clip = %clip,
            clip_partial = notice.clip_partial,
            "{}",
            message
        );
        Ok(())
    }
}

/// Keeps the most recent notices as JSON lines in a history file.
///
/// Each write replaces the file atomically with the trimmed history.
pub struct AlertLogNotifier {
    path: PathBuf,
    max_entries: usize,
    write_lock: Mutex<()>,
}

impl AlertLogNotifier {
    /// History file name inside a tank's data directory.
    pub const FILE_NAME: &'static str = "alerts.jsonl";

    pub const DEFAULT_MAX_ENTRIES: usize = 100;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Notifier for AlertLogNotifier {
    fn name(&self) -> &str {
        "alert_log"
    }

    async fn notify(&self, notice: &AlertNotice) -> Result<(), NotifyError> {
        let line = serde_json::to_vec(notice)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let existing = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<&[u8]> = existing
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .collect();
        entries.push(&line);
        let skip = entries.len().saturating_sub(self.max_entries);

        let mut contents = Vec::with_capacity(existing.len() + line.len() + 1);
        for entry in &entries[skip..] {
            contents.extend_from_slice(entry);
            contents.push(b'\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, &contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Queue in front of a tank's notifiers.
pub struct NotifierHandle {
    tank_id: String,
    tx: mpsc::Sender<AlertNotice>,
    task: JoinHandle<()>,
}

impl NotifierHandle {
    /// Start the dispatcher for one tank.
    pub fn spawn(
        tank_id: impl Into<String>,
        notifiers: Vec<Arc<dyn Notifier>>,
        config: &NotifierConfig,
    ) -> Self {
        let tank_id = tank_id.into();
        let (tx, rx) = mpsc::channel(config.queue_size);
        let task = tokio::spawn(dispatch(tank_id.clone(), rx, notifiers, config.clone()));
        Self { tank_id, tx, task }
    }

    /// Queue a notice without waiting.
    pub fn submit(&self, notice: AlertNotice) -> Result<(), NotifyError> {
        self.tx.try_send(notice).map_err(|e| {
            let (err, notice) = match e {
                mpsc::error::TrySendError::Full(n) => (NotifyError::QueueFull, n),
                mpsc::error::TrySendError::Closed(n) => (NotifyError::Closed, n),
            };
            metrics::counter!("tankwatch_notifications_dropped_total", "tank" => self.tank_id.clone())
                .increment(1);
            warn!(
                tank_id = %self.tank_id,
                event_id = %notice.event.id,
                error = %err,
                "Alert notice dropped"
            );
            err
        })
    }

    /// Stop accepting notices and wait for queued ones to be delivered.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            error!(tank_id = %self.tank_id, error = %e, "Notification dispatcher failed");
        }
    }
}

async fn dispatch(
    tank_id: String,
    mut rx: mpsc::Receiver<AlertNotice>,
    notifiers: Vec<Arc<dyn Notifier>>,
    config: NotifierConfig,
) {
    while let Some(notice) = rx.recv().await {
        for notifier in &notifiers {
            if let Err(e) = deliver(notifier.as_ref(), &notice, &config).await {
                metrics::counter!(
                    "tankwatch_notifications_failed_total",
                    "tank" => tank_id.clone(),
                    "notifier" => notifier.name().to_string()
                )
                .increment(1);
                error!(
                    tank_id = %tank_id,
                    notifier = notifier.name(),
                    event_id = %notice.event.id,
                    attempts = config.max_attempts,
                    error = %e,
                    "Giving up on alert notice"
                );
            }
        }
    }
}

/// Deliver with exponential backoff, at most `max_attempts` times.
async fn deliver(
    notifier: &dyn Notifier,
    notice: &AlertNotice,
    config: &NotifierConfig,
) -> Result<(), NotifyError> {
    let mut backoff = ExponentialBackoff {
        initial_interval: config.retry_base_delay(),
        max_interval: config.retry_max_delay(),
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match notifier.notify(notice).await {
            Ok(()) => return Ok(()),
            Err(e) if attempts >= config.max_attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(config.retry_max_delay());
                warn!(
                    tank_id = %notice.tank_id,
                    notifier = notifier.name(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Notice delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
