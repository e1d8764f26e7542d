//! Tankwatch - live aquarium camera watcher
//!
//! Watches one or more tank cameras, detects anomalies and "cool moments"
//! (no motion, motion spikes, water colour drift, surface activity,
//! clustering, fish count changes, feeding frenzies) and records an MP4 clip
//! around each alert that includes footage from before the trigger.
//!
//! # Example
//!
//! ```rust,no_run
//! use tankwatch::{Supervisor, WatcherConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WatcherConfig::load()?;
//!     config.validate()?;
//!
//!     let mut supervisor = Supervisor::from_config(config)?;
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod analysis;
pub mod arbiter;
pub mod buffer;
pub mod config;
pub mod detector;
pub mod encoder;
pub mod frame;
pub mod notifier;
pub mod overlay;
pub mod recorder;
pub mod runner;
pub mod source;
pub mod status;
pub mod supervisor;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use alert::{AlertEvent, AlertKind, DetectionSignal};
pub use arbiter::{AlertArbiter, ArbiterState};
pub use buffer::{BufferError, HistoryView, RollingBuffer};
pub use config::{ConfigValidationError, ShutdownPolicy, TankConfig, WatcherConfig};
pub use detector::{Detector, DetectorError, DetectorSet};
pub use encoder::{ClipEncoder, EncodeError, FfmpegEncoder};
pub use frame::{Frame, FrameError};
pub use notifier::{AlertLogNotifier, AlertNotice, LogNotifier, Notifier, NotifierHandle, NotifyError};
pub use recorder::{ClipArtifact, ClipHandle, ClipOutcome, ClipRecorder, RecordingError};
pub use runner::{TankError, TankRunner};
pub use source::{create_source, FrameSource, SourceError};
pub use status::{HealthState, TankHealth, TankStatus};
pub use supervisor::Supervisor;
