//! Configuration management for the tank watcher.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files. Every tank is validated before any
//! monitoring loop starts so that bad thresholds fail fast.

use crate::alert::AlertKind;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the watcher service.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Tanks to monitor, one runner each
    pub tanks: Vec<TankConfig>,

    /// Output directory layout
    #[serde(default)]
    pub output: OutputConfig,

    /// Notifier delivery configuration
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Health reporting configuration
    #[serde(default)]
    pub health: HealthConfig,
}

/// Configuration for a single monitored tank.
#[derive(Debug, Clone, Deserialize)]
pub struct TankConfig {
    /// Tank identifier, also used to partition output directories
    pub id: String,

    /// Human readable tank name
    #[serde(default)]
    pub name: Option<String>,

    /// Camera source configuration
    pub source: SourceConfig,

    /// Clip recording configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Detector configuration
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Alert debouncing configuration
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Fish metadata, passed through to notifiers unmodified
    #[serde(default)]
    pub fish: FishConfig,

    /// Override for this tank's clip directory
    #[serde(default)]
    pub clips_dir: Option<String>,

    /// Override for this tank's data directory (alert log)
    #[serde(default)]
    pub data_dir: Option<String>,
}

/// Frame source backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    /// FFmpeg subprocess decoding to raw RGB
    Ffmpeg,
    /// GStreamer appsink pipeline (requires the `gstreamer` feature)
    Gstreamer,
}

/// Camera source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Decoder backend
    #[serde(default = "default_backend")]
    pub backend: SourceBackend,

    /// Input: RTSP/HTTP URL, V4L2 device path, or a video file
    pub input: String,

    /// Decoded frame width
    #[serde(default = "default_width")]
    pub width: u32,

    /// Decoded frame height
    #[serde(default = "default_height")]
    pub height: u32,

    /// Nominal frame rate
    #[serde(default = "default_fps")]
    pub fps: f32,

    /// RTSP transport protocol (tcp or udp)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum number of reconnection attempts before the tank is failed;
    /// 0 retries forever
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Missed frame intervals before the tank is reported stalled
    #[serde(default = "default_stall_missed_intervals")]
    pub stall_missed_intervals: u32,

    /// Consecutive read errors tolerated before reconnecting
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Decoded frames queued between the decoder and the runner
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

/// What happens to in-flight clips when a tank stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Keep reading frames until every clip has its full post-roll
    Drain,
    /// Finalize in-flight clips immediately as partial clips
    Abandon,
}

/// Clip recording configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Seconds of footage before the trigger
    #[serde(default = "default_pre_roll")]
    pub pre_roll_secs: u64,

    /// Seconds of footage after the trigger
    #[serde(default = "default_post_roll")]
    pub post_roll_secs: u64,

    /// Clip jobs allowed in flight per tank
    #[serde(default = "default_max_concurrent_clips")]
    pub max_concurrent_clips: usize,

    /// Policy for in-flight clips on shutdown
    #[serde(default = "default_shutdown_policy")]
    pub shutdown_policy: ShutdownPolicy,

    /// Burn a timestamp caption into every clip frame
    #[serde(default = "default_overlay")]
    pub timestamp_overlay: bool,

    /// H.264 constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u8,

    /// x264 preset
    #[serde(default = "default_preset")]
    pub preset: String,
}

/// Detector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Motion sensitivity, 0 (dull) to 100 (twitchy)
    #[serde(default = "default_sensitivity")]
    pub motion_sensitivity: u8,

    /// Seconds of stillness before a no-motion signal
    #[serde(default = "default_no_motion_threshold")]
    pub no_motion_threshold_secs: u64,

    /// Mean colour distance (0-441) treated as a water colour change
    #[serde(default = "default_color_change_threshold")]
    pub color_change_threshold: f32,

    /// Height of the surface zone as a percentage of the frame
    #[serde(default = "default_surface_zone_percent")]
    pub surface_zone_percent: u8,

    /// Seconds of footage used to learn activity and colour baselines
    #[serde(default = "default_baseline_warmup")]
    pub baseline_warmup_secs: u64,

    /// Seconds an activity spike must last
    #[serde(default = "default_spike_sustain")]
    pub spike_sustain_secs: f64,

    /// Seconds surface activity must last
    #[serde(default = "default_surface_sustain")]
    pub surface_sustain_secs: f64,

    /// Seconds a colour drift must last
    #[serde(default = "default_color_sustain")]
    pub color_sustain_secs: f64,

    /// Seconds activity must stay concentrated in one region
    #[serde(default = "default_cluster_sustain")]
    pub cluster_sustain_secs: f64,

    /// Seconds the fish count must deviate
    #[serde(default = "default_count_sustain")]
    pub count_sustain_secs: f64,

    /// Seconds a feeding frenzy must last
    #[serde(default = "default_frenzy_sustain")]
    pub frenzy_sustain_secs: f64,

    /// Detector kinds to register for this tank
    #[serde(default = "default_enabled_detectors")]
    pub enabled: Vec<AlertKind>,
}

/// Alert debouncing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Minimum seconds between two events of the same kind
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Per-kind cooldown overrides in seconds
    #[serde(default)]
    pub per_kind: HashMap<AlertKind, u64>,
}

/// Fish metadata for a tank.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct FishConfig {
    /// Expected number of fish, 0 disables count checks
    #[serde(default)]
    pub count: u32,

    /// Free-form fish profiles
    #[serde(default)]
    pub profiles: Vec<FishProfile>,
}

/// A single fish profile.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FishProfile {
    pub name: String,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Output directory layout, partitioned by tank id.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Root for per-tank clip directories
    #[serde(default = "default_clips_dir")]
    pub clips_dir: String,

    /// Root for per-tank data (alert log)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Notifier delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Pending notices queued per tank
    #[serde(default = "default_notifier_queue_size")]
    pub queue_size: usize,

    /// Delivery attempts per notice
    #[serde(default = "default_notifier_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_notifier_retry_base_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_notifier_retry_max_ms")]
    pub retry_max_delay_ms: u64,

    /// Append every notice to `<data_dir>/alerts.jsonl`
    #[serde(default = "default_alert_log")]
    pub alert_log: bool,

    /// Most recent notices kept in the alert log
    #[serde(default = "default_alert_log_max_entries")]
    pub alert_log_max_entries: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Health reporting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Interval between status reports in seconds
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Port for the Prometheus exporter
    #[serde(default = "default_health_port")]
    pub port: u16,

    /// Enable Prometheus metrics export
    #[serde(default)]
    pub enable_metrics: bool,
}

// Default value functions
fn default_backend() -> SourceBackend {
    SourceBackend::Ffmpeg
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> f32 {
    15.0
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30000
}
fn default_stall_missed_intervals() -> u32 {
    45
}
fn default_max_consecutive_errors() -> u32 {
    10
}
fn default_queue_size() -> usize {
    64
}
fn default_pre_roll() -> u64 {
    10
}
fn default_post_roll() -> u64 {
    30
}
fn default_max_concurrent_clips() -> usize {
    2
}
fn default_shutdown_policy() -> ShutdownPolicy {
    ShutdownPolicy::Drain
}
fn default_overlay() -> bool {
    true
}
fn default_crf() -> u8 {
    23
}
fn default_preset() -> String {
    "veryfast".to_string()
}
fn default_sensitivity() -> u8 {
    50
}
fn default_no_motion_threshold() -> u64 {
    300
}
fn default_color_change_threshold() -> f32 {
    15.0
}
fn default_surface_zone_percent() -> u8 {
    15
}
fn default_baseline_warmup() -> u64 {
    30
}
fn default_spike_sustain() -> f64 {
    2.0
}
fn default_surface_sustain() -> f64 {
    30.0
}
fn default_color_sustain() -> f64 {
    60.0
}
fn default_cluster_sustain() -> f64 {
    120.0
}
fn default_count_sustain() -> f64 {
    60.0
}
fn default_frenzy_sustain() -> f64 {
    3.0
}
fn default_enabled_detectors() -> Vec<AlertKind> {
    AlertKind::ALL.to_vec()
}
fn default_cooldown() -> u64 {
    60
}
fn default_clips_dir() -> String {
    "./clips".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_notifier_queue_size() -> usize {
    32
}
fn default_notifier_max_attempts() -> u32 {
    3
}
fn default_notifier_retry_base_ms() -> u64 {
    500
}
fn default_notifier_retry_max_ms() -> u64 {
    10000
}
fn default_alert_log() -> bool {
    true
}
fn default_alert_log_max_entries() -> usize {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_health_interval() -> u64 {
    60
}
fn default_health_port() -> u16 {
    9100
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            pre_roll_secs: default_pre_roll(),
            post_roll_secs: default_post_roll(),
            max_concurrent_clips: default_max_concurrent_clips(),
            shutdown_policy: default_shutdown_policy(),
            timestamp_overlay: default_overlay(),
            crf: default_crf(),
            preset: default_preset(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            motion_sensitivity: default_sensitivity(),
            no_motion_threshold_secs: default_no_motion_threshold(),
            color_change_threshold: default_color_change_threshold(),
            surface_zone_percent: default_surface_zone_percent(),
            baseline_warmup_secs: default_baseline_warmup(),
            spike_sustain_secs: default_spike_sustain(),
            surface_sustain_secs: default_surface_sustain(),
            color_sustain_secs: default_color_sustain(),
            cluster_sustain_secs: default_cluster_sustain(),
            count_sustain_secs: default_count_sustain(),
            frenzy_sustain_secs: default_frenzy_sustain(),
            enabled: default_enabled_detectors(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            per_kind: HashMap::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            clips_dir: default_clips_dir(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            queue_size: default_notifier_queue_size(),
            max_attempts: default_notifier_max_attempts(),
            retry_base_delay_ms: default_notifier_retry_base_ms(),
            retry_max_delay_ms: default_notifier_retry_max_ms(),
            alert_log: default_alert_log(),
            alert_log_max_entries: default_alert_log_max_entries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            port: default_health_port(),
            enable_metrics: false,
        }
    }
}

impl WatcherConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with TANKWATCH_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Override with environment variables (e.g., TANKWATCH_LOGGING__LEVEL)
            .add_source(
                Environment::with_prefix("TANKWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from an explicit file plus environment overrides.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("TANKWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("TANKWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration of every tank.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.tanks.is_empty() {
            return Err(ConfigValidationError::MissingField("tanks".to_string()));
        }

        let mut seen = HashSet::new();
        for tank in &self.tanks {
            tank.validate()?;
            if !seen.insert(tank.id.as_str()) {
                return Err(ConfigValidationError::DuplicateTank(tank.id.clone()));
            }
        }

        // clip names and alert logs are only unique within one tank
        let mut owners: HashMap<PathBuf, &str> = HashMap::new();
        for tank in &self.tanks {
            for dir in [tank.clips_dir(&self.output), tank.data_dir(&self.output)] {
                match owners.get(&dir) {
                    Some(owner) if *owner != tank.id => {
                        return Err(ConfigValidationError::SharedDirectory {
                            path: dir.display().to_string(),
                            first: owner.to_string(),
                            second: tank.id.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        owners.insert(dir, tank.id.as_str());
                    }
                }
            }
        }

        if self.notifier.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "notifier.queue_size".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }
        if self.notifier.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "notifier.max_attempts".to_string(),
                message: "At least one delivery attempt is required".to_string(),
            });
        }
        if self.notifier.alert_log && self.notifier.alert_log_max_entries == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "notifier.alert_log_max_entries".to_string(),
                message: "The alert log must keep at least one entry".to_string(),
            });
        }

        Ok(())
    }
}

impl TankConfig {
    /// Name used in logs and notices.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Clip directory for this tank.
    pub fn clips_dir(&self, output: &OutputConfig) -> PathBuf {
        match &self.clips_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(&output.clips_dir).join(&self.id),
        }
    }

    /// Data directory for this tank.
    pub fn data_dir(&self, output: &OutputConfig) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(&output.data_dir).join(&self.id),
        }
    }

    /// Validate a single tank, prefixing field names with the tank id.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let field = |name: &str| format!("tanks[{}].{}", self.id, name);

        if self.id.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("tanks[].id".to_string()));
        }
        if self
            .id
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(ConfigValidationError::InvalidValue {
                field: field("id"),
                message: "Tank ids may only contain letters, digits, '-' and '_'".to_string(),
            });
        }

        // Source
        if self.source.input.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(field("source.input")));
        }
        if self.source.backend == SourceBackend::Gstreamer && !cfg!(feature = "gstreamer") {
            return Err(ConfigValidationError::UnsupportedBackend(
                "gstreamer (rebuild with --features gstreamer)".to_string(),
            ));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("source.width/height"),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.source.fps) {
            return Err(ConfigValidationError::InvalidValue {
                field: field("source.fps"),
                message: format!("FPS must be between {} and {}", MIN_FPS, MAX_FPS),
            });
        }
        if self.source.connection_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("source.connection_timeout_secs"),
                message: "Connection timeout must be greater than 0".to_string(),
            });
        }
        if self.source.reconnect_base_delay_ms == 0
            || self.source.reconnect_max_delay_ms < self.source.reconnect_base_delay_ms
        {
            return Err(ConfigValidationError::InvalidValue {
                field: field("source.reconnect_base_delay_ms/reconnect_max_delay_ms"),
                message: "Base delay must be greater than 0 and at most the maximum delay".to_string(),
            });
        }
        if self.source.stall_missed_intervals < 2 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("source.stall_missed_intervals"),
                message: "Stall window must cover at least 2 frame intervals".to_string(),
            });
        }
        if self.source.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("source.queue_size"),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        // Recording
        if self.recording.pre_roll_secs == 0 || self.recording.post_roll_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("recording.pre_roll_secs/post_roll_secs"),
                message: "Pre-roll and post-roll must be greater than 0".to_string(),
            });
        }
        if self.recording.max_concurrent_clips == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("recording.max_concurrent_clips"),
                message: "At least one clip must be allowed in flight".to_string(),
            });
        }
        if self.recording.crf > 51 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("recording.crf"),
                message: "CRF must be between 0 and 51".to_string(),
            });
        }

        // Detection
        let detection = &self.detection;
        if detection.motion_sensitivity > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("detection.motion_sensitivity"),
                message: "Sensitivity must be between 0 and 100".to_string(),
            });
        }
        if detection.no_motion_threshold_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("detection.no_motion_threshold_secs"),
                message: "No-motion threshold must be greater than 0".to_string(),
            });
        }
        if detection.surface_zone_percent == 0 || detection.surface_zone_percent > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: field("detection.surface_zone_percent"),
                message: "Surface zone must be between 1 and 100 percent".to_string(),
            });
        }
        if !(detection.color_change_threshold > 0.0) {
            return Err(ConfigValidationError::InvalidValue {
                field: field("detection.color_change_threshold"),
                message: "Colour threshold must be greater than 0".to_string(),
            });
        }
        let sustains = [
            ("detection.spike_sustain_secs", detection.spike_sustain_secs),
            ("detection.surface_sustain_secs", detection.surface_sustain_secs),
            ("detection.color_sustain_secs", detection.color_sustain_secs),
            ("detection.cluster_sustain_secs", detection.cluster_sustain_secs),
            ("detection.count_sustain_secs", detection.count_sustain_secs),
            ("detection.frenzy_sustain_secs", detection.frenzy_sustain_secs),
        ];
        for (name, secs) in sustains {
            if !(secs >= 0.0 && secs.is_finite()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: field(name),
                    message: "Durations must be finite and non-negative".to_string(),
                });
            }
        }
        if detection.enabled.is_empty() {
            return Err(ConfigValidationError::MissingField(field("detection.enabled")));
        }

        Ok(())
    }
}

/// Accepted frame rate range.
pub const MIN_FPS: f32 = 1.0;
pub const MAX_FPS: f32 = 120.0;

impl SourceConfig {
    /// Nominal interval between two frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.fps)
    }

    /// Time without frames after which the tank is considered stalled.
    pub fn stall_timeout(&self) -> Duration {
        self.frame_interval() * self.stall_missed_intervals
    }

    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get base reconnection delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum reconnection delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl RecordingConfig {
    pub fn pre_roll(&self) -> Duration {
        Duration::from_secs(self.pre_roll_secs)
    }

    pub fn post_roll(&self) -> Duration {
        Duration::from_secs(self.post_roll_secs)
    }
}

impl AlertConfig {
    /// Cooldown for a kind, honouring per-kind overrides.
    pub fn cooldown_for(&self, kind: AlertKind) -> Duration {
        let secs = self.per_kind.get(&kind).copied().unwrap_or(self.cooldown_secs);
        Duration::from_secs(secs)
    }
}

impl NotifierConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Duplicate tank id: {0}")]
    DuplicateTank(String),

    #[error("Unsupported source backend: {0}")]
    UnsupportedBackend(String),

    #[error("Tanks {first} and {second} share directory {path}")]
    SharedDirectory {
        path: String,
        first: String,
        second: String,
    },
}

#[cfg(test)]
pub(crate) fn create_test_tank(id: &str) -> TankConfig {
    TankConfig {
        id: id.to_string(),
        name: Some(format!("Tank {}", id)),
        source: SourceConfig {
            backend: SourceBackend::Ffmpeg,
            input: "rtsp://camera:554/stream".to_string(),
            width: 32,
            height: 24,
            fps: 1.0,
            transport: "tcp".to_string(),
            connection_timeout_secs: 5,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 1000,
            stall_missed_intervals: 10,
            max_consecutive_errors: 3,
            queue_size: 16,
        },
        recording: RecordingConfig::default(),
        detection: DetectionConfig::default(),
        alerts: AlertConfig::default(),
        fish: FishConfig::default(),
        clips_dir: None,
        data_dir: None,
    }
}
