use crate::timeline::DisplayMode;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const MIN_TICK_INTERVAL_MS: u64 = 10;
pub const MAX_TICK_INTERVAL_MS: u64 = 250;
pub const MAX_ANTICIPATION_SECS: f64 = 5.0;
pub const MAX_VOLUME: f32 = 2.0;

/// High-level app configuration; deserializable from TOML.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AppConfig {
    #[serde(default = "crate::config::defaults::default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "crate::config::defaults::default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "crate::config::defaults::default_state_dir")]
    pub state_dir: String,
    #[serde(default = "crate::config::defaults::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "crate::config::defaults::default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "crate::config::defaults::default_sentence_anticipation_secs")]
    pub sentence_anticipation_secs: f64,
    #[serde(default = "crate::config::defaults::default_waveform_buckets")]
    pub waveform_buckets: usize,
    #[serde(default = "crate::config::defaults::default_display_mode")]
    pub display_mode: DisplayMode,
    #[serde(default = "crate::config::defaults::default_volume")]
    pub volume: f32,
    #[serde(default = "crate::config::defaults::default_log_level")]
    pub log_level: LogLevel,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            api_base_url: crate::config::defaults::default_api_base_url(),
            cache_dir: crate::config::defaults::default_cache_dir(),
            state_dir: crate::config::defaults::default_state_dir(),
            request_timeout_secs: crate::config::defaults::default_request_timeout_secs(),
            tick_interval_ms: crate::config::defaults::default_tick_interval_ms(),
            sentence_anticipation_secs:
                crate::config::defaults::default_sentence_anticipation_secs(),
            waveform_buckets: crate::config::defaults::default_waveform_buckets(),
            display_mode: crate::config::defaults::default_display_mode(),
            volume: crate::config::defaults::default_volume(),
            log_level: crate::config::defaults::default_log_level(),
        }
    }
}

impl AppConfig {
    /// Keep runtime values in bounds regardless of where the config came from.
    pub fn clamped(mut self) -> Self {
        self.tick_interval_ms = self
            .tick_interval_ms
            .clamp(MIN_TICK_INTERVAL_MS, MAX_TICK_INTERVAL_MS);
        self.sentence_anticipation_secs = if self.sentence_anticipation_secs.is_finite() {
            self.sentence_anticipation_secs.clamp(0.0, MAX_ANTICIPATION_SECS)
        } else {
            crate::config::defaults::default_sentence_anticipation_secs()
        };
        self.waveform_buckets = self.waveform_buckets.max(1);
        self.volume = if self.volume.is_finite() {
            self.volume.clamp(0.0, MAX_VOLUME)
        } else {
            crate::config::defaults::default_volume()
        };
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.api_base_url = self.api_base_url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_root(&self) -> PathBuf {
        PathBuf::from(&self.cache_dir)
    }

    pub fn state_root(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
