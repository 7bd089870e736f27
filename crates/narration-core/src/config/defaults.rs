pub(crate) fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

pub(crate) fn default_cache_dir() -> String {
    ".cache/resources".to_string()
}

pub(crate) fn default_state_dir() -> String {
    ".cache/state".to_string()
}

pub(crate) fn default_request_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_tick_interval_ms() -> u64 {
    33
}

pub(crate) fn default_sentence_anticipation_secs() -> f64 {
    crate::sentences::DEFAULT_ANTICIPATION_SECS
}

pub(crate) fn default_waveform_buckets() -> usize {
    crate::waveform::DEFAULT_BUCKETS
}

pub(crate) fn default_display_mode() -> crate::timeline::DisplayMode {
    crate::timeline::DisplayMode::Sentence
}

pub(crate) fn default_volume() -> f32 {
    1.0
}

pub(crate) fn default_log_level() -> crate::config::LogLevel {
    crate::config::LogLevel::Info
}
