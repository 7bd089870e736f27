//! Configuration loading for the narration player.
//!
//! All user-tunable settings are centralized here and loaded from
//! `conf/config.toml` if present. Any missing or invalid entries fall back to
//! sensible defaults so playback can still start.

mod defaults;
mod io;
mod models;

pub use io::{DEFAULT_CONFIG_PATH, load_config, parse_config, serialize_config};
pub use models::{AppConfig, LogLevel};
