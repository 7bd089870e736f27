//! Content engine for narrated-chapter playback: caption parsing and lookup,
//! sentence merging, waveform extraction, conditional resource caching and
//! durable chapter state with offline fallback.

pub mod api;
pub mod cache;
pub mod caption;
pub mod config;
pub mod error;
pub mod library;
pub mod playback;
pub mod remote;
pub mod sentences;
pub mod session;
pub mod store;
pub mod timeline;
pub mod waveform;

pub use error::{Error, Result};
