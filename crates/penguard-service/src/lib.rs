//! Foreground collector daemon for penguard acoustic sensors.
//!
//! This crate runs a [`penguard_core::SensorSystem`] as a long-lived process:
//! - Loads settings from a TOML file, with CLI overrides
//! - Logs the system event stream through `tracing`
//! - Shuts down cleanly on Ctrl-C
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/penguard/penguard.toml`:
//!
//! ```toml
//! [system]
//! max_concurrent_connections = 10
//! scan_interval_ms = 5000
//! max_buffer_size = 1000
//! processing_interval_ms = 100
//! max_batch_size = 50
//!
//! [profiles.penguin_detector]
//! max_reconnect_attempts = 5
//! reconnect_delay_ms = 5000
//! keep_alive_interval_ms = 2000
//! max_missed_keep_alives = 3
//! ```
//!
//! Every key is optional; missing keys use the built-in defaults.

pub mod config;

pub use config::{
    Config, ConfigError, ProfileOverrides, SystemSection, ValidationError, default_config_path,
};
