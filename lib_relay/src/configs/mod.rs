//! # Configuration Modules
//!
//! Layered settings for the relay server.

/// Defaults, JSON file, environment and command-line layering plus validation.
pub mod config_relay;

pub use config_relay::{load_config, Config, FileLayer, RelaySettings};
