//! # lib_relay
//!
//! Relays the public Mastodon firehose to connected subscribers: an upstream
//! client for the REST and streaming APIs, a reconnect controller that falls
//! back to polling, and a fanout hub.

pub mod configs;
pub mod core;
pub mod error;
pub mod ingestors;
pub mod loggers;
pub mod model;
pub mod retrieve;

// Re-export the commonly used types
pub use error::{ConfigError, ConnectError, DeliveryError, FetchError, FrameDecodeError};
pub use model::{Account, MediaAttachment, Post, RelayEvent};
