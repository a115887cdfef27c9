//! # Data Ingestors Module
//!
//! The clients that bring posts into the relay.
//!
//! ## Contained Modules:
//! - **`mastodon_wss`**: the upstream client. Snapshot fetches over HTTP and
//!   the WebSocket push connection to the streaming API, plus the
//!   `FeedSource` seam the rest of the relay is written against.
//! - **`mastodon_polling`**: the fixed-interval poller used once the push
//!   connection has been given up.

#![forbid(unsafe_code)]

/// The upstream client for the Mastodon REST and streaming APIs.
pub mod mastodon_wss;
/// The fallback poller for the public timeline.
pub mod mastodon_polling;

// --- Public API Re-exports ---
pub use mastodon_wss::{FeedSource, MastodonClient, MastodonConfig, PushConnection};
pub use mastodon_polling::{MastodonPoller, PollerHandle};
