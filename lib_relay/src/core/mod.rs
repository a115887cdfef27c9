//! # Core Engine Module
//!
//! The two components that coordinate the relay at runtime.
//!
//! - **`dispatcher`**: the fanout hub. Holds the connected subscribers, hands
//!   each newcomer its own snapshot and broadcasts every live post to all of
//!   them with a single shared allocation per post.
//!
//! - **`upstream_manager`**: the reconnect controller. Owns the one
//!   `ConnectionState` of the process and moves it between `Connecting`,
//!   `Streaming`, `Backoff` and, once retries are exhausted, `Polling`.

#![forbid(unsafe_code)]

/// The fanout hub distributing posts to subscribers.
pub mod dispatcher;
/// The reconnect/fallback state machine and its driver.
pub mod upstream_manager;

// --- Public API Re-exports ---
pub use dispatcher::{Dispatcher, SubscriberId, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use upstream_manager::{
    Action, ConnectionMachine, ConnectionState, ControllerEvent, ReconnectPolicy, UpstreamManager,
};
