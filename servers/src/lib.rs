//! # Relay Servers
//!
//! The subscriber-facing half of the Mastodon relay: the axum router that
//! upgrades `/ws` connections into dispatcher subscriptions and reports
//! `/health`.

#![forbid(unsafe_code)]

pub mod mastodon_logic;
