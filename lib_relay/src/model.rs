//! # Relay Data Model
//!
//! The records that flow through the relay. A [`Post`] is received from the
//! upstream instance and relayed as-is: the relay reads a handful of fields
//! (identity, timestamp) and never rewrites anything, including markup in
//! `content`. Fields the relay does not model are kept in a flattened map so
//! they survive the round trip to subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single status from the public timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Identity of the post, unique within a snapshot.
    pub id: String,
    /// Rich text (HTML) exactly as the instance sent it.
    #[serde(default)]
    pub content: String,
    /// The author of the post.
    pub account: Account,
    /// Creation time as sent upstream (RFC 3339).
    pub created_at: String,
    /// Ordered media attachments.
    #[serde(default)]
    pub media_attachments: Vec<MediaAttachment>,
    /// Everything else the instance sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Post {
    /// Parses `created_at`. Returns `None` when the instance sent something
    /// that is not RFC 3339.
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Author of a [`Post`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Local handle.
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    /// Avatar image URL.
    #[serde(default)]
    pub avatar: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One attachment of a [`Post`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    /// `image`, `video`, `gifv`, `audio` or `unknown`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Resolvable reference to the media. Remote media may not have one yet.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// # Relay Event
///
/// What a subscriber receives. Serialized as
/// `{"event": "initial_posts", "data": [...]}` or
/// `{"event": "mastodon_post", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    /// The personalised snapshot sent once, right after joining.
    InitialPosts(Arc<Vec<Post>>),
    /// A single live post, broadcast to everyone.
    MastodonPost(Arc<Post>),
}

impl RelayEvent {
    /// The `event` tag as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::InitialPosts(_) => "initial_posts",
            RelayEvent::MastodonPost(_) => "mastodon_post",
        }
    }
}
