//! # Relay Error Taxonomy
//!
//! None of these errors ever ends the process. Each one has a fixed owner that
//! recovers from it:
//!
//! - [`FetchError`]: the caller of a snapshot fetch treats it as an empty batch.
//! - [`ConnectError`]: drives the reconnect controller into backoff.
//! - [`FrameDecodeError`]: the frame is logged and dropped, the connection stays up.
//! - [`DeliveryError`]: the subscriber (gone or lagging) is dropped, the others are unaffected.

use thiserror::Error;

/// A snapshot request failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid snapshot url: {0}")]
    Url(#[from] url::ParseError),

    #[error("snapshot request failed: {0}")]
    Network(#[from] reqwest_middleware::Error),

    #[error("snapshot endpoint answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("snapshot body could not be decoded: {0}")]
    Decode(#[from] reqwest::Error),
}

/// Resolving or opening the push connection failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid streaming url: {0}")]
    Url(#[from] url::ParseError),

    #[error("streaming endpoint resolution failed: {0}")]
    Resolve(#[from] reqwest::Error),

    #[error("redirect loop while resolving streaming endpoint at {0}")]
    RedirectLoop(String),

    #[error("more than {0} redirects while resolving streaming endpoint")]
    TooManyRedirects(usize),

    #[error("redirect from {0} carries no usable Location header")]
    MissingLocation(String),

    #[error("streaming endpoint {url} answered {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("unsupported streaming scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid header value for the streaming request")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A single push frame could not be turned into a post.
#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("frame is not a valid event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("'{0}' frame has no payload")]
    MissingPayload(String),

    #[error("update payload is not a valid post: {0}")]
    Payload(#[source] serde_json::Error),
}

/// A subscriber could not be reached.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber {0} is gone")]
    Closed(u64),

    #[error("subscriber {0} fell too far behind")]
    Lagging(u64),
}

/// Configuration could not be resolved into usable settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MASTODON_SERVER must be an absolute http(s) url, got '{0}'")]
    InvalidServer(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("config file {path} could not be used: {reason}")]
    File { path: String, reason: String },

    #[error("http client could not be built: {0}")]
    HttpClient(#[from] reqwest::Error),
}
