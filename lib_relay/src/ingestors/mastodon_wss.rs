//! # Mastodon Upstream Client
//!
//! Talks to the upstream instance in the two ways the relay needs:
//!
//! - **Snapshot**: `GET {server}/api/v1/timelines/public?limit=N`, a JSON array
//!   of posts, newest first.
//! - **Push connection**: a WebSocket on `{server}/api/v1/streaming/public`.
//!   Instances often answer the HTTPS form of that URL with a redirect to a
//!   dedicated streaming host, so the endpoint is resolved over plain HTTP
//!   first (bounded redirect chain, loops rejected) and only then upgraded
//!   with the matching `wss`/`ws` scheme.
//!
//! Every push frame is an envelope `{"event": "...", "payload": "<json>"}`.
//! Only `update` frames carry a new post; everything else is ignored and a
//! malformed frame is logged and dropped without touching the connection.

use std::collections::HashSet;
use std::future::Future;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, LOCATION, USER_AGENT};
use reqwest::{Method, Url};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::{ConfigError, ConnectError, FetchError, FrameDecodeError};
use crate::model::Post;
use crate::retrieve::ky_http::ApiClient;

const TIMELINE_PATH: &str = "api/v1/timelines/public";
const STREAMING_PATH: &str = "api/v1/streaming/public";
/// The push frame tag that carries a new post.
pub const UPDATE_EVENT: &str = "update";

/// # Feed Source
///
/// The two capabilities the relay needs from upstream. The reconnect
/// controller, the poller and the fanout hub are generic over this trait so
/// they can run against synthetic sources.
pub trait FeedSource: Send + Sync + 'static {
    /// Fetches the most recent batch of posts.
    fn fetch_snapshot(&self) -> impl Future<Output = Result<Vec<Post>, FetchError>> + Send;

    /// Opens a push connection that yields decoded posts until it closes.
    fn open_stream(&self) -> impl Future<Output = Result<PushConnection, ConnectError>> + Send;
}

/// Fetches a snapshot, logging and swallowing failures.
///
/// Snapshot failures are never fatal to the caller: they read as an empty batch.
pub async fn snapshot_or_empty<S: FeedSource>(source: &S) -> Vec<Post> {
    match source.fetch_snapshot().await {
        Ok(posts) => posts,
        Err(e) => {
            tracing::warn!(error = %e, "Snapshot fetch failed, treating as empty");
            Vec::new()
        }
    }
}

/// # Push Connection
///
/// A live upstream event stream reduced to the posts it carries. The stream
/// ends exactly once, when the connection closes for any reason.
pub struct PushConnection {
    posts: BoxStream<'static, Post>,
}

impl PushConnection {
    /// Wraps an already-decoded stream of posts.
    pub fn new<S>(posts: S) -> Self
    where
        S: Stream<Item = Post> + Send + 'static,
    {
        Self { posts: posts.boxed() }
    }

    /// Wraps a stream of raw WebSocket messages, decoding `update` frames and
    /// dropping everything else.
    pub fn from_frames<S, E>(frames: S) -> Self
    where
        S: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let posts = stream::unfold(frames, |mut frames| async move {
            loop {
                match frames.next().await {
                    Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                        Ok(Some(post)) => return Some((post, frames)),
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping malformed streaming frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Streaming API closed the connection");
                        return None;
                    }
                    // Ping/pong are answered by tungstenite, binary frames are not part of the API.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Streaming connection failed");
                        return None;
                    }
                    None => return None,
                }
            }
        });
        Self::new(posts)
    }

    /// Next decoded post, or `None` once the connection is closed.
    ///
    /// Cancel safe.
    pub async fn next_post(&mut self) -> Option<Post> {
        self.posts.next().await
    }
}

#[derive(Deserialize)]
struct StreamingFrame {
    event: String,
    #[serde(default)]
    payload: Option<String>,
}

/// Decodes one push frame.
///
/// Returns `Ok(None)` for well-formed frames that are not `update`.
pub fn decode_frame(text: &str) -> Result<Option<Post>, FrameDecodeError> {
    let frame: StreamingFrame = serde_json::from_str(text).map_err(FrameDecodeError::Envelope)?;
    if frame.event != UPDATE_EVENT {
        tracing::trace!(event = %frame.event, "Ignoring streaming event");
        return Ok(None);
    }
    let payload = frame
        .payload
        .ok_or(FrameDecodeError::MissingPayload(frame.event))?;
    serde_json::from_str(&payload)
        .map(Some)
        .map_err(FrameDecodeError::Payload)
}

/// Maps the request/response scheme to its push counterpart.
pub fn to_push_scheme(mut url: Url) -> Result<Url, ConnectError> {
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectError::UnsupportedScheme(url.scheme().to_string()))?;
    Ok(url)
}

/// Configuration for the Mastodon upstream.
#[derive(Debug, Clone)]
pub struct MastodonConfig {
    /// Base URL of the instance.
    pub server: String,
    /// Optional bearer credential, sent on every upstream request.
    pub access_token: Option<String>,
    /// `limit` of the snapshot request.
    pub snapshot_limit: u32,
    /// Redirect hops allowed while resolving the streaming endpoint.
    pub max_redirects: usize,
    /// Retries of transient snapshot failures inside a single fetch.
    pub http_retries: u32,
    pub user_agent: String,
}

impl Default for MastodonConfig {
    fn default() -> Self {
        Self {
            server: "https://mastodon.social".to_string(),
            access_token: None,
            snapshot_limit: 20,
            max_redirects: 5,
            http_retries: 2,
            user_agent: concat!("mastodon-relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// The production [`FeedSource`].
pub struct MastodonClient {
    config: MastodonConfig,
    api: ApiClient,
    /// Never follows redirects on its own; resolution walks them by hand.
    resolver: reqwest::Client,
}

impl MastodonClient {
    /// Builds the HTTP clients for the configured instance.
    ///
    /// # Errors
    /// The server URL is not absolute or the HTTP client cannot be built.
    pub fn new(config: MastodonConfig) -> Result<Self, ConfigError> {
        let api = ApiClient::new(&config.server, config.access_token.clone(), config.http_retries)
            .map_err(|_| ConfigError::InvalidServer(config.server.clone()))?;
        let resolver = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { config, api, resolver })
    }

    pub fn config(&self) -> &MastodonConfig {
        &self.config
    }

    /// Resolves the push endpoint, following at most `max_redirects` hops.
    ///
    /// # Errors
    /// Redirect loops, too many hops, a redirect without `Location`, any
    /// status that is neither 2xx nor 3xx, and transport failures.
    pub async fn resolve_stream_url(&self) -> Result<Url, ConnectError> {
        let mut current = self.api.base_url().join(STREAMING_PATH)?;
        current.query_pairs_mut().append_pair("stream", "public");

        let mut visited = HashSet::new();
        for hop in 0..=self.config.max_redirects {
            if !visited.insert(current.to_string()) {
                return Err(ConnectError::RedirectLoop(current.to_string()));
            }

            let mut req = self
                .resolver
                .get(current.clone())
                .header(USER_AGENT, &self.config.user_agent);
            if let Some(token) = &self.config.access_token {
                req = req.header(AUTHORIZATION, format!("Bearer {}", token));
            }

            // Only the status line and headers matter; the body is dropped unread.
            let response = req.send().await?;
            let status = response.status();

            if status.is_success() {
                tracing::debug!(url = %current, hops = hop, "Resolved streaming endpoint");
                return to_push_scheme(current);
            }

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ConnectError::MissingLocation(current.to_string()))?;
                let next = current.join(location)?;
                tracing::debug!(from = %current, to = %next, "Following streaming redirect");
                current = next;
                continue;
            }

            return Err(ConnectError::UnexpectedStatus {
                url: current.to_string(),
                status: status.as_u16(),
            });
        }

        Err(ConnectError::TooManyRedirects(self.config.max_redirects))
    }
}

impl FeedSource for MastodonClient {
    async fn fetch_snapshot(&self) -> Result<Vec<Post>, FetchError> {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert(USER_AGENT, ua);
        }

        let posts = self
            .api
            .request::<Vec<Post>>(
                Method::GET,
                TIMELINE_PATH,
                &[("limit", self.config.snapshot_limit.to_string())],
                Some(headers),
            )
            .await?
            .into_data()?;

        tracing::debug!(count = posts.len(), "Fetched timeline snapshot");
        Ok(posts)
    }

    async fn open_stream(&self) -> Result<PushConnection, ConnectError> {
        let url = self.resolve_stream_url().await?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(USER_AGENT, HeaderValue::from_str(&self.config.user_agent)?);
        if let Some(token) = &self.config.access_token {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);
        }

        let (ws_stream, response) = connect_async(request).await?;
        tracing::info!(url = %url, status = %response.status(), "Connected to Mastodon streaming API");

        Ok(PushConnection::from_frames(ws_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update_frame(id: &str) -> String {
        let payload = json!({
            "id": id,
            "content": "<p>hello</p>",
            "created_at": "2024-05-01T10:00:00.000Z",
            "account": { "username": "carol", "display_name": "Carol", "avatar": "a.png" },
            "media_attachments": []
        });
        json!({ "event": "update", "payload": payload.to_string() }).to_string()
    }

    #[test]
    fn update_frames_yield_posts() {
        let post = decode_frame(&update_frame("42")).unwrap().unwrap();
        assert_eq!(post.id, "42");
        assert_eq!(post.account.username, "carol");
    }

    #[test]
    fn other_events_are_ignored() {
        let delete = json!({ "event": "delete", "payload": "42" }).to_string();
        assert!(decode_frame(&delete).unwrap().is_none());

        let filters = json!({ "event": "filters_changed" }).to_string();
        assert!(decode_frame(&filters).unwrap().is_none());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(decode_frame("not json"), Err(FrameDecodeError::Envelope(_))));

        let no_payload = json!({ "event": "update" }).to_string();
        assert!(matches!(decode_frame(&no_payload), Err(FrameDecodeError::MissingPayload(_))));

        let bad_payload = json!({ "event": "update", "payload": "{oops" }).to_string();
        assert!(matches!(decode_frame(&bad_payload), Err(FrameDecodeError::Payload(_))));
    }

    #[tokio::test]
    async fn malformed_frames_do_not_close_the_connection() {
        let frames = vec![
            Ok::<_, String>(Message::text("garbage")),
            Ok(Message::text(update_frame("1"))),
            Ok(Message::text(json!({ "event": "update", "payload": "{" }).to_string())),
            Ok(Message::Ping(Vec::new().into())),
            Ok(Message::text(json!({ "event": "delete", "payload": "1" }).to_string())),
            Ok(Message::text(update_frame("2"))),
        ];
        let mut conn = PushConnection::from_frames(stream::iter(frames));

        assert_eq!(conn.next_post().await.unwrap().id, "1");
        assert_eq!(conn.next_post().await.unwrap().id, "2");
        assert!(conn.next_post().await.is_none());
    }

    #[tokio::test]
    async fn close_and_errors_end_the_stream() {
        let frames = vec![
            Ok::<_, String>(Message::text(update_frame("1"))),
            Ok(Message::Close(None)),
            Ok(Message::text(update_frame("2"))),
        ];
        let mut conn = PushConnection::from_frames(stream::iter(frames));
        assert_eq!(conn.next_post().await.unwrap().id, "1");
        assert!(conn.next_post().await.is_none());

        let frames = vec![Err::<Message, _>("reset".to_string()), Ok(Message::text(update_frame("3")))];
        let mut conn = PushConnection::from_frames(stream::iter(frames));
        assert!(conn.next_post().await.is_none());
    }

    #[test]
    fn push_scheme_follows_request_scheme() {
        let secure = to_push_scheme(Url::parse("https://streaming.example/api/v1/streaming/public").unwrap()).unwrap();
        assert_eq!(secure.scheme(), "wss");
        let plain = to_push_scheme(Url::parse("http://127.0.0.1:4000/x").unwrap()).unwrap();
        assert_eq!(plain.as_str(), "ws://127.0.0.1:4000/x");
        assert!(matches!(
            to_push_scheme(Url::parse("ftp://example.org/").unwrap()),
            Err(ConnectError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn invalid_server_is_a_config_error() {
        let config = MastodonConfig { server: "not a url".into(), ..Default::default() };
        assert!(matches!(MastodonClient::new(config), Err(ConfigError::InvalidServer(_))));
    }
}
