//! Exercises `MastodonClient` and the reconnect controller against a local
//! stand-in for a Mastodon instance.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{rejection::WebSocketUpgradeRejection, Message, WebSocketUpgrade};
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use lib_relay::core::{ConnectionState, Dispatcher, ReconnectPolicy, UpstreamManager};
use lib_relay::ingestors::{FeedSource, MastodonClient, MastodonConfig};
use lib_relay::{ConnectError, FetchError, RelayEvent};

const TOKEN: &str = "secret";

fn post_json(id: &str, created_at: &str) -> Value {
    json!({
        "id": id,
        "content": format!("<p>post {}</p>", id),
        "created_at": created_at,
        "url": format!("https://example.social/@dana/{}", id),
        "account": { "username": "dana", "display_name": "Dana", "avatar": "https://example.social/a.png" },
        "media_attachments": [{ "type": "image", "url": "https://example.social/m.png" }]
    })
}

/// Requires the bearer credential and a `mastodon-relay/` user agent.
fn identified(headers: &HeaderMap) -> bool {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    header("authorization") == Some(format!("Bearer {}", TOKEN).as_str())
        && header("user-agent").is_some_and(|ua| ua.starts_with("mastodon-relay/"))
}

async fn timeline(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Response {
    if !identified(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if query.get("limit").map(String::as_str) != Some("20") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    // Newest first, as Mastodon answers.
    Json(json!([
        post_json("2", "2024-05-01T10:00:02.000Z"),
        post_json("1", "2024-05-01T10:00:01.000Z"),
    ]))
    .into_response()
}

/// Answers the resolution GET with 200 and the upgrade with a short scripted
/// stream. Both must carry the relay's credentials.
async fn streaming(headers: HeaderMap, ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>) -> Response {
    if !identified(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Ok(ws) = ws else {
        return StatusCode::OK.into_response();
    };
    ws.on_upgrade(|mut socket| async move {
        let update = json!({ "event": "update", "payload": post_json("7", "2024-05-01T10:00:07.000Z").to_string() });
        let frames = [
            "not json".to_string(),
            json!({ "event": "delete", "payload": "3" }).to_string(),
            json!({ "event": "update", "payload": "{broken" }).to_string(),
            update.to_string(),
        ];
        for frame in frames {
            if socket.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/chain/api/v1/timelines/public", get(timeline))
        .route("/chain/api/v1/streaming/public", get(|| async { Redirect::temporary("/hop/1") }))
        .route("/hop/1", get(|| async { Redirect::temporary("/hop/2") }))
        .route("/hop/2", get(|| async { Redirect::temporary("/final/api/v1/streaming/public") }))
        .route("/final/api/v1/streaming/public", get(streaming))
        .route(
            "/loop/api/v1/streaming/public",
            get(|| async { Redirect::temporary("/loop/back") }),
        )
        .route(
            "/loop/back",
            get(|| async { Redirect::temporary("/loop/api/v1/streaming/public?stream=public") }),
        )
        .route("/many/api/v1/streaming/public", get(|| async { Redirect::temporary("/many/1") }))
        .route(
            "/many/{n}",
            get(|Path(n): Path<u32>| async move { Redirect::temporary(&format!("/many/{}", n + 1)) }),
        )
        .route("/broken/api/v1/streaming/public", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/broken/api/v1/timelines/public", get(timeline));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr, prefix: &str) -> MastodonClient {
    MastodonClient::new(MastodonConfig {
        server: format!("http://{}/{}", addr, prefix),
        access_token: Some(TOKEN.to_string()),
        http_retries: 0,
        ..MastodonConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn snapshot_sends_limit_and_bearer_token() {
    let addr = spawn_upstream().await;
    let posts = client(addr, "chain").fetch_snapshot().await.unwrap();

    let ids: Vec<_> = posts.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "1"]);
    assert_eq!(posts[0].account.username, "dana");
    assert_eq!(posts[0].media_attachments[0].kind, "image");
    // Fields the relay does not model survive untouched.
    assert_eq!(posts[0].extra["url"], "https://example.social/@dana/2");
}

#[tokio::test]
async fn snapshot_without_credentials_is_a_status_error() {
    let addr = spawn_upstream().await;
    let anonymous = MastodonClient::new(MastodonConfig {
        server: format!("http://{}/chain", addr),
        http_retries: 0,
        ..MastodonConfig::default()
    })
    .unwrap();

    match anonymous.fetch_snapshot().await {
        Err(FetchError::Status { status, .. }) => assert_eq!(status, 401),
        other => panic!("expected 401, got {:?}", other.map(|p| p.len())),
    }
}

#[tokio::test]
async fn snapshot_of_unknown_instance_path_is_a_status_error() {
    let addr = spawn_upstream().await;
    match client(addr, "missing").fetch_snapshot().await {
        Err(FetchError::Status { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected 404, got {:?}", other.map(|p| p.len())),
    }
}

#[tokio::test]
async fn redirect_chain_is_followed_to_a_push_url() {
    let addr = spawn_upstream().await;
    let url = client(addr, "chain").resolve_stream_url().await.unwrap();
    assert_eq!(url.scheme(), "ws");
    assert_eq!(url.path(), "/final/api/v1/streaming/public");
}

#[tokio::test]
async fn push_endpoint_rejects_anonymous_clients() {
    let addr = spawn_upstream().await;
    let anonymous = MastodonClient::new(MastodonConfig {
        server: format!("http://{}/chain", addr),
        http_retries: 0,
        ..MastodonConfig::default()
    })
    .unwrap();

    match anonymous.open_stream().await {
        Err(ConnectError::UnexpectedStatus { status, .. }) => assert_eq!(status, 401),
        Err(other) => panic!("expected a 401, got {other}"),
        Ok(_) => panic!("anonymous push connection was accepted"),
    }
}

#[tokio::test]
async fn upgrade_without_credentials_is_refused() {
    let addr = spawn_upstream().await;
    let url = format!("ws://{}/final/api/v1/streaming/public", addr);
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
}

#[tokio::test]
async fn redirect_loop_is_rejected() {
    let addr = spawn_upstream().await;
    let err = client(addr, "loop").resolve_stream_url().await.unwrap_err();
    assert!(matches!(err, ConnectError::RedirectLoop(_)), "{err}");
}

#[tokio::test]
async fn endless_redirects_are_capped() {
    let addr = spawn_upstream().await;
    let err = client(addr, "many").resolve_stream_url().await.unwrap_err();
    assert!(matches!(err, ConnectError::TooManyRedirects(5)), "{err}");
}

#[tokio::test]
async fn error_status_fails_resolution() {
    let addr = spawn_upstream().await;
    match client(addr, "broken").resolve_stream_url().await {
        Err(ConnectError::UnexpectedStatus { status, .. }) => assert_eq!(status, 500),
        other => panic!("expected UnexpectedStatus, got {:?}", other),
    }
}

#[tokio::test]
async fn push_connection_yields_only_valid_updates() {
    let addr = spawn_upstream().await;
    let mut conn = client(addr, "chain").open_stream().await.unwrap();

    let post = tokio::time::timeout(Duration::from_secs(5), conn.next_post())
        .await
        .unwrap()
        .expect("the update frame");
    assert_eq!(post.id, "7");

    let end = tokio::time::timeout(Duration::from_secs(5), conn.next_post()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn unreachable_stream_falls_back_to_polling() {
    let addr = spawn_upstream().await;
    let source = Arc::new(client(addr, "broken"));
    let dispatcher = Arc::new(Dispatcher::new());
    let mut sub = dispatcher.add_client("observer");

    let manager = UpstreamManager::new(
        source,
        dispatcher.clone(),
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_retries: 2,
        },
        Duration::from_millis(50),
    );
    let mut state = manager.subscribe_state();
    let shutdown = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(manager.run(shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Polling))
        .await
        .unwrap()
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap() {
            Some(RelayEvent::MastodonPost(p)) => ids.push(p.id.clone()),
            other => panic!("unexpected {:?}", other.map(|e| e.name())),
        }
    }
    assert_eq!(ids, vec!["1", "2"]);

    shutdown.cancel();
    task.await.unwrap();
}
