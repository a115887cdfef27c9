//! Subscriber-facing routes.
//!
//! - `GET /ws` upgrades to a WebSocket. The subscriber first receives an
//!   `initial_posts` event with its own snapshot, then one `mastodon_post`
//!   event per live post. Anything the subscriber sends is ignored.
//! - `GET /health` reports liveness, the upstream state and the number of
//!   connected subscribers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use lib_relay::ingestors::FeedSource;
use lib_relay::model::RelayEvent;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::mastodon_logic::state::AppState;

/// Builds the router. Any origin is allowed.
pub fn router<S: FeedSource>(state: AppState<S>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler::<S>))
        .route("/health", get(health_handler::<S>))
        .layer(cors)
        .with_state(state)
}

/// Serves the router on `port` until `shutdown` is cancelled. Serves TLS when
/// a certificate and key are given.
pub async fn run<S: FeedSource>(
    port: u16,
    tls: Option<(PathBuf, PathBuf)>,
    app_state: AppState<S>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(app_state).into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    if let Some((cert_path, key_path)) = tls {
        tracing::info!("Loading TLS certs from: {}", cert_path.display());
        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .with_context(|| format!("loading TLS configuration from {}", cert_path.display()))?;

        let handle = axum_server::Handle::new();
        let signal_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            tracing::info!("Downstream server shutting down.");
            signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        tracing::info!("Downstream server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app)
            .await
            .context("TLS server failed")?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        tracing::info!("Downstream server listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("Downstream server shutting down.");
            })
            .await
            .context("server failed")?;
    }

    Ok(())
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    upstream: &'static str,
    subscribers: usize,
}

async fn health_handler<S: FeedSource>(State(state): State<AppState<S>>) -> impl IntoResponse {
    let upstream = state.upstream_state.borrow().label();
    Json(Health {
        status: "OK",
        upstream,
        subscribers: state.dispatcher.subscriber_count(),
    })
}

async fn ws_handler<S: FeedSource>(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket<S: FeedSource>(mut socket: WebSocket, state: AppState<S>, addr: SocketAddr) {
    let label = format!("ws-{}", addr);
    let mut subscription = state.dispatcher.join(&label, state.source.clone());
    let id = subscription.id();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Subscribers have nothing to say
                Some(Ok(_)) => {}
            },
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if !send_event(&mut socket, &event).await {
                    break;
                }
            }
        }
    }

    state.dispatcher.remove_client(id);
}

/// Returns `false` once the subscriber is unreachable.
async fn send_event(socket: &mut WebSocket, event: &RelayEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, event = event.name(), "Failed to encode event");
            true
        }
    }
}
