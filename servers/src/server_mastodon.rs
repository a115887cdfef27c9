//! # Mastodon Firehose Relay
//!
//! Holds one upstream connection to a Mastodon instance's public stream and
//! relays every post to the WebSocket subscribers connected on `/ws`. When the
//! push connection cannot be kept up the relay falls back to polling the
//! public timeline.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_relay::configs::{load_config, RelaySettings};
use lib_relay::core::{Dispatcher, UpstreamManager};
use lib_relay::ingestors::MastodonClient;
use lib_relay::loggers::setup_logging;
use servers::mastodon_logic::{downstream, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 0: Crypto Initialization ---
    // Rustls 0.23+ needs a process-wide provider before any TLS is used.
    let _ = rustls::crypto::ring::default_provider().install_default();

    // --- Phase 1: Configuration ---
    dotenvy::dotenv().ok();
    let (config, file_layer) = load_config();
    let settings = RelaySettings::try_from(config)?;
    let _log_guard = setup_logging(&settings.log_dir, &settings.log_level)?;
    file_layer.log();

    tracing::info!(
        server = %settings.mastodon.server,
        port = settings.port,
        max_retries = settings.reconnect.max_retries,
        poll_interval_secs = settings.poll_interval.as_secs(),
        subscriber_queue = settings.subscriber_queue,
        "Mastodon relay booting"
    );
    if settings.mastodon.access_token.is_none() {
        tracing::warn!("MASTODON_ACCESS_TOKEN is not set; the streaming API will likely refuse the connection");
    }

    // --- Phase 2: Core Infrastructure ---
    let client = Arc::new(MastodonClient::new(settings.mastodon.clone())?);
    let dispatcher = Arc::new(Dispatcher::with_capacity(settings.subscriber_queue));
    let shutdown = CancellationToken::new();

    // --- Phase 3: Upstream ---
    let manager = UpstreamManager::new(
        Arc::clone(&client),
        Arc::clone(&dispatcher),
        settings.reconnect,
        settings.poll_interval,
    );
    let upstream_state = manager.subscribe_state();
    let upstream_handle = tokio::spawn(manager.run(shutdown.clone()));

    // --- Phase 4: Downstream ---
    let app_state = AppState {
        dispatcher,
        source: client,
        upstream_state,
        shutdown: shutdown.clone(),
    };
    let mut downstream_handle = tokio::spawn(downstream::run(
        settings.port,
        settings.tls.clone(),
        app_state,
        shutdown.clone(),
    ));

    // --- Phase 5: Run until a signal arrives or the listener dies ---
    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        joined = &mut downstream_handle => joined?,
    };

    shutdown.cancel();
    if let Err(e) = upstream_handle.await {
        tracing::error!(error = %e, "Upstream task ended abnormally");
    }
    if !downstream_handle.is_finished() {
        if let Err(e) = downstream_handle.await? {
            tracing::error!(error = %e, "Downstream server ended with an error");
        }
    }

    tracing::info!("Shutdown complete.");
    outcome
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => tracing::info!("SIGTERM received, initiating shutdown."),
    }
}
