//! # Mastodon Timeline Poller
//!
//! The degraded substitute for the push connection. Once started it fetches
//! the public timeline snapshot on a fixed interval and publishes every post
//! of the batch, oldest first, to the dispatcher.
//!
//! ## Key Design Principles:
//! - **Owned Task**: the poller runs as a task tied to a `CancellationToken`.
//!   Whoever spawns it holds a [`PollerHandle`] and stops it explicitly.
//! - **Static Interval**: the first poll happens one interval after start and
//!   the interval never adapts.
//! - **Resilience**: a failed fetch is logged and skipped until the next tick;
//!   the poller never stops on its own.
//! - **No Deduplication**: consecutive polls re-publish overlapping posts.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::Dispatcher;
use crate::ingestors::mastodon_wss::FeedSource;
use crate::model::Post;

/// # Poller Handle
///
/// Stops the polling task it was returned for.
pub struct PollerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Cancels the poller and waits for the task to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Poller task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// # Mastodon Polling Plugin
pub struct MastodonPoller<S: FeedSource> {
    source: Arc<S>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl<S: FeedSource> MastodonPoller<S> {
    pub fn new(source: Arc<S>, dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            source,
            dispatcher,
            interval,
        }
    }

    /// Starts polling on a new task. Cancelling `parent` stops it too.
    pub fn spawn(self, parent: &CancellationToken) -> PollerHandle {
        let token = parent.child_token();
        let task = tokio::spawn(self.run(token.clone()));
        PollerHandle { token, task }
    }

    /// # Main Execution Loop
    ///
    /// Ticks every `interval` until `token` is cancelled. A poll in progress is
    /// abandoned on cancellation.
    pub async fn run(self, token: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs_f64(), "Polling fallback started");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.poll_once() => {}
                    }
                }
            }
        }

        tracing::info!("Polling fallback stopped");
    }

    /// Runs a single poll cycle.
    ///
    /// # Returns
    /// The number of posts published; zero when the fetch failed.
    pub async fn poll_once(&self) -> usize {
        match self.source.fetch_snapshot().await {
            Ok(mut posts) => {
                order_oldest_first(&mut posts);
                let count = posts.len();
                for post in posts {
                    self.dispatcher.publish(post);
                }
                tracing::debug!(count, "Poll published batch");
                count
            }
            Err(e) => {
                tracing::warn!(error = %e, "Poll failed, skipping until next interval");
                0
            }
        }
    }
}

/// Stable sort by creation time, oldest first. Posts whose timestamp does not
/// parse keep their relative order ahead of the rest.
pub fn order_oldest_first(posts: &mut [Post]) {
    posts.sort_by_key(|p| p.created_at_utc());
}
