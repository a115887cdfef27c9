//! # Upstream Manager
//!
//! Keeps the relay attached to the upstream push connection. Reconnects with
//! exponential backoff and hands over to the poller once retries run out.
//!
//! The transition logic lives in [`ConnectionMachine`], a plain value that maps
//! a [`ControllerEvent`] to the [`Action`] the driver must perform next. The
//! driver ([`UpstreamManager::run`]) is the only owner of the machine, so the
//! state is never shared between flows.
//!
//! ```text
//! Disconnected --Start--> Connecting
//! Connecting   --Connected--> Streaming            (attempt = 0)
//! Connecting | Streaming --ConnectFailed/StreamClosed-->
//!     Backoff(attempt, now + base * 2^attempt)     if attempt < max_retries
//!     Polling                                      otherwise
//! Backoff      --DeadlineElapsed--> Connecting     (attempt + 1)
//! ```
//!
//! `Polling` is terminal: the push connection is never retried from there.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::Dispatcher;
use crate::ingestors::mastodon_polling::MastodonPoller;
use crate::ingestors::mastodon_wss::{FeedSource, PushConnection};

/// Connection state of the relay's upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    /// Waiting to reconnect. `attempt` is the number of reconnects already made
    /// since the last successful connection.
    Backoff { attempt: u32, deadline: Instant },
    Polling,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Backoff { .. } => "backoff",
            ConnectionState::Polling => "polling",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Backoff { attempt, .. } => write!(f, "backoff(attempt={})", attempt),
            other => f.write_str(other.label()),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    Start,
    Connected,
    ConnectFailed,
    StreamClosed,
    DeadlineElapsed,
}

/// What the driver has to do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    OpenStream,
    /// Keep pumping the established connection.
    Stream,
    Wait { delay: Duration, deadline: Instant },
    StartPolling,
    /// The event did not apply to the current state.
    Ignore,
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_retries: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^attempt`. Only the retry count bounds it, never a delay ceiling.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

// Roughly 30 years, for delays that overflow `Instant`.
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(86400 * 365 * 30)
}

/// # Connection Machine
///
/// The single-owner reconnect state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Applies `event` at time `now`.
    ///
    /// Events that do not apply to the current state are ignored, which makes a
    /// duplicate close signal harmless.
    pub fn handle(&mut self, event: ControllerEvent, now: Instant) -> Action {
        use ConnectionState::*;
        use ControllerEvent::*;

        match (self.state, event) {
            (Disconnected, Start) => {
                self.state = Connecting;
                Action::OpenStream
            }
            (Connecting, Connected) => {
                self.attempt = 0;
                self.state = Streaming;
                Action::Stream
            }
            (Connecting, ConnectFailed) | (Connecting, StreamClosed) | (Streaming, StreamClosed) => {
                if self.attempt < self.policy.max_retries {
                    let delay = self.policy.delay_for(self.attempt);
                    let deadline = now.checked_add(delay).unwrap_or_else(|| far_future(now));
                    self.state = Backoff { attempt: self.attempt, deadline };
                    Action::Wait { delay, deadline }
                } else {
                    self.state = Polling;
                    Action::StartPolling
                }
            }
            (Backoff { attempt, .. }, DeadlineElapsed) => {
                self.attempt = attempt + 1;
                self.state = Connecting;
                Action::OpenStream
            }
            _ => Action::Ignore,
        }
    }
}

/// # Upstream Manager
///
/// Drives a [`ConnectionMachine`] against a live [`FeedSource`]: opens push
/// connections, forwards every decoded post to the dispatcher, sleeps through
/// backoff and finally starts the poller.
pub struct UpstreamManager<S: FeedSource> {
    source: Arc<S>,
    dispatcher: Arc<Dispatcher>,
    machine: ConnectionMachine,
    poll_interval: Duration,
    state_tx: watch::Sender<ConnectionState>,
}

impl<S: FeedSource> UpstreamManager<S> {
    pub fn new(
        source: Arc<S>,
        dispatcher: Arc<Dispatcher>,
        policy: ReconnectPolicy,
        poll_interval: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            source,
            dispatcher,
            machine: ConnectionMachine::new(policy),
            poll_interval,
            state_tx,
        }
    }

    /// Observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// # Main Coordination Loop
    ///
    /// Runs until `shutdown` is cancelled. Once polling has started the loop
    /// only waits for shutdown and then stops the poller.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Upstream manager started.");
        let mut action = self.apply(ControllerEvent::Start);

        loop {
            action = match action {
                Action::OpenStream => {
                    let opened = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        opened = self.source.open_stream() => opened,
                    };
                    match opened {
                        Ok(conn) => {
                            match self.apply(ControllerEvent::Connected) {
                                Action::Stream => {
                                    if !self.pump(conn, &shutdown).await {
                                        break;
                                    }
                                    self.apply(ControllerEvent::StreamClosed)
                                }
                                other => other,
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, attempt = self.machine.attempt(), "Push connection failed");
                            self.apply(ControllerEvent::ConnectFailed)
                        }
                    }
                }
                Action::Wait { delay, deadline } => {
                    tracing::info!(delay_ms = delay.as_millis() as u64, "Attempting to reconnect after backoff");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                    self.apply(ControllerEvent::DeadlineElapsed)
                }
                Action::StartPolling => {
                    tracing::warn!(
                        max_retries = self.machine.policy.max_retries,
                        "Max retries reached. Falling back to polling."
                    );
                    let poller = MastodonPoller::new(
                        Arc::clone(&self.source),
                        Arc::clone(&self.dispatcher),
                        self.poll_interval,
                    )
                    .spawn(&shutdown);
                    shutdown.cancelled().await;
                    poller.stop().await;
                    break;
                }
                Action::Stream | Action::Ignore => {
                    tracing::error!(state = %self.machine.state(), ?action, "Upstream manager has nothing to do");
                    break;
                }
            };
        }

        tracing::info!("Upstream manager stopped.");
    }

    /// Forwards posts until the connection closes. Returns `false` when it was
    /// interrupted by shutdown.
    async fn pump(&self, mut conn: PushConnection, shutdown: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                next = conn.next_post() => match next {
                    Some(post) => {
                        self.dispatcher.publish(post);
                    }
                    None => {
                        tracing::info!("Push connection closed");
                        return true;
                    }
                },
            }
        }
    }

    fn apply(&mut self, event: ControllerEvent) -> Action {
        let before = self.machine.state();
        let action = self.machine.handle(event, Instant::now());
        let after = self.machine.state();
        if before != after {
            tracing::info!(from = %before, to = %after, ?event, "Upstream transition");
            self.state_tx.send_replace(after);
        }
        action
    }
}
