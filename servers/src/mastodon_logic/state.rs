use std::sync::Arc;

use lib_relay::core::{ConnectionState, Dispatcher};
use lib_relay::ingestors::FeedSource;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// # Application State
///
/// Shared by every route. Cheap to clone; all members are handles.
pub struct AppState<S: FeedSource> {
    /// Fanout hub every subscriber joins.
    pub dispatcher: Arc<Dispatcher>,
    /// Upstream used for each newcomer's snapshot.
    pub source: Arc<S>,
    /// Latest upstream connection state, for `/health`.
    pub upstream_state: watch::Receiver<ConnectionState>,
    /// Cancelled on process shutdown; open sockets close when it fires.
    pub shutdown: CancellationToken,
}

// Manual impl: a derive would require `S: Clone`.
impl<S: FeedSource> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            source: Arc::clone(&self.source),
            upstream_state: self.upstream_state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}
