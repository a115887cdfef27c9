//! # Fanout Hub
//!
//! The `Dispatcher` holds every connected subscriber and distributes live
//! posts to all of them.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: a published post is wrapped in an `Arc` once and
//!     every subscriber receives a pointer to the same allocation.
//!
//! 2.  **Personalised Snapshot on Join**: joining spawns a snapshot fetch whose
//!     result goes to the joining subscriber only. The subscriber is in the
//!     broadcast set from the moment `join` returns; live posts that arrive
//!     while its snapshot is in flight wait in its queue and are handed out
//!     after the snapshot.
//!
//! 3.  **Isolated Delivery**: every subscriber owns a bounded queue. A
//!     subscriber that is gone, or whose queue is full because it stopped
//!     reading, is pruned and the remaining subscribers are unaffected. A
//!     pruned subscriber still drains what was already queued and then sees
//!     the end of its subscription.
//!
//! 4.  **Publish-Time Membership**: the client list is locked for the duration
//!     of a publish and never across an await, so the set of recipients is
//!     exactly the set registered when `publish` starts.
//!
//! Posts are not deduplicated: a subscriber may see the same post in its
//! snapshot and again as a live post.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::DeliveryError;
use crate::ingestors::mastodon_wss::{snapshot_or_empty, FeedSource};
use crate::model::{Post, RelayEvent};

/// Identity of a subscriber connection.
pub type SubscriberId = u64;

/// Posts a subscriber may fall behind by before it is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// # Client Handle
///
/// The dispatcher's side of a connected subscriber.
struct ClientHandle {
    /// Free-form label for logs (usually the peer address).
    label: String,
    sender: mpsc::Sender<Arc<Post>>,
}

/// # Subscription
///
/// The subscriber's side: yields the personalised snapshot first, then every
/// live post published after the join.
pub struct Subscription {
    id: SubscriberId,
    initial: Option<oneshot::Receiver<Vec<Post>>>,
    live: mpsc::Receiver<Arc<Post>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event for this subscriber. `None` once the dispatcher dropped it.
    ///
    /// Cancel safe: a dropped call never loses the snapshot or a live post.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        if let Some(initial) = self.initial.as_mut() {
            // A snapshot task that died reads as an empty snapshot.
            let posts = initial.await.unwrap_or_default();
            self.initial = None;
            return Some(RelayEvent::InitialPosts(Arc::new(posts)));
        }
        self.live.recv().await.map(RelayEvent::MastodonPost)
    }
}

/// # Core Dispatcher
///
/// Manages registration, deregistration and broadcasting.
pub struct Dispatcher {
    clients: Mutex<HashMap<SubscriberId, ClientHandle>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher whose subscribers may each fall `queue_capacity` posts
    /// behind before they are dropped. A capacity of zero is raised to one.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// # Join
    ///
    /// Registers a subscriber and fetches a snapshot for it alone.
    ///
    /// Must be called from inside a tokio runtime; the snapshot fetch runs on
    /// its own task so joining never waits on upstream.
    pub fn join<S: FeedSource>(&self, label: &str, source: Arc<S>) -> Subscription {
        let (initial_tx, initial_rx) = oneshot::channel();
        let mut subscription = self.add_client(label);
        subscription.initial = Some(initial_rx);

        let id = subscription.id;
        tokio::spawn(async move {
            let posts = snapshot_or_empty(source.as_ref()).await;
            tracing::debug!(subscriber = id, count = posts.len(), "Initial snapshot ready");
            // The subscriber may already be gone.
            let _ = initial_tx.send(posts);
        });

        subscription
    }

    /// Registers a subscriber that only receives live posts.
    pub fn add_client(&self, label: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut clients = self.lock_clients();
        clients.insert(
            id,
            ClientHandle {
                label: label.to_string(),
                sender: tx,
            },
        );
        tracing::info!(subscriber = id, label, total = clients.len(), "Subscriber joined");

        Subscription {
            id,
            initial: None,
            live: rx,
        }
    }

    /// Removes a subscriber; nothing more is delivered to it.
    pub fn remove_client(&self, id: SubscriberId) {
        let mut clients = self.lock_clients();
        if let Some(handle) = clients.remove(&id) {
            tracing::info!(subscriber = id, label = %handle.label, total = clients.len(), "Subscriber left");
        }
    }

    /// # Publish
    ///
    /// Delivers `post` to every subscriber registered when the call starts.
    /// Never waits: subscribers whose queue is closed or full are pruned.
    ///
    /// # Returns
    /// The number of subscribers the post was delivered to.
    pub fn publish(&self, post: Post) -> usize {
        let post = Arc::new(post);
        let mut clients = self.lock_clients();
        let mut delivered = 0;

        clients.retain(|id, client| match deliver(*id, client, &post) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, label = %client.label, "Dropping subscriber");
                false
            }
        });

        tracing::trace!(post = %post.id, delivered, "Published post");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_clients().len()
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, ClientHandle>> {
        // Nothing panics while holding the lock, so a poisoned map is still consistent.
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn deliver(id: SubscriberId, client: &ClientHandle, post: &Arc<Post>) -> Result<(), DeliveryError> {
    client.sender.try_send(Arc::clone(post)).map_err(|e| match e {
        TrySendError::Full(_) => DeliveryError::Lagging(id),
        TrySendError::Closed(_) => DeliveryError::Closed(id),
    })
}
