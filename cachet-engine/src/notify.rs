//! Observer notification and the cache event stream.

use cachet_core::{FetchStatus, QueryKey, QueryStatus};
use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::entry::QuerySnapshot;

/// Receives every committed change to an observed entry.
///
/// Called outside the store lock, so implementations may read the cache.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, key: &QueryKey, snapshot: &QuerySnapshot);
}

impl<F> NotificationSink for F
where
    F: Fn(&QueryKey, &QuerySnapshot) + Send + Sync,
{
    fn notify(&self, key: &QueryKey, snapshot: &QuerySnapshot) {
        self(key, snapshot)
    }
}

/// Sink that publishes the latest snapshot on a watch channel.
pub(crate) struct WatchSink {
    tx: watch::Sender<QuerySnapshot>,
}

impl WatchSink {
    pub(crate) fn channel(key: &QueryKey) -> (Self, watch::Receiver<QuerySnapshot>) {
        let (tx, rx) = watch::channel(QuerySnapshot::empty(key));
        (Self { tx }, rx)
    }
}

impl NotificationSink for WatchSink {
    fn notify(&self, _key: &QueryKey, snapshot: &QuerySnapshot) {
        self.tx.send_replace(snapshot.clone());
    }
}

// ============================================================================
// CACHE EVENTS
// ============================================================================

/// Entry lifecycle events, for inspection tooling.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Added {
        key: QueryKey,
    },
    Updated {
        key: QueryKey,
        status: QueryStatus,
        fetch_status: FetchStatus,
    },
    Removed {
        key: QueryKey,
    },
}

impl CacheEvent {
    pub fn key(&self) -> &QueryKey {
        match self {
            Self::Added { key } | Self::Updated { key, .. } | Self::Removed { key } => key,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::Removed { .. } => "removed",
        }
    }
}

/// Broadcast channel carrying [`CacheEvent`]s.
///
/// Publishing never blocks; receivers that fall behind see `Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CacheEvent) {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => trace!(event_type, receivers, "Published cache event"),
            Err(_) => trace!(event_type, "No receivers for cache event"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }
}
