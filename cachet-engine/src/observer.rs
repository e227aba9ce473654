//! Subscriptions and key-switching observers.

use std::fmt;

use cachet_core::{QueryKey, QueryOptions, QueryStatus};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::client::QueryClient;
use crate::entry::{ObserverId, QuerySnapshot};
use crate::fetch::Fetcher;
use crate::store::CacheStore;

/// Substitute placeholder data into a snapshot that has none of its own.
pub(crate) fn with_placeholder(mut snapshot: QuerySnapshot, placeholder: Option<&Value>) -> QuerySnapshot {
    if snapshot.data.is_some() || snapshot.status != QueryStatus::Pending {
        return snapshot;
    }
    if let Some(data) = placeholder {
        snapshot.data = Some(data.clone());
        snapshot.status = QueryStatus::Success;
        snapshot.is_placeholder_data = true;
    }
    snapshot
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// An active observation of one entry.
///
/// Dropping the handle unsubscribes: the observer count falls, the
/// poller stops, and the last observer out starts the retention timer.
/// Fetches already dispatched keep running.
pub struct Subscription {
    store: CacheStore,
    key: QueryKey,
    id: ObserverId,
    rx: watch::Receiver<QuerySnapshot>,
    placeholder: Option<Value>,
    poller: Option<AbortHandle>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(
        store: CacheStore,
        key: QueryKey,
        id: ObserverId,
        rx: watch::Receiver<QuerySnapshot>,
        placeholder: Option<Value>,
        poller: Option<AbortHandle>,
    ) -> Self {
        Self {
            store,
            key,
            id,
            rx,
            placeholder,
            poller,
            active: true,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Current state of the entry, with placeholder data applied.
    ///
    /// Reads the store so that staleness is evaluated now; falls back to the
    /// last notification when the entry has been removed.
    pub fn snapshot(&self) -> QuerySnapshot {
        with_placeholder(self.raw_snapshot(), self.placeholder.as_ref())
    }

    pub(crate) fn raw_snapshot(&self) -> QuerySnapshot {
        self.store
            .read(&self.key)
            .unwrap_or_else(|| self.rx.borrow().clone())
    }

    /// Wait for the next committed change.
    pub async fn changed(&mut self) -> Option<QuerySnapshot> {
        self.rx.changed().await.ok()?;
        let snapshot = self.rx.borrow_and_update().clone();
        Some(with_placeholder(snapshot, self.placeholder.as_ref()))
    }

    /// Wait until a notified snapshot satisfies `condition`.
    pub async fn wait_for(
        &mut self,
        mut condition: impl FnMut(&QuerySnapshot) -> bool,
    ) -> Option<QuerySnapshot> {
        let snapshot = self.rx.wait_for(|s| condition(s)).await.ok()?.clone();
        Some(with_placeholder(snapshot, self.placeholder.as_ref()))
    }

    /// Raw notification channel.
    pub fn receiver(&self) -> watch::Receiver<QuerySnapshot> {
        self.rx.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.store.unsubscribe(&self.key, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

// ============================================================================
// QUERY OBSERVER
// ============================================================================

/// Observer that can move between keys, e.g. paginated `["posts", page]`.
///
/// With `keep_previous_data`, the data of the previous key is shown (and
/// flagged as placeholder) until the new key has data of its own.
pub struct QueryObserver {
    client: QueryClient,
    options: QueryOptions,
    current: Option<(Subscription, Fetcher)>,
    previous_data: Option<Value>,
}

impl QueryObserver {
    pub(crate) fn new(client: QueryClient, options: QueryOptions) -> Self {
        Self {
            client,
            options,
            current: None,
            previous_data: None,
        }
    }

    pub fn key(&self) -> Option<&QueryKey> {
        self.current.as_ref().map(|(sub, _)| sub.key())
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Point the observer at `key`. A no-op when it already is.
    pub fn set_query(&mut self, key: QueryKey, fetcher: Fetcher) {
        if self.key() == Some(&key) {
            return;
        }
        let next = self.client.observe(key, fetcher.clone(), self.options.clone());
        if let Some((previous, _)) = self.current.replace((next, fetcher)) {
            let snapshot = previous.snapshot();
            if let (Some(data), false) = (snapshot.data, snapshot.is_placeholder_data) {
                self.previous_data = Some(data);
            }
        }
    }

    /// Toggle `enabled`. Enabling re-attaches so the mount policy runs.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.options.enabled == enabled {
            return;
        }
        self.options.enabled = enabled;
        if let Some((current, fetcher)) = self.current.take() {
            let key = current.key().clone();
            let next = self.client.observe(key, fetcher.clone(), self.options.clone());
            self.current = Some((next, fetcher));
            drop(current);
        }
    }

    /// Current result, with previous or placeholder data filled in.
    pub fn result(&self) -> Option<QuerySnapshot> {
        let (sub, _) = self.current.as_ref()?;
        let previous = self
            .previous_data
            .as_ref()
            .filter(|_| self.options.keep_previous_data);
        let fallback = previous.or(self.options.placeholder_data.as_ref());
        Some(with_placeholder(sub.raw_snapshot(), fallback))
    }

    /// Wait for the next change of the current key.
    pub async fn changed(&mut self) -> Option<QuerySnapshot> {
        let (sub, _) = self.current.as_mut()?;
        sub.changed().await?;
        self.result()
    }
}
