//! The cache store: canonical key to entry, plus entry lifecycle.
//!
//! All operations are synchronous and never wait on the network. Every
//! mutation runs under a single write lock; notifications and events are
//! collected while the lock is held and delivered after it is released, so
//! sinks are free to read the store again.
//!
//! Inactive entries are evicted by a per-entry retention timer (spawned on
//! the ambient tokio runtime when one exists) and by [`CacheStore::sweep`].
//! Neither evicts an entry with a fetch in flight or a mutation holding a
//! snapshot of it.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use cachet_core::{FetchError, FetchStatus, KeyFilter, QueryKey, QueryOptions, QueryStatus};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::entry::{CacheEntry, EntryBackup, FetchTicket, ObserverId, ObserverSlot, QuerySnapshot};
use crate::fetch::{Commit, Fetcher};
use crate::lock::{read_guard, write_guard};
use crate::notify::{CacheEvent, EventBus, NotificationSink};
use crate::pagination::PageSet;

/// Why an observed entry is being refetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchTrigger {
    /// Marked stale explicitly.
    Invalidated,
    /// The host regained focus.
    Focus,
    /// Connectivity came back.
    Reconnect,
    /// Refetch regardless of freshness.
    Forced,
}

impl RefetchTrigger {
    fn wanted_by(self, options: &QueryOptions) -> bool {
        options.enabled
            && match self {
                Self::Focus => options.refetch_on_focus,
                Self::Reconnect => options.refetch_on_reconnect,
                Self::Invalidated | Self::Forced => true,
            }
    }

    fn requires_stale(self) -> bool {
        !matches!(self, Self::Forced)
    }
}

/// What the coordinator needs to refetch one entry.
pub(crate) struct RefetchPlan {
    pub(crate) key: QueryKey,
    pub(crate) fetcher: Fetcher,
    pub(crate) options: QueryOptions,
}

#[derive(Default)]
struct Outbox {
    notifications: Vec<(Vec<Arc<dyn NotificationSink>>, QuerySnapshot)>,
    events: Vec<CacheEvent>,
}

impl Outbox {
    fn changed(&mut self, entry: &CacheEntry, now: Instant) {
        let snapshot = entry.snapshot(now);
        self.events.push(CacheEvent::Updated {
            key: snapshot.key.clone(),
            status: snapshot.status,
            fetch_status: snapshot.fetch_status,
        });
        let sinks = entry.sinks();
        if !sinks.is_empty() {
            self.notifications.push((sinks, snapshot));
        }
    }
}

/// Notifications collected by a store operation and not yet delivered.
#[must_use = "observers are only notified once the notifications are delivered"]
pub(crate) struct Deferred {
    store: CacheStore,
    outbox: Outbox,
}

impl Deferred {
    pub(crate) fn deliver(self) {
        self.store.flush(self.outbox);
    }
}

struct StoreInner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    events: EventBus,
    defaults: QueryOptions,
    ids: AtomicU64,
}

/// Shared handle to one in-memory cache.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    pub fn new(defaults: QueryOptions, events: EventBus) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: RwLock::new(HashMap::new()),
                events,
                defaults,
                ids: AtomicU64::new(1),
            }),
        }
    }

    /// Options used for entries created outside a query call site.
    pub fn defaults(&self) -> &QueryOptions {
        &self.inner.defaults
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Pure lookup. Never fetches.
    pub fn read(&self, key: &QueryKey) -> Option<QuerySnapshot> {
        let now = Instant::now();
        let entries = read_guard(&self.inner.entries, "store.read");
        entries.get(key.canonical()).map(|entry| entry.snapshot(now))
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        read_guard(&self.inner.entries, "store.contains").contains_key(key.canonical())
    }

    pub fn entry_count(&self) -> usize {
        read_guard(&self.inner.entries, "store.entry_count").len()
    }

    /// All keys, in canonical order.
    pub fn keys(&self) -> Vec<QueryKey> {
        let entries = read_guard(&self.inner.entries, "store.keys");
        let mut keys: Vec<QueryKey> = entries.values().map(|e| e.key.clone()).collect();
        keys.sort_by(|a, b| a.canonical().cmp(b.canonical()));
        keys
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Replace value and status, stamp `updated_at`, reset the fetch status.
    pub fn write(&self, key: &QueryKey, value: Value, status: QueryStatus) -> QuerySnapshot {
        self.upsert(key, &self.inner.defaults, "store.write", |entry, now| {
            entry.set_value(value, now);
            entry.status = status;
            entry.fetch_status = FetchStatus::Idle;
            entry.snapshot(now)
        })
    }

    /// Record a failed fetch. The previous value is kept.
    pub fn write_error(&self, key: &QueryKey, error: FetchError) -> bool {
        self.modify(key, "store.write_error", |entry, _| {
            entry.set_error(error);
            entry.fetch_status = FetchStatus::Idle;
            true
        })
    }

    /// Read-modify-write on the latest value. Creates the entry if absent.
    pub fn patch(&self, key: &QueryKey, update: impl FnOnce(Option<&Value>) -> Value) -> Value {
        match self.try_patch::<Infallible>(key, |current| Ok(update(current))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`patch`](Self::patch) with a fallible updater; on error nothing is written.
    pub fn try_patch<E>(
        &self,
        key: &QueryKey,
        update: impl FnOnce(Option<&Value>) -> Result<Value, E>,
    ) -> Result<Value, E> {
        self.upsert(key, &self.inner.defaults, "store.patch", |entry, now| {
            let next = update(entry.value.as_ref())?;
            entry.set_value(next.clone(), now);
            Ok(next)
        })
    }

    /// Force every match past its freshness window. Data is kept.
    ///
    /// Returns the matched keys. Calling it twice is the same as once.
    pub fn mark_stale(&self, filter: &KeyFilter) -> Vec<QueryKey> {
        let now = Instant::now();
        let mut outbox = Outbox::default();
        let mut matched = Vec::new();
        {
            let mut entries = write_guard(&self.inner.entries, "store.mark_stale");
            for entry in entries.values_mut().filter(|e| filter.matches(&e.key)) {
                entry.invalidated = true;
                outbox.changed(entry, now);
                matched.push(entry.key.clone());
            }
        }
        self.flush(outbox);
        debug!(matched = matched.len(), "Marked entries stale");
        matched
    }

    /// Evict every match unconditionally.
    pub fn remove(&self, filter: &KeyFilter) -> usize {
        let removed: Vec<CacheEntry> = {
            let mut entries = write_guard(&self.inner.entries, "store.remove");
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| filter.matches(&e.key))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = removed.len();
        for mut entry in removed {
            if let Some(timer) = entry.gc_timer.take() {
                timer.abort();
            }
            debug!(key = %entry.key, "Removed cache entry");
            self.inner.events.publish(CacheEvent::Removed { key: entry.key });
        }
        count
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    /// Register an observer, creating the entry if needed.
    pub fn subscribe(
        &self,
        key: &QueryKey,
        options: &QueryOptions,
        sinks: Vec<Arc<dyn NotificationSink>>,
        fetcher: Option<Fetcher>,
    ) -> (ObserverId, QuerySnapshot) {
        let id = Uuid::now_v7();
        let snapshot = self.upsert(key, options, "store.subscribe", |entry, now| {
            entry.apply_options(options);
            if fetcher.is_some() {
                entry.fetcher = fetcher;
            }
            entry.observers.insert(
                id,
                ObserverSlot {
                    options: options.clone(),
                    sinks,
                },
            );
            entry.inactive_since = None;
            if let Some(timer) = entry.gc_timer.take() {
                timer.abort();
            }
            debug!(key = %entry.key, observers = entry.observers.len(), "Observer attached");
            entry.snapshot(now)
        });
        (id, snapshot)
    }

    /// Drop an observer. The last one out starts the retention timer.
    pub fn unsubscribe(&self, key: &QueryKey, id: ObserverId) -> bool {
        self.modify(key, "store.unsubscribe", |entry, now| {
            if entry.observers.remove(&id).is_none() {
                return false;
            }
            if !entry.is_active() {
                entry.inactive_since = Some(now);
                self.schedule_gc(entry, now);
                debug!(
                    key = %entry.key,
                    retention_ms = entry.retention.as_millis() as u64,
                    "Entry became inactive"
                );
            }
            true
        })
    }

    // ========================================================================
    // GARBAGE COLLECTION
    // ========================================================================

    /// Evict every inactive entry past its retention. Returns the count.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<CacheEntry> = {
            let mut entries = write_guard(&self.inner.entries, "store.sweep");
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.is_collectable(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = evicted.len();
        for mut entry in evicted {
            if let Some(timer) = entry.gc_timer.take() {
                timer.abort();
            }
            debug!(key = %entry.key, "Evicted inactive entry");
            self.inner.events.publish(CacheEvent::Removed { key: entry.key });
        }
        count
    }

    fn schedule_gc(&self, entry: &mut CacheEntry, now: Instant) {
        if let Some(timer) = entry.gc_timer.take() {
            timer.abort();
        }
        if entry.is_active() {
            return;
        }
        let since = entry.inactive_since.unwrap_or(now);
        let Some(deadline) = since.checked_add(entry.retention) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            trace!(key = %entry.key, "No runtime for retention timer; relying on sweep");
            return;
        };
        let store = Arc::downgrade(&self.inner);
        let canonical = entry.key.canonical().to_string();
        let incarnation = entry.incarnation;
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = store.upgrade() {
                CacheStore { inner }.collect(&canonical, incarnation);
            }
        });
        entry.gc_timer = Some(task.abort_handle());
    }

    fn collect(&self, canonical: &str, incarnation: u64) -> bool {
        let now = Instant::now();
        let removed = {
            let mut entries = write_guard(&self.inner.entries, "store.collect");
            let collectable = match entries.get_mut(canonical) {
                Some(entry) if entry.incarnation == incarnation => {
                    entry.gc_timer = None;
                    entry.is_collectable(now)
                }
                _ => false,
            };
            if collectable {
                entries.remove(canonical)
            } else {
                None
            }
        };
        match removed {
            Some(entry) => {
                debug!(key = %entry.key, "Evicted inactive entry");
                self.inner.events.publish(CacheEvent::Removed { key: entry.key });
                true
            }
            None => {
                trace!(key = canonical, "Retention timer fired; entry kept");
                false
            }
        }
    }

    // ========================================================================
    // FETCH BOOKKEEPING
    // ========================================================================

    /// Create the entry if needed and adopt the caller's options and fetcher.
    pub(crate) fn prepare(
        &self,
        key: &QueryKey,
        options: &QueryOptions,
        fetcher: Option<Fetcher>,
    ) -> QuerySnapshot {
        self.upsert(key, options, "store.prepare", |entry, now| {
            entry.apply_options(options);
            if fetcher.is_some() {
                entry.fetcher = fetcher;
            }
            entry.snapshot(now)
        })
    }

    /// Count a new fetch against the entry. Observers are not told until the
    /// returned [`Deferred`] is delivered, so the caller may hold its own locks.
    pub(crate) fn begin_fetch(
        &self,
        key: &QueryKey,
        options: &QueryOptions,
    ) -> (FetchTicket, Option<Value>, Deferred) {
        let ((ticket, previous), outbox) =
            self.upsert_deferred(key, options, "store.begin_fetch", |entry, _| {
                entry.fetches_in_flight += 1;
                entry.fetch_status = FetchStatus::Fetching;
                (entry.ticket(), entry.value.clone())
            });
        let deferred = Deferred {
            store: self.clone(),
            outbox,
        };
        (ticket, previous, deferred)
    }

    pub(crate) fn set_fetch_status(&self, key: &QueryKey, ticket: FetchTicket, status: FetchStatus) {
        self.modify(key, "store.set_fetch_status", |entry, _| {
            if entry.ticket() != ticket || entry.fetch_status == status {
                return false;
            }
            entry.fetch_status = status;
            true
        });
    }

    pub(crate) fn commit_fetch(
        &self,
        key: &QueryKey,
        ticket: FetchTicket,
        commit: &Commit,
        value: Value,
    ) -> bool {
        self.modify(key, "store.commit_fetch", |entry, now| {
            if entry.ticket() != ticket {
                debug!(key = %entry.key, "Discarding result of cancelled fetch");
                return false;
            }
            let next = match commit {
                Commit::Replace => value,
                Commit::Page { param } => {
                    let mut pages = PageSet::from_value(entry.value.as_ref());
                    pages.merge(param.clone(), value);
                    pages.into_value()
                }
            };
            entry.set_value(next, now);
            if entry.fetches_in_flight <= 1 {
                entry.fetch_status = FetchStatus::Idle;
            }
            true
        })
    }

    pub(crate) fn record_failed_attempt(&self, key: &QueryKey, ticket: FetchTicket) {
        self.modify(key, "store.record_failed_attempt", |entry, _| {
            if entry.ticket() != ticket {
                return false;
            }
            entry.fetch_failure_count = entry.fetch_failure_count.saturating_add(1);
            true
        });
    }

    pub(crate) fn fail_fetch(&self, key: &QueryKey, ticket: FetchTicket, error: FetchError) {
        self.modify(key, "store.fail_fetch", |entry, _| {
            if entry.ticket() != ticket {
                return false;
            }
            entry.set_error(error);
            if entry.fetches_in_flight <= 1 {
                entry.fetch_status = FetchStatus::Idle;
            }
            true
        });
    }

    pub(crate) fn finish_fetch(&self, key: &QueryKey, ticket: FetchTicket) {
        self.modify(key, "store.finish_fetch", |entry, now| {
            if entry.ticket() != ticket {
                return false;
            }
            entry.fetches_in_flight = entry.fetches_in_flight.saturating_sub(1);
            if entry.fetches_in_flight > 0 {
                return false;
            }
            let changed = entry.fetch_status != FetchStatus::Idle;
            entry.fetch_status = FetchStatus::Idle;
            if !entry.is_active() {
                self.schedule_gc(entry, now);
            }
            changed
        });
    }

    /// Invalidate all outstanding fetch tickets. Status and value are untouched.
    pub(crate) fn cancel_fetches(&self, key: &QueryKey) -> bool {
        let epoch = self.next_id();
        self.modify(key, "store.cancel_fetches", |entry, now| {
            if entry.fetches_in_flight == 0 && entry.fetch_status == FetchStatus::Idle {
                return false;
            }
            entry.epoch = epoch;
            entry.fetches_in_flight = 0;
            entry.fetch_status = FetchStatus::Idle;
            if !entry.is_active() {
                self.schedule_gc(entry, now);
            }
            true
        })
    }

    pub(crate) fn refetch_plans(&self, filter: &KeyFilter, trigger: RefetchTrigger) -> Vec<RefetchPlan> {
        let now = Instant::now();
        let entries = read_guard(&self.inner.entries, "store.refetch_plans");
        entries
            .values()
            .filter(|entry| filter.matches(&entry.key))
            .filter(|entry| !trigger.requires_stale() || entry.is_stale(now))
            .filter_map(|entry| {
                let slot = entry
                    .observers
                    .values()
                    .find(|slot| trigger.wanted_by(&slot.options))?;
                let fetcher = entry.fetcher.clone()?;
                Some(RefetchPlan {
                    key: entry.key.clone(),
                    fetcher,
                    options: slot.options.clone(),
                })
            })
            .collect()
    }

    // ========================================================================
    // MUTATION HOLDS
    // ========================================================================

    /// Pin an entry against eviction and capture its current state.
    pub(crate) fn hold(&self, key: &QueryKey) -> EntryBackup {
        self.upsert(key, &self.inner.defaults, "store.hold", |entry, _| {
            entry.mutation_holds += 1;
            entry.backup()
        })
    }

    pub(crate) fn release(&self, backup: &EntryBackup) {
        self.modify(&backup.key, "store.release", |entry, now| {
            if entry.incarnation != backup.incarnation {
                return false;
            }
            entry.mutation_holds = entry.mutation_holds.saturating_sub(1);
            if entry.mutation_holds == 0 && !entry.is_active() {
                self.schedule_gc(entry, now);
            }
            false
        });
    }

    /// Put back a captured state. False when the entry is gone or was recreated.
    pub(crate) fn restore(&self, backup: &EntryBackup) -> bool {
        self.modify(&backup.key, "store.restore", |entry, _| {
            if entry.incarnation != backup.incarnation {
                return false;
            }
            entry.restore(backup);
            true
        })
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn next_id(&self) -> u64 {
        self.inner.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn upsert<R>(
        &self,
        key: &QueryKey,
        options: &QueryOptions,
        op: &'static str,
        apply: impl FnOnce(&mut CacheEntry, Instant) -> R,
    ) -> R {
        let (result, outbox) = self.upsert_deferred(key, options, op, apply);
        self.flush(outbox);
        result
    }

    fn upsert_deferred<R>(
        &self,
        key: &QueryKey,
        options: &QueryOptions,
        op: &'static str,
        apply: impl FnOnce(&mut CacheEntry, Instant) -> R,
    ) -> (R, Outbox) {
        let now = Instant::now();
        let mut outbox = Outbox::default();
        let result = {
            let mut entries = write_guard(&self.inner.entries, op);
            let entry = match entries.entry(key.canonical().to_string()) {
                MapEntry::Occupied(slot) => slot.into_mut(),
                MapEntry::Vacant(slot) => {
                    debug!(key = %key, "Created cache entry");
                    outbox.events.push(CacheEvent::Added { key: key.clone() });
                    slot.insert(CacheEntry::new(key.clone(), options, self.next_id(), now))
                }
            };
            let result = apply(entry, now);
            if !entry.is_active() && entry.gc_timer.is_none() {
                self.schedule_gc(entry, now);
            }
            outbox.changed(entry, now);
            result
        };
        (result, outbox)
    }

    /// Apply `change` to an existing entry; notify only when it returns true.
    fn modify(
        &self,
        key: &QueryKey,
        op: &'static str,
        change: impl FnOnce(&mut CacheEntry, Instant) -> bool,
    ) -> bool {
        let now = Instant::now();
        let mut outbox = Outbox::default();
        let changed = {
            let mut entries = write_guard(&self.inner.entries, op);
            match entries.get_mut(key.canonical()) {
                Some(entry) => {
                    let changed = change(entry, now);
                    if changed {
                        outbox.changed(entry, now);
                    }
                    changed
                }
                None => false,
            }
        };
        self.flush(outbox);
        changed
    }

    fn flush(&self, outbox: Outbox) {
        for event in outbox.events {
            self.inner.events.publish(event);
        }
        for (sinks, snapshot) in outbox.notifications {
            for sink in sinks {
                sink.notify(&snapshot.key, &snapshot);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::query_key;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn store() -> CacheStore {
        CacheStore::new(QueryOptions::default(), EventBus::new(64))
    }

    fn recording_sink() -> (Arc<dyn NotificationSink>, Arc<Mutex<Vec<QuerySnapshot>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: Arc<dyn NotificationSink> =
            Arc::new(move |_: &QueryKey, snapshot: &QuerySnapshot| {
                sink_seen.lock().unwrap().push(snapshot.clone());
            });
        (sink, seen)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_read_never_creates() {
        let store = store();
        assert!(store.read(&query_key!["posts"]).is_none());
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let store = store();
        let key = query_key!["posts"];
        store.write(&key, json!(["a"]), QueryStatus::Success);

        let snapshot = store.read(&key).unwrap();
        assert_eq!(snapshot.data, Some(json!(["a"])));
        assert!(snapshot.is_success());
        assert_eq!(snapshot.fetch_status, FetchStatus::Idle);
        assert!(snapshot.data_updated_at.is_some());
    }

    #[test]
    fn test_patch_creates_and_updates() {
        let store = store();
        let key = query_key!["likeCount", 1];

        let first = store.patch(&key, |current| {
            assert!(current.is_none());
            json!(5)
        });
        assert_eq!(first, json!(5));

        let second = store.patch(&key, |current| {
            json!(current.and_then(Value::as_u64).unwrap_or(0) + 1)
        });
        assert_eq!(second, json!(6));
        assert!(store.read(&key).unwrap().is_success());
    }

    #[test]
    fn test_try_patch_error_writes_nothing() {
        let store = store();
        let key = query_key!["likeCount", 1];
        store.patch(&key, |_| json!(5));

        let result: Result<Value, &str> = store.try_patch(&key, |_| Err("nope"));
        assert_eq!(result, Err("nope"));
        assert_eq!(store.read(&key).unwrap().data, Some(json!(5)));
    }

    #[test]
    fn test_write_error_keeps_value() {
        let store = store();
        let key = query_key!["posts"];
        store.write(&key, json!([1]), QueryStatus::Success);
        store.write_error(
            &key,
            FetchError::Failed {
                key: key.canonical().to_string(),
                reason: "503".to_string(),
                attempts: 1,
            },
        );

        let snapshot = store.read(&key).unwrap();
        assert!(snapshot.is_error());
        assert_eq!(snapshot.data, Some(json!([1])));
    }

    #[test]
    fn test_mark_stale_by_prefix_keeps_data() {
        let store = store();
        let opts = QueryOptions::default().with_freshness_window(Duration::from_secs(60));
        for key in [query_key!["posts", 1], query_key!["posts", 2], query_key!["users"]] {
            store.prepare(&key, &opts, None);
            store.write(&key, json!(true), QueryStatus::Success);
        }

        let matched = store.mark_stale(&KeyFilter::from(query_key!["posts"]));
        assert_eq!(matched.len(), 2);

        let post = store.read(&query_key!["posts", 1]).unwrap();
        assert!(post.is_stale);
        assert_eq!(post.data, Some(json!(true)));
        assert!(!store.read(&query_key!["users"]).unwrap().is_stale);

        // Idempotent.
        assert_eq!(store.mark_stale(&KeyFilter::from(query_key!["posts"])).len(), 2);
        assert!(store.read(&query_key!["posts", 2]).unwrap().is_invalidated);
    }

    #[test]
    fn test_remove_by_filter() {
        let store = store();
        store.write(&query_key!["posts", 1], json!(1), QueryStatus::Success);
        store.write(&query_key!["posts", 2], json!(2), QueryStatus::Success);
        store.write(&query_key!["users"], json!(3), QueryStatus::Success);

        assert_eq!(store.remove(&KeyFilter::from(query_key!["posts"])), 2);
        assert_eq!(store.keys(), vec![query_key!["users"]]);
        assert_eq!(store.remove(&KeyFilter::All), 1);
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_observers_are_notified() {
        let store = store();
        let key = query_key!["likeStatus", 1, "codeit"];
        let (sink, seen) = recording_sink();
        let (id, snapshot) = store.subscribe(&key, &QueryOptions::default(), vec![sink], None);
        assert_eq!(snapshot.observer_count, 1);

        store.patch(&key, |_| json!(true));
        {
            let seen = seen.lock().unwrap();
            let last = seen.last().unwrap();
            assert_eq!(last.data, Some(json!(true)));
        }

        let before = seen.lock().unwrap().len();
        assert!(store.unsubscribe(&key, id));
        store.patch(&key, |_| json!(false));
        assert_eq!(seen.lock().unwrap().len(), before);
        assert!(!store.unsubscribe(&key, id));
    }

    #[test]
    fn test_events_are_published() {
        let store = store();
        let mut rx = store.events().subscribe();
        let key = query_key!["posts"];
        store.patch(&key, |_| json!(1));
        store.remove(&KeyFilter::exact(key.clone()));

        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Added { key: key.clone() });
        assert!(matches!(rx.try_recv().unwrap(), CacheEvent::Updated { .. }));
        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Removed { key });
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_timer_evicts_after_exact_retention() {
        let store = store();
        let key = query_key!["posts"];
        let opts = QueryOptions::default().with_retention(Duration::from_secs(30));
        let (id, _) = store.subscribe(&key, &opts, Vec::new(), None);
        store.write(&key, json!(1), QueryStatus::Success);
        store.unsubscribe(&key, id);

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert!(store.contains(&key));

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(!store.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_cancels_retention() {
        let store = store();
        let key = query_key!["posts"];
        let opts = QueryOptions::default().with_retention(Duration::from_secs(30));
        let (id, _) = store.subscribe(&key, &opts, Vec::new(), None);
        store.write(&key, json!("kept"), QueryStatus::Success);
        store.unsubscribe(&key, id);

        tokio::time::advance(Duration::from_secs(20)).await;
        let (_id, snapshot) = store.subscribe(&key, &opts, Vec::new(), None);
        assert_eq!(snapshot.data, Some(json!("kept")));

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(store.contains(&key));
    }

    #[test]
    fn test_begin_fetch_notifies_on_delivery() {
        let store = store();
        let key = query_key!["posts"];
        let (sink, seen) = recording_sink();
        store.subscribe(&key, &QueryOptions::default(), vec![sink], None);
        let before = seen.lock().unwrap().len();

        let (_, _, deferred) = store.begin_fetch(&key, &QueryOptions::default());
        assert!(store.read(&key).unwrap().is_fetching());
        assert_eq!(seen.lock().unwrap().len(), before);

        deferred.deliver();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), before + 1);
        assert!(seen[before].is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_fetch_blocks_eviction() {
        let store = store();
        let key = query_key!["posts"];
        let opts = QueryOptions::default().with_retention(Duration::from_secs(5));
        let (ticket, _, deferred) = store.begin_fetch(&key, &opts);
        deferred.deliver();

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(store.sweep(), 0);
        assert!(store.contains(&key));

        store.commit_fetch(&key, ticket, &Commit::Replace, json!(1));
        store.finish_fetch(&key, ticket);
        settle().await;
        assert!(!store.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_blocks_eviction_until_release() {
        let store = store();
        let key = query_key!["likeCount", 1];
        store.patch(&key, |_| json!(5));
        let backup = store.hold(&key);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert!(store.contains(&key));

        store.release(&backup);
        settle().await;
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_cancelled_ticket_cannot_commit() {
        let store = store();
        let key = query_key!["posts"];
        store.write(&key, json!("old"), QueryStatus::Success);
        let (ticket, previous, deferred) = store.begin_fetch(&key, &QueryOptions::default());
        deferred.deliver();
        assert_eq!(previous, Some(json!("old")));
        assert!(store.read(&key).unwrap().is_fetching());

        assert!(store.cancel_fetches(&key));
        let snapshot = store.read(&key).unwrap();
        assert_eq!(snapshot.fetch_status, FetchStatus::Idle);
        assert!(snapshot.is_success());

        assert!(!store.commit_fetch(&key, ticket, &Commit::Replace, json!("late")));
        assert_eq!(store.read(&key).unwrap().data, Some(json!("old")));
    }

    #[test]
    fn test_restore_puts_back_prior_value() {
        let store = store();
        let key = query_key!["likeCount", 1];
        store.patch(&key, |_| json!(5));
        let backup = store.hold(&key);
        store.patch(&key, |_| json!(6));

        assert!(store.restore(&backup));
        assert_eq!(store.read(&key).unwrap().data, Some(json!(5)));

        store.remove(&KeyFilter::All);
        assert!(!store.restore(&backup));
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_sweep_without_runtime() {
        let store = store();
        let opts = QueryOptions::default().with_retention(Duration::ZERO);
        store.prepare(&query_key!["posts"], &opts, None);
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.entry_count(), 0);
    }
}
