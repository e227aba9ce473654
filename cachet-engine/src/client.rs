//! The client handle tying the cache together.
//!
//! A [`QueryClient`] owns one cache: its store, fetch coordinator,
//! pagination, mutations and the focus and connectivity managers. Clones
//! share everything; separately constructed clients share nothing.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use cachet_core::{ClientConfig, ConfigError, FetchError, KeyFilter, QueryKey, QueryOptions};
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::entry::QuerySnapshot;
use crate::fetch::{FetchContext, FetchCoordinator, Fetcher};
use crate::gc::{gc_sweep_task, GcMetrics};
use crate::managers::{FocusManager, OnlineManager};
use crate::mutation::{MutationBuilder, MutationEngine};
use crate::notify::{CacheEvent, NotificationSink, WatchSink};
use crate::observer::{QueryObserver, Subscription};
use crate::pagination::{InfiniteQuery, PageDefinition, PaginationController};
use crate::store::{CacheStore, RefetchTrigger};

struct ClientInner {
    config: ClientConfig,
    store: CacheStore,
    coordinator: FetchCoordinator,
    pagination: PaginationController,
    mutations: MutationEngine,
    focus: FocusManager,
    online: OnlineManager,
}

/// Handle to one in-memory query cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &self.inner.store.entry_count())
            .field("in_flight", &self.inner.coordinator.in_flight_count())
            .field("focused", &self.inner.focus.is_focused())
            .field("online", &self.inner.online.is_online())
            .finish()
    }
}

impl QueryClient {
    /// Build a client, rejecting a config that fails validation.
    pub fn try_new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Build a client. Invalid values are logged and clamped rather than rejected.
    pub fn new(config: ClientConfig) -> Self {
        if let Err(error) = config.validate() {
            warn!(error = %error, "Client config failed validation");
        }
        let events = crate::notify::EventBus::new(config.event_channel_capacity);
        let store = CacheStore::new(config.query_options(), events);
        let online = OnlineManager::new();
        let coordinator = FetchCoordinator::new(store.clone(), online.clone());
        Self {
            inner: Arc::new(ClientInner {
                pagination: PaginationController::new(coordinator.clone()),
                mutations: MutationEngine::new(coordinator.clone()),
                config,
                store,
                coordinator,
                focus: FocusManager::new(),
                online,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Options every call site starts from.
    pub fn default_options(&self) -> QueryOptions {
        self.inner.store.defaults().clone()
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.inner.coordinator
    }

    pub fn pagination(&self) -> &PaginationController {
        &self.inner.pagination
    }

    // ========================================================================
    // DIRECT CACHE ACCESS
    // ========================================================================

    pub fn read(&self, key: &QueryKey) -> Option<QuerySnapshot> {
        self.inner.store.read(key)
    }

    /// Cached data decoded as `T`. Never fetches.
    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>, FetchError> {
        match self.inner.store.read(key) {
            Some(snapshot) => snapshot.data_as(),
            None => Ok(None),
        }
    }

    /// Write `value` as the entry's data, creating the entry if needed.
    pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, value: T) -> Result<(), FetchError> {
        let value = serde_json::to_value(value).map_err(|e| decode_error(key, e))?;
        self.inner.store.patch(key, |_| value);
        Ok(())
    }

    /// Read-modify-write the entry's data as `T`.
    pub fn update_query_data<T, F>(&self, key: &QueryKey, update: F) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let updated = self.inner.store.try_patch(key, |current| {
            let current = current
                .map(|v| serde_json::from_value::<T>(v.clone()))
                .transpose()
                .map_err(|e| decode_error(key, e))?;
            serde_json::to_value(update(current)).map_err(|e| decode_error(key, e))
        })?;
        serde_json::from_value(updated).map_err(|e| decode_error(key, e))
    }

    // ========================================================================
    // FETCHING
    // ========================================================================

    /// Fresh data from the cache, otherwise the result of a (shared) fetch.
    pub async fn ensure_fresh(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: &QueryOptions,
    ) -> Result<Value, FetchError> {
        self.inner.coordinator.ensure_fresh(key, fetcher, options).await
    }

    /// Typed [`ensure_fresh`](Self::ensure_fresh) with the client defaults.
    pub async fn fetch_query<T, F, Fut, E>(&self, key: &QueryKey, fetch: F) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let options = self.default_options();
        let value = self.ensure_fresh(key, Fetcher::new(fetch), &options).await?;
        serde_json::from_value(value).map_err(|e| decode_error(key, e))
    }

    /// Warm the cache. Errors are recorded on the entry and otherwise ignored.
    pub async fn prefetch_query(&self, key: &QueryKey, fetcher: Fetcher, options: &QueryOptions) {
        if let Err(error) = self.ensure_fresh(key, fetcher, options).await {
            debug!(key = %key, error = %error, "Prefetch failed");
        }
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    /// Observe `key`, fetching on attach when the entry has no data or is
    /// stale and `refetch_on_mount` is set. Starts polling when
    /// `poll_interval` is set.
    ///
    /// Must be called within a tokio runtime.
    pub fn observe(&self, key: QueryKey, fetcher: Fetcher, options: QueryOptions) -> Subscription {
        self.attach(key, fetcher, options, None)
    }

    /// [`observe`](Self::observe) with an extra notification sink.
    pub fn observe_with(
        &self,
        key: QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
        sink: Arc<dyn NotificationSink>,
    ) -> Subscription {
        self.attach(key, fetcher, options, Some(sink))
    }

    /// An observer that can be pointed at different keys over time.
    pub fn observer(&self, options: QueryOptions) -> QueryObserver {
        QueryObserver::new(self.clone(), options)
    }

    fn attach(
        &self,
        key: QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
        extra: Option<Arc<dyn NotificationSink>>,
    ) -> Subscription {
        let (watch_sink, mut rx) = WatchSink::channel(&key);
        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(watch_sink)];
        sinks.extend(extra);

        let (id, snapshot) = self
            .inner
            .store
            .subscribe(&key, &options, sinks, Some(fetcher.clone()));
        rx.mark_unchanged();

        let wants_fetch = snapshot.data.is_none() || (snapshot.is_stale && options.refetch_on_mount);
        if options.enabled && wants_fetch {
            trace!(key = %key, "Fetching on attach");
            drop(self.inner.coordinator.fetch(&key, fetcher.clone(), &options));
        }

        let poller = match options.poll_interval {
            Some(every) if options.enabled && !every.is_zero() => Some(self.spawn_poller(key.clone(), fetcher, options.clone(), every)),
            _ => None,
        };

        Subscription::new(
            self.inner.store.clone(),
            key,
            id,
            rx,
            options.placeholder_data,
            poller,
        )
    }

    fn spawn_poller(
        &self,
        key: QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
        every: std::time::Duration,
    ) -> AbortHandle {
        let coordinator = self.inner.coordinator.clone();
        let focus = self.inner.focus.clone();
        debug!(key = %key, interval_ms = every.as_millis() as u64, "Polling started");
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !focus.is_focused() {
                    trace!(key = %key, "Skipping poll while unfocused");
                    continue;
                }
                drop(coordinator.fetch(&key, fetcher.clone(), &options));
            }
        });
        task.abort_handle()
    }

    // ========================================================================
    // BULK OPERATIONS
    // ========================================================================

    /// Mark matches stale and refetch the observed ones. Returns the match count.
    pub fn invalidate_queries(&self, filter: impl Into<KeyFilter>) -> usize {
        let filter = filter.into();
        let matched = self.inner.store.mark_stale(&filter);
        drop(
            self.inner
                .coordinator
                .refetch_observed(&filter, RefetchTrigger::Invalidated),
        );
        matched.len()
    }

    /// Refetch every observed match regardless of freshness and wait for all
    /// of them. Returns how many succeeded.
    pub async fn refetch_queries(&self, filter: impl Into<KeyFilter>) -> usize {
        let filter = filter.into();
        let handles = self
            .inner
            .coordinator
            .refetch_observed(&filter, RefetchTrigger::Forced);
        join_all(handles).await.iter().filter(|r| r.is_ok()).count()
    }

    pub fn cancel_queries(&self, filter: impl Into<KeyFilter>) -> usize {
        self.inner.coordinator.cancel(&filter.into())
    }

    /// Cancel and evict every match.
    pub fn remove_queries(&self, filter: impl Into<KeyFilter>) -> usize {
        let filter = filter.into();
        self.inner.coordinator.cancel(&filter);
        self.inner.store.remove(&filter)
    }

    // ========================================================================
    // PAGINATION AND MUTATIONS
    // ========================================================================

    /// Define an infinite query at `key`.
    ///
    /// `next_cursor` receives `(last_page, all_pages, last_param, all_params)`
    /// and returns `None` when there are no more pages.
    pub fn infinite_query<T, P, F, Fut, E, N>(
        &self,
        key: QueryKey,
        initial_page_param: P,
        fetch_page: F,
        next_cursor: N,
    ) -> Result<InfiniteQuery<T, P>, FetchError>
    where
        T: Serialize + DeserializeOwned + 'static,
        P: Serialize + DeserializeOwned + 'static,
        F: Fn(FetchContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + 'static,
        N: Fn(&T, &[T], &P, &[P]) -> Option<P> + Send + Sync + 'static,
    {
        let definition = PageDefinition::typed(initial_page_param, fetch_page, next_cursor)
            .map_err(|e| decode_error(&key, e))?;
        Ok(InfiniteQuery::new(self.clone(), key, definition, self.default_options()))
    }

    /// Define a mutation around `operation`.
    pub fn mutation<I, O, F, Fut, E>(&self, operation: F) -> MutationBuilder<I, O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        self.inner.mutations.mutation(operation)
    }

    // ========================================================================
    // ENVIRONMENT
    // ========================================================================

    pub fn is_focused(&self) -> bool {
        self.inner.focus.is_focused()
    }

    /// Regaining focus refetches stale observed entries that opt in.
    pub fn set_focused(&self, focused: bool) {
        if self.inner.focus.set_focused(focused) && focused {
            debug!("Focus regained");
            drop(
                self.inner
                    .coordinator
                    .refetch_observed(&KeyFilter::All, RefetchTrigger::Focus),
            );
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.is_online()
    }

    /// Going online resumes paused fetches and refetches stale observed
    /// entries that opt in.
    pub fn set_online(&self, online: bool) {
        if self.inner.online.set_online(online) && online {
            debug!("Connectivity restored");
            drop(
                self.inner
                    .coordinator
                    .refetch_observed(&KeyFilter::All, RefetchTrigger::Reconnect),
            );
        }
    }

    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.store.events().subscribe()
    }

    /// Spawn the periodic garbage-collection sweep.
    pub fn spawn_gc(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<Arc<GcMetrics>> {
        tokio::spawn(gc_sweep_task(
            self.inner.store.clone(),
            self.inner.config.gc_sweep_interval(),
            shutdown_rx,
        ))
    }
}

fn decode_error(key: &QueryKey, e: serde_json::Error) -> FetchError {
    FetchError::Decode {
        key: key.canonical().to_string(),
        reason: e.to_string(),
    }
}
