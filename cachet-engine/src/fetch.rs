//! Fetch coordination: deduplication, retries, pausing and cancellation.
//!
//! Every dispatched fetch is a [`Shared`] future registered under its
//! dedup key and driven by a spawned task, so it runs to completion (and
//! its result lands in the cache) even when every caller stops waiting.
//! Concurrent callers for the same key get clones of the same future.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cachet_core::{FetchError, FetchStatus, KeyFilter, QueryKey, QueryOptions, RetryPolicy};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::entry::FetchTicket;
use crate::lock::lock_mutex;
use crate::managers::OnlineManager;
use crate::store::{CacheStore, RefetchTrigger};

/// Future returned by a type-erased fetch function.
pub type FetchFuture = BoxFuture<'static, Result<Value, String>>;

/// Handle to a dispatched fetch. Cloneable; every clone yields the same result.
pub type FetchHandle = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

// ============================================================================
// FETCH FUNCTIONS
// ============================================================================

/// A caller-supplied async function producing the value for a key.
#[derive(Clone)]
pub struct Fetcher(Arc<dyn Fn(FetchContext) -> FetchFuture + Send + Sync>);

impl Fetcher {
    /// Wrap a typed async function. Its output is stored as JSON and its
    /// error is kept as display text.
    pub fn new<F, Fut, T, E>(fetch: F) -> Self
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + 'static,
        E: fmt::Display + 'static,
    {
        Self(Arc::new(move |ctx| {
            let pending = fetch(ctx);
            async move {
                let value = pending.await.map_err(|e| e.to_string())?;
                serde_json::to_value(value).map_err(|e| e.to_string())
            }
            .boxed()
        }))
    }

    /// Wrap a function that already works on JSON.
    pub fn from_json<F>(fetch: F) -> Self
    where
        F: Fn(FetchContext) -> FetchFuture + Send + Sync + 'static,
    {
        Self(Arc::new(fetch))
    }

    pub(crate) fn call(&self, ctx: FetchContext) -> FetchFuture {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fetcher(..)")
    }
}

/// Cooperative cancellation signal shared by a fetch and its canceller.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What a fetch function is told about the call.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub key: QueryKey,
    /// Cursor for page fetches.
    pub page_param: Option<Value>,
    /// The entry's value when the fetch was dispatched.
    pub previous_data: Option<Value>,
    /// Zero for the first attempt.
    pub attempt: u32,
    cancel: CancelToken,
}

impl FetchContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn with_page_param(&self, param: Value) -> Self {
        Self {
            page_param: Some(param),
            ..self.clone()
        }
    }
}

/// How a successful result is folded into the target entry.
#[derive(Debug, Clone)]
pub(crate) enum Commit {
    Replace,
    /// Merge one page into the entry's page set.
    Page { param: Value },
}

pub(crate) struct FetchRequest {
    /// Deduplication identity; differs from the target's canonical key for page fetches.
    pub(crate) dedup_key: String,
    pub(crate) target: QueryKey,
    pub(crate) fetcher: Fetcher,
    pub(crate) retry: RetryPolicy,
    pub(crate) commit: Commit,
    pub(crate) page_param: Option<Value>,
}

impl FetchRequest {
    pub(crate) fn replace(key: &QueryKey, fetcher: Fetcher, options: &QueryOptions) -> Self {
        Self {
            dedup_key: key.canonical().to_string(),
            target: key.clone(),
            fetcher,
            retry: options.retry.clone(),
            commit: Commit::Replace,
            page_param: None,
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

struct InFlight {
    id: u64,
    target: QueryKey,
    cancel: CancelToken,
    future: FetchHandle,
}

struct CoordinatorInner {
    store: CacheStore,
    online: OnlineManager,
    in_flight: Mutex<HashMap<String, InFlight>>,
    ids: AtomicU64,
}

/// Runs fetches against a [`CacheStore`], at most one per dedup key.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FetchCoordinator {
    pub fn new(store: CacheStore, online: OnlineManager) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                online,
                in_flight: Mutex::new(HashMap::new()),
                ids: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Return fresh data without fetching, otherwise fetch (or join the
    /// fetch already running) and return its result.
    pub async fn ensure_fresh(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: &QueryOptions,
    ) -> Result<Value, FetchError> {
        let cached = self.inner.store.prepare(key, options, Some(fetcher.clone()));
        if !options.enabled {
            return cached.data.ok_or_else(|| FetchError::Disabled {
                key: key.canonical().to_string(),
            });
        }
        if !cached.is_stale {
            if let Some(value) = cached.data {
                trace!(key = %key, "Serving fresh entry");
                return Ok(value);
            }
        }
        self.dispatch(FetchRequest::replace(key, fetcher, options), options)
            .await
    }

    /// Dispatch a fetch regardless of freshness, joining one already in flight.
    ///
    /// Must be called within a tokio runtime.
    pub fn fetch(&self, key: &QueryKey, fetcher: Fetcher, options: &QueryOptions) -> FetchHandle {
        self.inner.store.prepare(key, options, Some(fetcher.clone()));
        self.dispatch(FetchRequest::replace(key, fetcher, options), options)
    }

    pub fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.is_dedup_key_in_flight(key.canonical())
    }

    pub(crate) fn is_dedup_key_in_flight(&self, dedup_key: &str) -> bool {
        lock_mutex(&self.inner.in_flight, "fetch.is_in_flight").contains_key(dedup_key)
    }

    /// Number of distinct fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        lock_mutex(&self.inner.in_flight, "fetch.in_flight_count").len()
    }

    /// Cancel every fetch whose target matches. Their entries return to
    /// `idle` with status and value untouched; late results are discarded.
    pub fn cancel(&self, filter: &KeyFilter) -> usize {
        let cancelled: Vec<InFlight> = {
            let mut in_flight = lock_mutex(&self.inner.in_flight, "fetch.cancel");
            let keys: Vec<String> = in_flight
                .iter()
                .filter(|(_, f)| filter.matches(&f.target))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| in_flight.remove(k)).collect()
        };
        for fetch in &cancelled {
            self.inner.store.cancel_fetches(&fetch.target);
            fetch.cancel.cancel();
            debug!(key = %fetch.target, "Fetch cancelled");
        }
        cancelled.len()
    }

    /// Refetch observed entries matching `filter` that want `trigger`.
    pub fn refetch_observed(&self, filter: &KeyFilter, trigger: RefetchTrigger) -> Vec<FetchHandle> {
        let plans = self.inner.store.refetch_plans(filter, trigger);
        if !plans.is_empty() {
            debug!(count = plans.len(), trigger = ?trigger, "Refetching observed entries");
        }
        plans
            .into_iter()
            .map(|plan| {
                let request = FetchRequest::replace(&plan.key, plan.fetcher, &plan.options);
                self.dispatch(request, &plan.options)
            })
            .collect()
    }

    pub(crate) fn dispatch(&self, request: FetchRequest, options: &QueryOptions) -> FetchHandle {
        if matches!(request.commit, Commit::Replace) && !self.is_dedup_key_in_flight(&request.dedup_key) {
            self.cancel_page_fetches(&request.target);
        }

        let mut in_flight = lock_mutex(&self.inner.in_flight, "fetch.dispatch");
        if let Some(existing) = in_flight.get(&request.dedup_key) {
            trace!(key = %request.dedup_key, "Joining in-flight fetch");
            return existing.future.clone();
        }

        let (ticket, previous_data, deferred) = self.inner.store.begin_fetch(&request.target, options);
        let id = self.inner.ids.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelToken::new();
        let canonical = request.dedup_key.clone();
        let target = request.target.clone();
        debug!(key = %request.dedup_key, "Fetch dispatched");

        let future = self
            .clone()
            .run(request, ticket, cancel.clone(), id, previous_data)
            .boxed()
            .shared();
        in_flight.insert(
            canonical,
            InFlight {
                id,
                target,
                cancel,
                future: future.clone(),
            },
        );
        drop(in_flight);
        // Sinks may call back into the coordinator.
        deferred.deliver();

        drop(tokio::spawn(future.clone()));
        future
    }

    /// Stop page fetches into `target`; a whole-set reload would overwrite them.
    fn cancel_page_fetches(&self, target: &QueryKey) {
        let stopped: Vec<InFlight> = {
            let mut in_flight = lock_mutex(&self.inner.in_flight, "fetch.cancel_pages");
            let keys: Vec<String> = in_flight
                .iter()
                .filter(|(k, f)| f.target == *target && k.as_str() != target.canonical())
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| in_flight.remove(k)).collect()
        };
        if stopped.is_empty() {
            return;
        }
        self.inner.store.cancel_fetches(target);
        for fetch in &stopped {
            fetch.cancel.cancel();
        }
        debug!(key = %target, pages = stopped.len(), "Page fetches cancelled by reload");
    }

    async fn run(
        self,
        request: FetchRequest,
        ticket: FetchTicket,
        cancel: CancelToken,
        id: u64,
        previous_data: Option<Value>,
    ) -> Result<Value, FetchError> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled {
                key: request.target.canonical().to_string(),
            }),
            result = self.attempt(&request, ticket, &cancel, previous_data) => result,
        };

        {
            let mut in_flight = lock_mutex(&self.inner.in_flight, "fetch.complete");
            if in_flight
                .get(&request.dedup_key)
                .is_some_and(|f| f.id == id)
            {
                in_flight.remove(&request.dedup_key);
            }
        }
        self.inner.store.finish_fetch(&request.target, ticket);
        outcome
    }

    async fn attempt(
        &self,
        request: &FetchRequest,
        ticket: FetchTicket,
        cancel: &CancelToken,
        previous_data: Option<Value>,
    ) -> Result<Value, FetchError> {
        let store = &self.inner.store;
        let mut attempt = 0u32;
        loop {
            if !self.inner.online.is_online() {
                store.set_fetch_status(&request.target, ticket, FetchStatus::Paused);
                debug!(key = %request.target, "Fetch paused until connectivity returns");
                self.inner.online.wait_online().await;
                store.set_fetch_status(&request.target, ticket, FetchStatus::Fetching);
            }

            let ctx = FetchContext {
                key: request.target.clone(),
                page_param: request.page_param.clone(),
                previous_data: previous_data.clone(),
                attempt,
                cancel: cancel.clone(),
            };
            match request.fetcher.call(ctx).await {
                Ok(value) => {
                    store.commit_fetch(&request.target, ticket, &request.commit, value.clone());
                    debug!(key = %request.dedup_key, attempts = attempt + 1, "Fetch succeeded");
                    return Ok(value);
                }
                Err(reason) => {
                    store.record_failed_attempt(&request.target, ticket);
                    if attempt >= request.retry.max_retries {
                        let error = FetchError::Failed {
                            key: request.target.canonical().to_string(),
                            reason,
                            attempts: attempt + 1,
                        };
                        debug!(key = %request.dedup_key, error = %error, "Fetch failed");
                        store.fail_fetch(&request.target, ticket, error.clone());
                        return Err(error);
                    }
                    let delay = request.retry.delay_for(attempt);
                    warn!(
                        key = %request.dedup_key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventBus;
    use cachet_core::{query_key, QueryStatus};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn coordinator() -> FetchCoordinator {
        let store = CacheStore::new(QueryOptions::default(), EventBus::new(16));
        FetchCoordinator::new(store, OnlineManager::new())
    }

    fn counting_fetcher(calls: Arc<AtomicU32>, value: Value) -> Fetcher {
        Fetcher::new(move |_ctx| {
            let calls = Arc::clone(&calls);
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, String>(value)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_call() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let key = query_key!["posts"];
        let options = QueryOptions::default();

        let a = coordinator.ensure_fresh(&key, counting_fetcher(calls.clone(), json!(1)), &options);
        let b = coordinator.ensure_fresh(&key, counting_fetcher(calls.clone(), json!(2)), &options);
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap(), json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_in_flight(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_is_served_from_cache() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let key = query_key!["posts"];
        let options = QueryOptions::default().with_freshness_window(Duration::from_secs(60));

        coordinator
            .ensure_fresh(&key, counting_fetcher(calls.clone(), json!(1)), &options)
            .await
            .unwrap();
        coordinator
            .ensure_fresh(&key, counting_fetcher(calls.clone(), json!(1)), &options)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_records_error() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = Fetcher::new(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>("503 Service Unavailable")
            }
        });
        let key = query_key!["posts"];
        let options = QueryOptions::default().with_retry_count(2);

        let err = coordinator.ensure_fresh(&key, fetcher, &options).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, FetchError::Failed { attempts: 3, .. }));

        let snapshot = coordinator.store().read(&key).unwrap();
        assert_eq!(snapshot.status, QueryStatus::Error);
        assert_eq!(snapshot.fetch_failure_count, 3);
        assert_eq!(snapshot.fetch_status, FetchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_fail_fast() {
        let coordinator = coordinator();
        let fetcher = Fetcher::new(|_ctx| async { Err::<Value, _>("boom") });
        let key = query_key!["posts"];
        let options = QueryOptions::default().with_retry_count(0);

        let err = coordinator.ensure_fresh(&key, fetcher, &options).await.unwrap_err();
        assert!(matches!(err, FetchError::Failed { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_query_never_fetches() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let key = query_key!["likeStatus", 1, ""];
        let options = QueryOptions::default().with_enabled(false);

        let err = coordinator
            .ensure_fresh(&key, counting_fetcher(calls.clone(), json!(true)), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Disabled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_entry_to_idle() {
        let coordinator = coordinator();
        let key = query_key!["posts"];
        coordinator.store().write(&key, json!("old"), QueryStatus::Success);
        let fetcher = Fetcher::new(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(json!("new"))
        });

        let handle = coordinator.fetch(&key, fetcher, &QueryOptions::default());
        tokio::task::yield_now().await;
        assert!(coordinator.store().read(&key).unwrap().is_fetching());

        assert_eq!(coordinator.cancel(&KeyFilter::exact(key.clone())), 1);
        let result = handle.await;
        assert!(result.unwrap_err().is_cancelled());

        let snapshot = coordinator.store().read(&key).unwrap();
        assert_eq!(snapshot.fetch_status, FetchStatus::Idle);
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(snapshot.data, Some(json!("old")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_still_caches_result() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let key = query_key!["posts"];

        drop(coordinator.fetch(&key, counting_fetcher(calls, json!("done")), &QueryOptions::default()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coordinator.store().read(&key).unwrap().data, Some(json!("done")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_fetch_pauses_then_resumes() {
        let store = CacheStore::new(QueryOptions::default(), EventBus::new(16));
        let online = OnlineManager::new();
        let coordinator = FetchCoordinator::new(store.clone(), online.clone());
        let key = query_key!["posts"];
        online.set_online(false);

        let handle = coordinator.fetch(
            &key,
            Fetcher::new(|_ctx| async { Ok::<_, String>(json!([1])) }),
            &QueryOptions::default(),
        );
        tokio::task::yield_now().await;
        let snapshot = store.read(&key).unwrap();
        assert!(snapshot.is_paused());
        assert!(snapshot.is_pending());

        online.set_online(true);
        assert_eq!(handle.await.unwrap(), json!([1]));
        assert!(store.read(&key).unwrap().is_success());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.clone().cancel();
        assert!(token.is_cancelled());
    }
}
