//! Cursor-based infinite pagination.
//!
//! A page set lives under a single cache key as
//! `{"pages": [...], "pageParams": [...]}`. Each page fetch is deduplicated
//! on the pair (key, cursor) but committed into the page set of the key:
//! a new cursor appends, a known cursor replaces its page in place.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use cachet_core::{FetchError, QueryKey, QueryOptions};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::client::QueryClient;
use crate::fetch::{Commit, FetchContext, FetchCoordinator, FetchFuture, FetchHandle, FetchRequest, Fetcher};
use crate::observer::Subscription;

/// Fetches one page for a cursor.
pub type PageFetchFn = Arc<dyn Fn(FetchContext, Value) -> FetchFuture + Send + Sync>;

/// Derives the next cursor from the pages loaded so far; `None` means no more pages.
pub type NextCursorFn = Arc<dyn Fn(&PageSet) -> Result<Option<Value>, String> + Send + Sync>;

// ============================================================================
// PAGE SETS
// ============================================================================

/// Ordered pages with the cursors that produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSet {
    pub pages: Vec<Value>,
    pub page_params: Vec<Value>,
}

impl PageSet {
    /// Parse a stored page set; anything else yields an empty set.
    pub fn from_value(value: Option<&Value>) -> Self {
        let mut set: PageSet = value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let len = set.pages.len().min(set.page_params.len());
        set.pages.truncate(len);
        set.page_params.truncate(len);
        set
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({
            "pages": self.pages,
            "pageParams": self.page_params,
        })
    }

    /// Replace the page for `param` if present, otherwise append.
    pub fn merge(&mut self, param: Value, page: Value) {
        let existing = self.page_params.iter().position(|p| *p == param);
        match existing.and_then(|index| self.pages.get_mut(index)) {
            Some(slot) => *slot = page,
            None => {
                self.pages.push(page);
                self.page_params.push(param);
            }
        }
    }

    pub fn contains_param(&self, param: &Value) -> bool {
        self.page_params.contains(param)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Typed view of a page set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteData<T, P> {
    pub pages: Vec<T>,
    pub page_params: Vec<P>,
}

// ============================================================================
// PAGE DEFINITION
// ============================================================================

/// Everything needed to load pages for one infinite query.
#[derive(Clone)]
pub struct PageDefinition {
    pub initial_page_param: Value,
    fetch_page: PageFetchFn,
    next_cursor: NextCursorFn,
}

impl fmt::Debug for PageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDefinition")
            .field("initial_page_param", &self.initial_page_param)
            .finish_non_exhaustive()
    }
}

impl PageDefinition {
    pub fn new(initial_page_param: Value, fetch_page: PageFetchFn, next_cursor: NextCursorFn) -> Self {
        Self {
            initial_page_param,
            fetch_page,
            next_cursor,
        }
    }

    /// Build a definition from typed functions.
    ///
    /// `next_cursor` receives `(last_page, all_pages, last_param, all_params)`.
    pub fn typed<T, P, F, Fut, E, N>(
        initial_page_param: P,
        fetch_page: F,
        next_cursor: N,
    ) -> Result<Self, serde_json::Error>
    where
        T: Serialize + DeserializeOwned + 'static,
        P: Serialize + DeserializeOwned + 'static,
        F: Fn(FetchContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + 'static,
        N: Fn(&T, &[T], &P, &[P]) -> Option<P> + Send + Sync + 'static,
    {
        let initial = serde_json::to_value(initial_page_param)?;

        let fetch: PageFetchFn = Arc::new(move |ctx: FetchContext, param: Value| -> FetchFuture {
            match serde_json::from_value::<P>(param) {
                Ok(param) => {
                    let pending = fetch_page(ctx, param);
                    async move {
                        let page = pending.await.map_err(|e| e.to_string())?;
                        serde_json::to_value(page).map_err(|e| e.to_string())
                    }
                    .boxed()
                }
                Err(e) => {
                    let reason = format!("invalid page param: {e}");
                    async move { Err(reason) }.boxed()
                }
            }
        });

        let next: NextCursorFn = Arc::new(move |set: &PageSet| -> Result<Option<Value>, String> {
            let pages = decode_all::<T>(&set.pages)?;
            let params = decode_all::<P>(&set.page_params)?;
            let (Some(last_page), Some(last_param)) = (pages.last(), params.last()) else {
                return Ok(None);
            };
            next_cursor(last_page, &pages, last_param, &params)
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| e.to_string())
        });

        Ok(Self::new(initial, fetch, next))
    }

    /// Next cursor after the loaded pages; the initial cursor for an empty set.
    pub fn next_page_param(&self, pages: &PageSet) -> Result<Option<Value>, String> {
        if pages.is_empty() {
            return Ok(Some(self.initial_page_param.clone()));
        }
        (self.next_cursor)(pages)
    }
}

fn decode_all<T: DeserializeOwned>(values: &[Value]) -> Result<Vec<T>, String> {
    values
        .iter()
        .map(|v| serde_json::from_value(v.clone()).map_err(|e| e.to_string()))
        .collect()
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Page fetching on top of a [`FetchCoordinator`].
#[derive(Clone)]
pub struct PaginationController {
    coordinator: FetchCoordinator,
}

impl PaginationController {
    pub fn new(coordinator: FetchCoordinator) -> Self {
        Self { coordinator }
    }

    /// In-flight identity of one page of `key`.
    pub fn page_dedup_key(key: &QueryKey, page_param: &Value) -> String {
        format!("{}@{}", key.canonical(), page_param)
    }

    /// Fetch the page for `page_param` into the page set stored at `key`.
    ///
    /// Only a loaded cursor (refetched in place) or the next cursor of the
    /// chain is accepted; anything else would break cursor-chain order.
    pub fn fetch_page(
        &self,
        key: &QueryKey,
        page_param: Value,
        definition: &PageDefinition,
        options: &QueryOptions,
    ) -> Result<FetchHandle, FetchError> {
        let loaded = self
            .coordinator
            .store()
            .read(key)
            .map(|s| PageSet::from_value(s.data.as_ref()).contains_param(&page_param))
            .unwrap_or(false);
        if !loaded && self.next_page_param(key, definition).as_ref() != Some(&page_param) {
            return Err(FetchError::PageOutOfChain {
                key: key.canonical().to_string(),
                param: page_param.to_string(),
            });
        }
        Ok(self.dispatch_page(key, page_param, definition, options))
    }

    fn dispatch_page(
        &self,
        key: &QueryKey,
        page_param: Value,
        definition: &PageDefinition,
        options: &QueryOptions,
    ) -> FetchHandle {
        self.coordinator
            .store()
            .prepare(key, options, Some(Self::refetch_all(definition.clone())));

        let fetch_page = Arc::clone(&definition.fetch_page);
        let param = page_param.clone();
        let fetcher = Fetcher::from_json(move |ctx: FetchContext| (fetch_page)(ctx, param.clone()));
        let request = FetchRequest {
            dedup_key: Self::page_dedup_key(key, &page_param),
            target: key.clone(),
            fetcher,
            retry: options.retry.clone(),
            commit: Commit::Page {
                param: page_param.clone(),
            },
            page_param: Some(page_param),
        };
        self.coordinator.dispatch(request, options)
    }

    /// Cursor of the page after those stored at `key`, or `None` when exhausted.
    pub fn next_page_param(&self, key: &QueryKey, definition: &PageDefinition) -> Option<Value> {
        let data = self.coordinator.store().read(key).and_then(|s| s.data);
        let pages = PageSet::from_value(data.as_ref());
        match definition.next_page_param(&pages) {
            Ok(next) => next,
            Err(reason) => {
                warn!(key = %key, reason = %reason, "Could not derive next page param");
                None
            }
        }
    }

    /// True iff at least one page is loaded and the cursor function yields a next cursor.
    pub fn has_next_page(&self, key: &QueryKey, definition: &PageDefinition) -> bool {
        let loaded = self
            .coordinator
            .store()
            .read(key)
            .map(|s| !PageSet::from_value(s.data.as_ref()).is_empty())
            .unwrap_or(false);
        loaded && self.next_page_param(key, definition).is_some()
    }

    pub fn is_fetching_next_page(&self, key: &QueryKey, definition: &PageDefinition) -> bool {
        self.next_page_param(key, definition)
            .map(|param| {
                self.coordinator
                    .is_dedup_key_in_flight(&Self::page_dedup_key(key, &param))
            })
            .unwrap_or(false)
    }

    /// Fetch the next page. Returns `None` without dispatching when there is
    /// no next page, it is already being fetched, or the whole page set is
    /// being reloaded.
    pub fn fetch_next_page(
        &self,
        key: &QueryKey,
        definition: &PageDefinition,
        options: &QueryOptions,
    ) -> Option<FetchHandle> {
        if self.coordinator.is_in_flight(key) {
            trace!(key = %key, "Page set reload in flight");
            return None;
        }
        let Some(param) = self.next_page_param(key, definition) else {
            debug!(key = %key, "No next page");
            return None;
        };
        if self
            .coordinator
            .is_dedup_key_in_flight(&Self::page_dedup_key(key, &param))
        {
            trace!(key = %key, page_param = %param, "Next page already in flight");
            return None;
        }
        Some(self.dispatch_page(key, param, definition, options))
    }

    /// Fetcher that reloads a page set from the initial cursor, re-deriving
    /// each cursor and stopping at the previously loaded page count.
    pub(crate) fn refetch_all(definition: PageDefinition) -> Fetcher {
        Fetcher::from_json(move |ctx: FetchContext| {
            let definition = definition.clone();
            async move {
                let target = PageSet::from_value(ctx.previous_data.as_ref()).len().max(1);
                let mut pages = PageSet::default();
                let mut param = definition.initial_page_param.clone();
                loop {
                    let page = (definition.fetch_page)(ctx.with_page_param(param.clone()), param.clone()).await?;
                    pages.merge(param, page);
                    if pages.len() >= target {
                        break;
                    }
                    match (definition.next_cursor)(&pages)? {
                        Some(next) if !pages.contains_param(&next) => param = next,
                        _ => break,
                    }
                }
                trace!(key = %ctx.key, pages = pages.len(), "Reloaded page set");
                Ok(pages.into_value())
            }
            .boxed()
        })
    }
}

// ============================================================================
// TYPED HANDLE
// ============================================================================

/// Typed handle to one infinite query.
pub struct InfiniteQuery<T, P> {
    client: QueryClient,
    key: QueryKey,
    definition: PageDefinition,
    options: QueryOptions,
    _types: PhantomData<fn() -> (T, P)>,
}

impl<T, P> Clone for InfiniteQuery<T, P> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            key: self.key.clone(),
            definition: self.definition.clone(),
            options: self.options.clone(),
            _types: PhantomData,
        }
    }
}

impl<T, P> InfiniteQuery<T, P>
where
    T: DeserializeOwned,
    P: Serialize + DeserializeOwned,
{
    pub(crate) fn new(
        client: QueryClient,
        key: QueryKey,
        definition: PageDefinition,
        options: QueryOptions,
    ) -> Self {
        Self {
            client,
            key,
            definition,
            options,
            _types: PhantomData,
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn definition(&self) -> &PageDefinition {
        &self.definition
    }

    /// Load the first page, or reload every loaded page when stale.
    pub async fn fetch(&self) -> Result<InfiniteData<T, P>, FetchError> {
        let fetcher = PaginationController::refetch_all(self.definition.clone());
        let value = self
            .client
            .coordinator()
            .ensure_fresh(&self.key, fetcher, &self.options)
            .await?;
        self.decode(value)
    }

    /// Observe the page set. Stale observed page sets are reloaded page by page.
    pub fn observe(&self) -> Subscription {
        let fetcher = PaginationController::refetch_all(self.definition.clone());
        self.client.observe(self.key.clone(), fetcher, self.options.clone())
    }

    /// Refetch a loaded page, or fetch the next one.
    pub async fn fetch_page(&self, page_param: P) -> Result<T, FetchError> {
        let param = serde_json::to_value(page_param).map_err(|e| self.decode_error(e))?;
        let page = self
            .client
            .pagination()
            .fetch_page(&self.key, param, &self.definition, &self.options)?
            .await?;
        serde_json::from_value(page).map_err(|e| self.decode_error(e))
    }

    /// Fetch the next page. `Ok(false)` when nothing was dispatched.
    pub async fn fetch_next_page(&self) -> Result<bool, FetchError> {
        match self
            .client
            .pagination()
            .fetch_next_page(&self.key, &self.definition, &self.options)
        {
            Some(handle) => handle.await.map(|_| true),
            None => Ok(false),
        }
    }

    pub fn has_next_page(&self) -> bool {
        self.client
            .pagination()
            .has_next_page(&self.key, &self.definition)
    }

    pub fn next_page_param(&self) -> Option<P> {
        self.client
            .pagination()
            .next_page_param(&self.key, &self.definition)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.client
            .pagination()
            .is_fetching_next_page(&self.key, &self.definition)
    }

    /// Loaded pages, if any.
    pub fn data(&self) -> Result<Option<InfiniteData<T, P>>, FetchError> {
        self.client
            .read(&self.key)
            .and_then(|snapshot| snapshot.data)
            .map(|value| self.decode(value))
            .transpose()
    }

    fn decode(&self, value: Value) -> Result<InfiniteData<T, P>, FetchError> {
        serde_json::from_value(value).map_err(|e| self.decode_error(e))
    }

    fn decode_error(&self, e: serde_json::Error) -> FetchError {
        FetchError::Decode {
            key: self.key.canonical().to_string(),
            reason: e.to_string(),
        }
    }
}
