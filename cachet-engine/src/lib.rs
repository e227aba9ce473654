//! Cachet Engine - In-Memory Query Cache
//!
//! A key-addressed cache of asynchronously produced values. Readers get the
//! current snapshot immediately; stale or missing entries are (re)fetched in
//! the background with at most one fetch per key. Inactive entries are
//! evicted after their retention period. On top of that sit cursor-based
//! infinite pagination and optimistic mutations with rollback.
//!
//! Everything hangs off a [`QueryClient`]; there is no global cache.

mod lock;

pub mod client;
pub mod entry;
pub mod fetch;
pub mod gc;
pub mod managers;
pub mod mutation;
pub mod notify;
pub mod observer;
pub mod pagination;
pub mod store;

pub use client::QueryClient;
pub use entry::{ObserverId, QuerySnapshot};
pub use fetch::{CancelToken, FetchContext, FetchCoordinator, FetchFuture, FetchHandle, Fetcher};
pub use gc::{gc_sweep_task, GcMetrics, GcSnapshot};
pub use managers::{FocusManager, OnlineManager};
pub use mutation::{MutateCallbacks, Mutation, MutationBuilder, MutationEngine};
pub use notify::{CacheEvent, EventBus, NotificationSink};
pub use observer::{QueryObserver, Subscription};
pub use pagination::{
    InfiniteData, InfiniteQuery, NextCursorFn, PageDefinition, PageFetchFn, PageSet,
    PaginationController,
};
pub use store::{CacheStore, RefetchTrigger};

// Re-export the core types so callers need a single dependency.
pub use cachet_core::{
    query_key, Backoff, BackoffFn, CachetError, CachetResult, ClientConfig, ConfigError,
    FetchError, FetchStatus, KeyError, KeyFilter, KeySegment, MutationError, MutationStatus,
    Primitive, QueryDefaults, QueryKey, QueryOptions, QueryStatus, RetryPolicy,
};
