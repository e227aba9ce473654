//! Cachet Core - Keys, Errors and Options
//!
//! Plain data types shared by the engine and its callers. Nothing in this
//! crate spawns tasks or holds locks.

pub mod config;
pub mod error;
pub mod key;
pub mod status;

pub use config::{
    Backoff, BackoffFn, ClientConfig, QueryDefaults, QueryOptions, RetryPolicy,
    DEFAULT_RETENTION_MS,
};
pub use error::{CachetError, CachetResult, ConfigError, FetchError, KeyError, MutationError};
pub use key::{encode, is_prefix_of, KeyFilter, KeySegment, Primitive, QueryKey};
pub use status::{FetchStatus, MutationStatus, QueryStatus};
