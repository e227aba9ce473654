//! Cache entries and the snapshots handed to readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cachet_core::{FetchError, FetchStatus, QueryKey, QueryOptions, QueryStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::fetch::Fetcher;
use crate::notify::NotificationSink;

/// Identifies one observer of one entry.
pub type ObserverId = Uuid;

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Point-in-time view of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub key: QueryKey,
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub error: Option<FetchError>,
    /// Wall-clock time of the last successful write.
    pub data_updated_at: Option<DateTime<Utc>>,
    pub error_updated_at: Option<DateTime<Utc>>,
    /// Failed attempts since the last success.
    pub fetch_failure_count: u32,
    pub is_stale: bool,
    pub is_invalidated: bool,
    pub observer_count: usize,
    /// Data shown by an observer while the entry itself has none.
    pub is_placeholder_data: bool,
    pub(crate) data_update_count: u32,
    pub(crate) error_update_count: u32,
}

impl QuerySnapshot {
    /// Snapshot of an entry that does not exist yet.
    pub fn empty(key: &QueryKey) -> Self {
        Self {
            key: key.clone(),
            data: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            fetch_failure_count: 0,
            is_stale: true,
            is_invalidated: false,
            observer_count: 0,
            is_placeholder_data: false,
            data_update_count: 0,
            error_update_count: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// First load in progress: no data yet and a fetch running.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// At least one fetch has settled, successfully or not.
    pub fn is_fetched(&self) -> bool {
        self.data_update_count > 0 || self.error_update_count > 0
    }

    /// Decode the data into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, FetchError> {
        self.data
            .as_ref()
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| FetchError::Decode {
                    key: self.key.canonical().to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}

// ============================================================================
// ENTRY
// ============================================================================

pub(crate) struct ObserverSlot {
    pub(crate) options: QueryOptions,
    pub(crate) sinks: Vec<Arc<dyn NotificationSink>>,
}

/// Identity of one dispatched fetch against one entry.
///
/// `incarnation` changes when the entry is removed and recreated, `epoch`
/// changes when its fetches are cancelled. Late results carrying an old
/// ticket are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchTicket {
    pub(crate) incarnation: u64,
    pub(crate) epoch: u64,
}

/// Prior state captured before an optimistic edit.
#[derive(Debug, Clone)]
pub(crate) struct EntryBackup {
    pub(crate) key: QueryKey,
    pub(crate) incarnation: u64,
    pub(crate) value: Option<Value>,
    pub(crate) status: QueryStatus,
    pub(crate) updated_at: Option<Instant>,
    pub(crate) data_updated_at: Option<DateTime<Utc>>,
}

pub(crate) struct CacheEntry {
    pub(crate) key: QueryKey,
    pub(crate) value: Option<Value>,
    pub(crate) status: QueryStatus,
    pub(crate) fetch_status: FetchStatus,
    pub(crate) error: Option<FetchError>,
    pub(crate) updated_at: Option<Instant>,
    pub(crate) data_updated_at: Option<DateTime<Utc>>,
    pub(crate) error_updated_at: Option<DateTime<Utc>>,
    pub(crate) data_update_count: u32,
    pub(crate) error_update_count: u32,
    pub(crate) fetch_failure_count: u32,
    pub(crate) invalidated: bool,
    pub(crate) freshness_window: Duration,
    pub(crate) retention: Duration,
    /// Options of the most recent caller; used for auto-refetch.
    pub(crate) options: QueryOptions,
    pub(crate) fetcher: Option<Fetcher>,
    pub(crate) observers: HashMap<ObserverId, ObserverSlot>,
    pub(crate) inactive_since: Option<Instant>,
    pub(crate) fetches_in_flight: u32,
    pub(crate) mutation_holds: u32,
    pub(crate) incarnation: u64,
    pub(crate) epoch: u64,
    pub(crate) gc_timer: Option<AbortHandle>,
}

impl CacheEntry {
    pub(crate) fn new(key: QueryKey, options: &QueryOptions, incarnation: u64, now: Instant) -> Self {
        let mut entry = Self {
            key,
            value: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            error: None,
            updated_at: None,
            data_updated_at: None,
            error_updated_at: None,
            data_update_count: 0,
            error_update_count: 0,
            fetch_failure_count: 0,
            invalidated: false,
            freshness_window: options.freshness_window,
            retention: options.retention,
            options: options.clone(),
            fetcher: None,
            observers: HashMap::new(),
            // Created without observers means inactive from the start.
            inactive_since: Some(now),
            fetches_in_flight: 0,
            mutation_holds: 0,
            incarnation,
            epoch: incarnation,
            gc_timer: None,
        };
        if let Some(initial) = &options.initial_data {
            entry.set_value(initial.clone(), now);
        }
        entry
    }

    pub(crate) fn ticket(&self) -> FetchTicket {
        FetchTicket {
            incarnation: self.incarnation,
            epoch: self.epoch,
        }
    }

    /// Apply the options of a new caller. Retention only ever grows.
    pub(crate) fn apply_options(&mut self, options: &QueryOptions) {
        self.freshness_window = options.freshness_window;
        self.retention = self.retention.max(options.retention);
        self.options = options.clone();
    }

    pub(crate) fn set_value(&mut self, value: Value, now: Instant) {
        self.value = Some(value);
        self.status = QueryStatus::Success;
        self.error = None;
        self.updated_at = Some(now);
        self.data_updated_at = Some(Utc::now());
        self.data_update_count = self.data_update_count.saturating_add(1);
        self.fetch_failure_count = 0;
        self.invalidated = false;
    }

    pub(crate) fn set_error(&mut self, error: FetchError) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.error_updated_at = Some(Utc::now());
        self.error_update_count = self.error_update_count.saturating_add(1);
    }

    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        if self.invalidated || self.value.is_none() {
            return true;
        }
        match self.updated_at {
            Some(at) => now.saturating_duration_since(at) >= self.freshness_window,
            None => true,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.observers.is_empty()
    }

    pub(crate) fn has_enabled_observer(&self) -> bool {
        self.observers.values().any(|slot| slot.options.enabled)
    }

    /// Inactive past retention with nothing pinning it.
    pub(crate) fn is_collectable(&self, now: Instant) -> bool {
        if self.is_active() || self.fetches_in_flight > 0 || self.mutation_holds > 0 {
            return false;
        }
        match self.inactive_since {
            Some(since) => now.saturating_duration_since(since) >= self.retention,
            None => false,
        }
    }

    pub(crate) fn backup(&self) -> EntryBackup {
        EntryBackup {
            key: self.key.clone(),
            incarnation: self.incarnation,
            value: self.value.clone(),
            status: self.status,
            updated_at: self.updated_at,
            data_updated_at: self.data_updated_at,
        }
    }

    pub(crate) fn restore(&mut self, backup: &EntryBackup) {
        self.value = backup.value.clone();
        self.status = backup.status;
        self.updated_at = backup.updated_at;
        self.data_updated_at = backup.data_updated_at;
    }

    pub(crate) fn sinks(&self) -> Vec<Arc<dyn NotificationSink>> {
        self.observers
            .values()
            .flat_map(|slot| slot.sinks.iter().cloned())
            .collect()
    }

    pub(crate) fn snapshot(&self, now: Instant) -> QuerySnapshot {
        QuerySnapshot {
            key: self.key.clone(),
            data: self.value.clone(),
            status: self.status,
            fetch_status: self.fetch_status,
            error: self.error.clone(),
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            fetch_failure_count: self.fetch_failure_count,
            is_stale: self.is_stale(now),
            is_invalidated: self.invalidated,
            observer_count: self.observers.len(),
            is_placeholder_data: false,
            data_update_count: self.data_update_count,
            error_update_count: self.error_update_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::query_key;
    use serde_json::json;

    fn entry(options: &QueryOptions) -> CacheEntry {
        CacheEntry::new(query_key!["posts"], options, 1, Instant::now())
    }

    #[test]
    fn test_new_entry_is_pending_and_inactive() {
        let entry = entry(&QueryOptions::default());
        assert_eq!(entry.status, QueryStatus::Pending);
        assert!(entry.value.is_none());
        assert!(entry.inactive_since.is_some());
        assert!(entry.is_stale(Instant::now()));
    }

    #[test]
    fn test_initial_data_seeds_success() {
        let options = QueryOptions::default().with_initial_data(json!([1, 2]));
        let entry = entry(&options);
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.value, Some(json!([1, 2])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_follows_freshness_window() {
        let options = QueryOptions::default().with_freshness_window(Duration::from_secs(10));
        let mut entry = entry(&options);
        entry.set_value(json!(1), Instant::now());
        assert!(!entry.is_stale(Instant::now()));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(entry.is_stale(Instant::now()));
    }

    #[test]
    fn test_invalidated_entry_is_stale() {
        let options = QueryOptions::default().with_freshness_window(Duration::from_secs(60));
        let mut entry = entry(&options);
        entry.set_value(json!(1), Instant::now());
        entry.invalidated = true;
        assert!(entry.is_stale(Instant::now()));
    }

    #[test]
    fn test_error_keeps_prior_value() {
        let mut entry = entry(&QueryOptions::default());
        entry.set_value(json!("kept"), Instant::now());
        entry.set_error(FetchError::Failed {
            key: entry.key.canonical().to_string(),
            reason: "boom".to_string(),
            attempts: 1,
        });
        assert_eq!(entry.status, QueryStatus::Error);
        assert_eq!(entry.value, Some(json!("kept")));

        let snapshot = entry.snapshot(Instant::now());
        assert!(snapshot.is_error());
        assert!(snapshot.is_fetched());
    }

    #[test]
    fn test_pinned_entries_are_not_collectable() {
        let options = QueryOptions::default().with_retention(Duration::ZERO);
        let mut entry = entry(&options);
        let now = Instant::now();
        assert!(entry.is_collectable(now));

        entry.fetches_in_flight = 1;
        assert!(!entry.is_collectable(now));

        entry.fetches_in_flight = 0;
        entry.mutation_holds = 1;
        assert!(!entry.is_collectable(now));
    }

    #[test]
    fn test_snapshot_decodes_typed_data() {
        let mut entry = entry(&QueryOptions::default());
        entry.set_value(json!({"liked": true}), Instant::now());
        let snapshot = entry.snapshot(Instant::now());

        #[derive(serde::Deserialize)]
        struct Like {
            liked: bool,
        }
        let like: Like = snapshot.data_as().unwrap().unwrap();
        assert!(like.liked);

        let bad: Result<Option<u32>, _> = snapshot.data_as();
        assert!(matches!(bad, Err(FetchError::Decode { .. })));
    }
}
