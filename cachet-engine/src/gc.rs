//! Periodic garbage-collection sweep.
//!
//! Retention timers evict entries individually; this task is the backstop
//! for entries created outside a runtime or whose timers were skipped
//! because a fetch or a mutation was pinning them at the deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::store::CacheStore;

/// Counters collected over the task's lifetime.
#[derive(Debug, Default)]
pub struct GcMetrics {
    pub sweeps: AtomicU64,
    pub evicted: AtomicU64,
}

impl GcMetrics {
    pub fn snapshot(&self) -> GcSnapshot {
        GcSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSnapshot {
    pub sweeps: u64,
    pub evicted: u64,
}

/// Sweep `store` every `every` until `shutdown_rx` turns true.
pub async fn gc_sweep_task(
    store: CacheStore,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<GcMetrics> {
    let metrics = Arc::new(GcMetrics::default());
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_ms = every.as_millis() as u64, "Cache GC task started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache GC task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let evicted = store.sweep();
                metrics.sweeps.fetch_add(1, Ordering::Relaxed);
                if evicted > 0 {
                    metrics.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
                    tracing::debug!(evicted, remaining = store.entry_count(), "GC sweep evicted entries");
                } else {
                    tracing::trace!("GC sweep found nothing to evict");
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        evicted = snapshot.evicted,
        "Cache GC task completed"
    );
    metrics
}
