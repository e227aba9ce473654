//! Optimistic mutations with rollback.
//!
//! Each invocation walks `Idle -> Running -> (Succeeded | Failed) -> Settled`:
//!
//! 1. fetches for every affected key are cancelled,
//! 2. the entries to be edited are pinned and their prior state captured,
//! 3. the optimistic edits are written through, before the call returns,
//! 4. the operation is awaited,
//! 5. on failure the captured state is put back,
//! 6. settle marks every affected key stale and refetches the observed ones.
//!
//! Settle lives in a drop guard, so it runs exactly once even when the
//! caller abandons the returned future.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use cachet_core::{KeyFilter, MutationError, MutationStatus, QueryKey};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::entry::EntryBackup;
use crate::fetch::FetchCoordinator;
use crate::lock::lock_mutex;
use crate::store::{CacheStore, RefetchTrigger};

type OperationFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, String>> + Send + Sync>;
type KeyFn<I> = Arc<dyn Fn(&I) -> QueryKey + Send + Sync>;
type EditFn<I> = Arc<dyn Fn(&I, Option<&Value>) -> Result<Value, String> + Send + Sync>;
type SuccessFn<I, O> = Arc<dyn Fn(&O, &I) + Send + Sync>;
type ErrorFn<I> = Arc<dyn Fn(&MutationError, &I) + Send + Sync>;
type SettledFn<I, O> = Arc<dyn Fn(Result<&O, &MutationError>, &I) + Send + Sync>;

// ============================================================================
// ENGINE
// ============================================================================

/// Builds mutations against one cache.
#[derive(Clone)]
pub struct MutationEngine {
    store: CacheStore,
    coordinator: FetchCoordinator,
}

impl MutationEngine {
    pub fn new(coordinator: FetchCoordinator) -> Self {
        Self {
            store: coordinator.store().clone(),
            coordinator,
        }
    }

    /// Start defining a mutation around `operation`.
    pub fn mutation<I, O, F, Fut, E>(&self, operation: F) -> MutationBuilder<I, O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let operation: OperationFn<I, O> = Arc::new(move |input| {
            let pending = operation(input);
            async move { pending.await.map_err(|e| e.to_string()) }.boxed()
        });
        MutationBuilder {
            engine: self.clone(),
            definition: Definition {
                operation,
                edits: Vec::new(),
                invalidates: Vec::new(),
                on_success: Vec::new(),
                on_error: Vec::new(),
                on_settled: Vec::new(),
            },
        }
    }
}

struct OptimisticEdit<I> {
    key: KeyFn<I>,
    apply: EditFn<I>,
}

struct Definition<I, O> {
    operation: OperationFn<I, O>,
    edits: Vec<OptimisticEdit<I>>,
    invalidates: Vec<KeyFn<I>>,
    on_success: Vec<SuccessFn<I, O>>,
    on_error: Vec<ErrorFn<I>>,
    on_settled: Vec<SettledFn<I, O>>,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Declares the cache side of a mutation.
pub struct MutationBuilder<I, O> {
    engine: MutationEngine,
    definition: Definition<I, O>,
}

impl<I, O> MutationBuilder<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Edit the entry at `key(input)` before the operation resolves.
    ///
    /// `edit` receives the current value (absent when the entry has none)
    /// and its result is written to the cache. On failure the prior state
    /// is restored.
    pub fn optimistic<T, K, U>(mut self, key: K, edit: U) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
        K: Fn(&I) -> QueryKey + Send + Sync + 'static,
        U: Fn(&I, Option<T>) -> T + Send + Sync + 'static,
    {
        let apply: EditFn<I> = Arc::new(move |input: &I, current: Option<&Value>| {
            let current = current
                .map(|value| serde_json::from_value::<T>(value.clone()))
                .transpose()
                .map_err(|e| e.to_string())?;
            serde_json::to_value(edit(input, current)).map_err(|e| e.to_string())
        });
        self.definition.edits.push(OptimisticEdit {
            key: Arc::new(key),
            apply,
        });
        self
    }

    /// Mark every key under `prefix(input)` stale when the mutation settles.
    pub fn invalidates<K>(mut self, prefix: K) -> Self
    where
        K: Fn(&I) -> QueryKey + Send + Sync + 'static,
    {
        self.definition.invalidates.push(Arc::new(prefix));
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&O, &I) + Send + Sync + 'static) -> Self {
        self.definition.on_success.push(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&MutationError, &I) + Send + Sync + 'static) -> Self {
        self.definition.on_error.push(Arc::new(callback));
        self
    }

    pub fn on_settled(
        mut self,
        callback: impl Fn(Result<&O, &MutationError>, &I) + Send + Sync + 'static,
    ) -> Self {
        self.definition.on_settled.push(Arc::new(callback));
        self
    }

    pub fn build(self) -> Mutation<I, O> {
        Mutation {
            engine: self.engine,
            definition: Arc::new(self.definition),
            state: Arc::new(Mutex::new(MutationState::default())),
        }
    }
}

// ============================================================================
// CALL-SITE CALLBACKS
// ============================================================================

/// One-shot callbacks for a single invocation. They run after the ones
/// registered on the definition.
pub struct MutateCallbacks<I, O> {
    on_success: Option<Box<dyn FnOnce(&O, &I) + Send>>,
    on_error: Option<Box<dyn FnOnce(&MutationError, &I) + Send>>,
    on_settled: Option<Box<dyn FnOnce(Result<&O, &MutationError>, &I) + Send>>,
}

impl<I, O> Default for MutateCallbacks<I, O> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<I, O> MutateCallbacks<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, callback: impl FnOnce(&O, &I) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(&MutationError, &I) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn on_settled(
        mut self,
        callback: impl FnOnce(Result<&O, &MutationError>, &I) + Send + 'static,
    ) -> Self {
        self.on_settled = Some(Box::new(callback));
        self
    }
}

// ============================================================================
// MUTATION
// ============================================================================

#[derive(Debug, Default)]
struct MutationState {
    /// Bumped per invocation; only the latest one reports status.
    generation: u64,
    status: MutationStatus,
    last_error: Option<MutationError>,
}

/// A defined mutation. Cheap to clone; clones share their status.
pub struct Mutation<I, O> {
    engine: MutationEngine,
    definition: Arc<Definition<I, O>>,
    state: Arc<Mutex<MutationState>>,
}

impl<I, O> Clone for Mutation<I, O> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            definition: Arc::clone(&self.definition),
            state: Arc::clone(&self.state),
        }
    }
}

impl<I, O> fmt::Debug for Mutation<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_mutex(&self.state, "mutation.debug");
        f.debug_struct("Mutation")
            .field("status", &state.status)
            .field("edits", &self.definition.edits.len())
            .field("invalidates", &self.definition.invalidates.len())
            .finish()
    }
}

impl<I, O> Mutation<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Status of the most recent invocation.
    pub fn status(&self) -> MutationStatus {
        lock_mutex(&self.state, "mutation.status").status
    }

    pub fn is_idle(&self) -> bool {
        self.status() == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status() == MutationStatus::Running
    }

    pub fn is_success(&self) -> bool {
        let state = lock_mutex(&self.state, "mutation.is_success");
        matches!(state.status, MutationStatus::Succeeded | MutationStatus::Settled)
            && state.last_error.is_none()
    }

    pub fn is_error(&self) -> bool {
        lock_mutex(&self.state, "mutation.is_error").last_error.is_some()
    }

    pub fn last_error(&self) -> Option<MutationError> {
        lock_mutex(&self.state, "mutation.last_error").last_error.clone()
    }

    /// Forget the last invocation's outcome.
    pub fn reset(&self) {
        let mut state = lock_mutex(&self.state, "mutation.reset");
        state.generation += 1;
        state.status = MutationStatus::Idle;
        state.last_error = None;
    }

    /// Run the mutation. Optimistic edits are applied before this returns.
    pub fn mutate(&self, input: I) -> impl Future<Output = Result<O, MutationError>> + Send + 'static {
        self.mutate_with(input, MutateCallbacks::default())
    }

    /// [`mutate`](Self::mutate) with one-shot callbacks for this call.
    pub fn mutate_with(
        &self,
        input: I,
        callbacks: MutateCallbacks<I, O>,
    ) -> impl Future<Output = Result<O, MutationError>> + Send + 'static {
        let generation = self.begin();
        let engine = self.engine.clone();
        let definition = Arc::clone(&self.definition);
        let state = Arc::clone(&self.state);

        let edited: Vec<QueryKey> = definition.edits.iter().map(|e| (e.key)(&input)).collect();
        let mut stale: Vec<KeyFilter> = edited.iter().cloned().map(KeyFilter::exact).collect();
        stale.extend(definition.invalidates.iter().map(|f| KeyFilter::prefix(f(&input))));

        for filter in &stale {
            engine.coordinator.cancel(filter);
        }

        let mut guard = SettleGuard {
            backups: edited.iter().map(|key| engine.store.hold(key)).collect(),
            engine,
            stale,
            settled: false,
        };
        let edit_error = guard.apply_edits(&definition, &edited, &input);
        let edit_failed = edit_error.is_some();
        if let Some(error) = &edit_error {
            debug!(error = %error, "Optimistic edit failed, rolling back");
            guard.rollback();
            transition(&state, generation, MutationStatus::Failed, Some(error.clone()));
        }

        async move {
            let result = match edit_error {
                Some(error) => Err(error),
                None => (definition.operation)(input.clone())
                    .await
                    .map_err(|reason| MutationError::Failed { reason }),
            };

            match &result {
                Ok(output) => {
                    transition(&state, generation, MutationStatus::Succeeded, None);
                    for callback in &definition.on_success {
                        callback(output, &input);
                    }
                    if let Some(callback) = callbacks.on_success {
                        callback(output, &input);
                    }
                }
                Err(error) => {
                    if !edit_failed {
                        debug!(error = %error, "Mutation failed, rolling back");
                        guard.rollback();
                        transition(&state, generation, MutationStatus::Failed, Some(error.clone()));
                    }
                    for callback in &definition.on_error {
                        callback(error, &input);
                    }
                    if let Some(callback) = callbacks.on_error {
                        callback(error, &input);
                    }
                }
            }

            guard.settle();
            transition(&state, generation, MutationStatus::Settled, None);
            for callback in &definition.on_settled {
                callback(result.as_ref(), &input);
            }
            if let Some(callback) = callbacks.on_settled {
                callback(result.as_ref(), &input);
            }
            result
        }
    }

    fn begin(&self) -> u64 {
        let mut state = lock_mutex(&self.state, "mutation.begin");
        state.generation += 1;
        state.status = MutationStatus::Running;
        state.last_error = None;
        trace!(generation = state.generation, "Mutation started");
        state.generation
    }
}

fn transition(
    state: &Mutex<MutationState>,
    generation: u64,
    next: MutationStatus,
    error: Option<MutationError>,
) {
    let mut state = lock_mutex(state, "mutation.transition");
    if state.generation != generation {
        return;
    }
    if !state.status.can_transition_to(next) {
        warn!(from = ?state.status, to = ?next, "Unexpected mutation transition");
    }
    state.status = next;
    if error.is_some() {
        state.last_error = error;
    }
}

// ============================================================================
// SETTLE GUARD
// ============================================================================

struct SettleGuard {
    engine: MutationEngine,
    backups: Vec<EntryBackup>,
    stale: Vec<KeyFilter>,
    settled: bool,
}

impl SettleGuard {
    /// Write every optimistic edit, stopping at the first one that cannot be
    /// applied. Edits already written stay until [`rollback`](Self::rollback).
    fn apply_edits<I, O>(
        &self,
        definition: &Definition<I, O>,
        edited: &[QueryKey],
        input: &I,
    ) -> Option<MutationError> {
        for (edit, key) in definition.edits.iter().zip(edited) {
            let applied = self
                .engine
                .store
                .try_patch(key, |current| (edit.apply)(input, current));
            match applied {
                Ok(_) => trace!(key = %key, "Optimistic edit applied"),
                Err(reason) => {
                    return Some(MutationError::Decode {
                        key: key.canonical().to_string(),
                        reason,
                    })
                }
            }
        }
        None
    }

    fn rollback(&self) {
        for backup in self.backups.iter().rev() {
            if self.engine.store.restore(backup) {
                debug!(key = %backup.key, "Optimistic edit rolled back");
            } else {
                warn!(key = %backup.key, "Rollback skipped: entry was removed or recreated");
            }
        }
    }

    fn settle(&mut self) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        for filter in &self.stale {
            self.engine.store.mark_stale(filter);
        }
        if Handle::try_current().is_ok() {
            for filter in &self.stale {
                drop(
                    self.engine
                        .coordinator
                        .refetch_observed(filter, RefetchTrigger::Invalidated),
                );
            }
        }
        for backup in &self.backups {
            self.engine.store.release(backup);
        }
        trace!(keys = self.stale.len(), "Mutation settled");
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.settle();
    }
}
