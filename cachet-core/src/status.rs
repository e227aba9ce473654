//! Status axes for cache entries and mutations.

use serde::{Deserialize, Serialize};

/// Whether an entry holds data.
///
/// Independent of [`FetchStatus`]: `Success` + `Fetching` is a background
/// refetch, `Pending` + `Paused` is a first load waiting for connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Never successfully fetched.
    #[default]
    Pending,
    Success,
    Error,
}

/// Whether the fetch function is currently running for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
    /// A fetch is wanted but deferred until connectivity returns.
    Paused,
}

/// Lifecycle of a single mutation invocation.
///
/// `Idle -> Running -> (Succeeded | Failed) -> Settled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Settled,
}

impl MutationStatus {
    /// Legal forward transitions of the state machine.
    pub fn can_transition_to(self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Settled)
                | (Failed, Settled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MutationStatus::Settled)
    }
}
