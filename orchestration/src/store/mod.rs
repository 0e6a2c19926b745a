//! Issue store — the harness's view of the external tracker.
//!
//! One trait, three backends: the tracker CLI bridge, a line-delimited JSON
//! fallback file, and an in-memory store for dry runs and tests. Writes made
//! through an adapter are visible to the next read in the same process.

mod cli;
mod jsonl;
mod memory;
mod types;

pub use cli::TrackerCli;
pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use types::{
    Dependency, DependencyKind, Issue, IssueStatus, IssueType, NewIssue, Priority,
};

use std::collections::HashSet;
use thiserror::Error;

/// Label marking the run epic and all records belonging to a run:
/// `foreman:run:<epic-id>`.
pub const RUN_LABEL_PREFIX: &str = "foreman:run:";
/// Label on checkpoint records.
pub const CHECKPOINT_LABEL: &str = "foreman:checkpoint";
/// Label on review records.
pub const REVIEW_LABEL: &str = "foreman:review";
/// Advisory pause marker label.
pub const PAUSE_LABEL: &str = "foreman:pause";
/// Label on issues the harness gave up on for this run.
pub const SKIPPED_LABEL: &str = "foreman:skipped";
/// Label on gate-failure blocker issues.
pub const BLOCKER_LABEL: &str = "foreman:blocker";

/// Run tag label for a given run id.
pub fn run_label(run_id: &str) -> String {
    format!("{RUN_LABEL_PREFIX}{run_id}")
}

/// How an adapter failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterErrorKind {
    /// The record does not exist.
    NotFound,
    /// Worth retrying (lock contention, timeouts, busy tracker).
    Transient,
    /// Retrying will not help.
    Permanent,
}

/// Failure surfaced by any store backend.
#[derive(Debug, Clone, Error)]
#[error("issue store error ({kind:?}): {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == AdapterErrorKind::Transient
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Synchronous, fallible interface over the external tracker.
///
/// Backends shell out or touch the filesystem; callers wrap invocations in a
/// circuit breaker when the backend is unreliable.
pub trait IssueStore: Send + Sync {
    /// Every issue the tracker knows about. Must reflect writes made through
    /// this adapter no later than the next call.
    fn list_all(&self) -> AdapterResult<Vec<Issue>>;

    /// Create an issue; returns its id. An empty description is rejected to
    /// match tracker semantics.
    fn create(&self, new: NewIssue) -> AdapterResult<String>;

    fn update_status(&self, id: &str, status: IssueStatus) -> AdapterResult<()>;

    fn update_priority(&self, id: &str, priority: Priority) -> AdapterResult<()>;

    fn add_dependency(&self, from: &str, to: &str, kind: DependencyKind) -> AdapterResult<()>;

    fn add_label(&self, id: &str, label: &str) -> AdapterResult<()>;

    fn remove_label(&self, id: &str, label: &str) -> AdapterResult<()>;

    /// Append a markdown note to the issue.
    fn annotate(&self, id: &str, markdown: &str) -> AdapterResult<()>;

    /// Open issues whose `blocks` predecessors are all closed.
    fn list_ready(&self) -> AdapterResult<Vec<Issue>> {
        let all = self.list_all()?;
        let closed: HashSet<&str> = all
            .iter()
            .filter(|i| i.status == IssueStatus::Closed)
            .map(|i| i.id.as_str())
            .collect();
        Ok(all
            .iter()
            .filter(|i| {
                i.status == IssueStatus::Open
                    && i.blocking_ids().all(|dep| closed.contains(dep))
            })
            .cloned()
            .collect())
    }

    /// Fetch one issue by id.
    fn get(&self, id: &str) -> AdapterResult<Issue> {
        self.list_all()?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| AdapterError::not_found(format!("issue {id} not found")))
    }
}
