//! Redirect detection — noticing human-initiated changes to the issue store.
//!
//! Between scheduler iterations the store is re-snapshotted and diffed
//! against the previous snapshot. Only `(status, priority, updated_at)` per
//! id is kept, so the diff stays cheap on large stores.

use crate::store::{AdapterResult, IssueStatus, IssueStore, Priority, PAUSE_LABEL};
use crate::store::run_label;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Kind of redirect, most urgent first. The derived ordering is the
/// scheduler's urgency ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    /// An advisory pause marker attached to this run.
    PauseRequested,
    /// A new issue appeared at priority 0.
    NewUrgent,
    /// An existing issue was bumped to priority 0.
    PriorityChange,
    /// An existing issue was closed externally.
    IssueClosed,
}

impl RedirectKind {
    /// The scheduler must react before scheduling more work.
    pub fn requires_immediate_action(&self) -> bool {
        matches!(self, Self::PauseRequested | Self::NewUrgent)
    }
}

impl std::fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PauseRequested => write!(f, "pause_requested"),
            Self::NewUrgent => write!(f, "new_urgent"),
            Self::PriorityChange => write!(f, "priority_change"),
            Self::IssueClosed => write!(f, "issue_closed"),
        }
    }
}

/// One observed change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub issue_id: String,
    pub title: String,
    pub detected_at: DateTime<Utc>,
}

impl Redirect {
    /// Human-readable note for checkpoints and prompts.
    pub fn note(&self) -> String {
        match self.kind {
            RedirectKind::PauseRequested => {
                format!("pause requested via {} ({})", self.issue_id, self.title)
            }
            RedirectKind::NewUrgent => {
                format!("new urgent issue {} ({})", self.issue_id, self.title)
            }
            RedirectKind::PriorityChange => {
                format!("{} raised to priority 0 ({})", self.issue_id, self.title)
            }
            RedirectKind::IssueClosed => {
                format!("{} closed externally ({})", self.issue_id, self.title)
            }
        }
    }
}

/// Minimal per-issue state kept between snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub status: IssueStatus,
    pub priority: Priority,
    pub updated_at: DateTime<Utc>,
}

/// A point-in-time view of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub taken_at: DateTime<Utc>,
    pub entries: HashMap<String, SnapshotEntry>,
}

/// Diffs successive store snapshots into redirects.
pub struct RedirectDetector {
    run_id: String,
    previous: Option<IssueSnapshot>,
}

impl RedirectDetector {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            previous: None,
        }
    }

    /// Whether a baseline snapshot exists yet.
    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }

    /// Re-snapshot the store and diff against the previous snapshot.
    ///
    /// The first call establishes the baseline and reports nothing. Results
    /// are sorted by urgency, ties by issue id.
    pub fn observe(&mut self, store: &dyn IssueStore) -> AdapterResult<Vec<Redirect>> {
        let issues = store.list_all()?;
        let run_tag = run_label(&self.run_id);
        let now = Utc::now();

        let snapshot = IssueSnapshot {
            taken_at: now,
            entries: issues
                .iter()
                .map(|i| {
                    (
                        i.id.clone(),
                        SnapshotEntry {
                            status: i.status,
                            priority: i.priority,
                            updated_at: i.updated_at,
                        },
                    )
                })
                .collect(),
        };

        let Some(previous) = self.previous.replace(snapshot) else {
            return Ok(Vec::new());
        };

        let mut redirects = Vec::new();
        for issue in &issues {
            let is_pause_marker = issue.is_open()
                && issue.has_label(PAUSE_LABEL)
                && issue.has_label(&run_tag);

            match previous.entries.get(&issue.id) {
                None => {
                    if is_pause_marker {
                        redirects.push(Redirect {
                            kind: RedirectKind::PauseRequested,
                            issue_id: issue.id.clone(),
                            title: issue.title.clone(),
                            detected_at: now,
                        });
                    } else if issue.priority.is_urgent() && issue.is_open() {
                        redirects.push(Redirect {
                            kind: RedirectKind::NewUrgent,
                            issue_id: issue.id.clone(),
                            title: issue.title.clone(),
                            detected_at: now,
                        });
                    }
                }
                Some(seen) => {
                    if seen.updated_at == issue.updated_at {
                        continue;
                    }
                    if is_pause_marker {
                        redirects.push(Redirect {
                            kind: RedirectKind::PauseRequested,
                            issue_id: issue.id.clone(),
                            title: issue.title.clone(),
                            detected_at: now,
                        });
                    } else if issue.priority.is_urgent() && !seen.priority.is_urgent() {
                        redirects.push(Redirect {
                            kind: RedirectKind::PriorityChange,
                            issue_id: issue.id.clone(),
                            title: issue.title.clone(),
                            detected_at: now,
                        });
                    } else if issue.status == IssueStatus::Closed
                        && seen.status != IssueStatus::Closed
                    {
                        redirects.push(Redirect {
                            kind: RedirectKind::IssueClosed,
                            issue_id: issue.id.clone(),
                            title: issue.title.clone(),
                            detected_at: now,
                        });
                    }
                }
            }
        }

        redirects.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.issue_id.cmp(&b.issue_id)));
        if !redirects.is_empty() {
            info!(
                run = %self.run_id,
                count = redirects.len(),
                most_urgent = %redirects[0].kind,
                "redirects detected"
            );
        }
        Ok(redirects)
    }
}
