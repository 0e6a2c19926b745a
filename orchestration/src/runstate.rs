//! Run state — the scheduler-owned record of one end-to-end run.
//!
//! A run is identified by its run-epic issue id. The state is mirrored into
//! the epic record as a fenced JSON block on every transition, because the
//! harness has no database of its own; `resume` reads it back and reconciles
//! against the store.

use crate::checkpoint::CheckpointPolicy;
use crate::error::{HarnessError, HarnessResult};
use crate::store::{AdapterResult, IssueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }
}

/// State of one run, owned exclusively by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// The run-epic issue id.
    pub id: String,
    pub status: RunStatus,
    /// Title of the spec this run executes.
    pub spec_title: String,
    /// Dedicated working-tree branch.
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub current_session: u32,
    pub sessions_completed: u32,
    pub features_total: u32,
    pub features_completed: u32,
    pub features_failed: u32,
    /// Sequence number of the last checkpoint (0 = none yet).
    pub last_checkpoint: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub checkpoint_policy: CheckpointPolicy,
    /// Non-empty exactly when status is paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub total_cost_usd: f64,
    /// Agent session id to continue from, when the agent supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
}

impl RunState {
    pub fn new(
        id: impl Into<String>,
        spec_title: impl Into<String>,
        branch: impl Into<String>,
        features_total: u32,
        checkpoint_policy: CheckpointPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            status: RunStatus::Initializing,
            spec_title: spec_title.into(),
            branch: branch.into(),
            started_at: Utc::now(),
            current_session: 0,
            sessions_completed: 0,
            features_total,
            features_completed: 0,
            features_failed: 0,
            last_checkpoint: 0,
            last_checkpoint_at: None,
            checkpoint_policy,
            pause_reason: None,
            failure_reason: None,
            total_cost_usd: 0.0,
            last_session_id: None,
        }
    }

    fn transition(&mut self, next: RunStatus) -> HarnessResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(HarnessError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        info!(run = %self.id, from = %self.status, to = %next, "run status change");
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> HarnessResult<()> {
        self.transition(RunStatus::Running)?;
        self.pause_reason = None;
        Ok(())
    }

    pub fn pause(&mut self, reason: impl Into<String>) -> HarnessResult<()> {
        self.transition(RunStatus::Paused)?;
        let reason = reason.into();
        self.pause_reason = Some(if reason.is_empty() {
            "paused".to_string()
        } else {
            reason
        });
        Ok(())
    }

    pub fn resume(&mut self) -> HarnessResult<()> {
        self.transition(RunStatus::Running)?;
        self.pause_reason = None;
        Ok(())
    }

    pub fn complete(&mut self) -> HarnessResult<()> {
        self.transition(RunStatus::Completed)?;
        self.pause_reason = None;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> HarnessResult<()> {
        self.transition(RunStatus::Failed)?;
        self.pause_reason = None;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    fn check_mutable(&self) -> HarnessResult<()> {
        if self.status.is_terminal() {
            return Err(HarnessError::run(format!(
                "run {} is {}; counters are frozen",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Begin the next session, returning its number.
    pub fn begin_session(&mut self) -> HarnessResult<u32> {
        self.check_mutable()?;
        self.current_session += 1;
        Ok(self.current_session)
    }

    pub fn session_completed(&mut self) -> HarnessResult<()> {
        self.check_mutable()?;
        self.sessions_completed += 1;
        Ok(())
    }

    pub fn feature_completed(&mut self) -> HarnessResult<()> {
        self.check_mutable()?;
        if self.features_completed + self.features_failed >= self.features_total {
            return Err(HarnessError::run(format!(
                "feature counters would exceed total ({})",
                self.features_total
            )));
        }
        self.features_completed += 1;
        Ok(())
    }

    pub fn feature_failed(&mut self) -> HarnessResult<()> {
        self.check_mutable()?;
        if self.features_completed + self.features_failed >= self.features_total {
            return Err(HarnessError::run(format!(
                "feature counters would exceed total ({})",
                self.features_total
            )));
        }
        self.features_failed += 1;
        Ok(())
    }

    pub fn checkpoint_written(&mut self, sequence: u32) {
        self.last_checkpoint = sequence;
        self.last_checkpoint_at = Some(Utc::now());
    }

    pub fn add_cost(&mut self, cost: Option<f64>) {
        if let Some(cost) = cost {
            self.total_cost_usd += cost;
        }
    }

    /// Fenced-JSON mirror appended to the run epic.
    pub fn render_mirror(&self) -> String {
        format!(
            "### Run state — {}\n\n```json\n{}\n```\n",
            Utc::now().to_rfc3339(),
            serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string()),
        )
    }

    /// Parse the most recent mirror out of an epic description.
    pub fn parse_mirror(description: &str) -> Option<RunState> {
        let start = description.rfind("```json\n")? + "```json\n".len();
        let end = description[start..].find("\n```")? + start;
        serde_json::from_str(&description[start..end]).ok()
    }

    /// Append the current state to the run epic record.
    pub fn mirror_to_store(&self, store: &dyn IssueStore) -> AdapterResult<()> {
        store.annotate(&self.id, &self.render_mirror())
    }
}
