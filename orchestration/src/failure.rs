//! Failure tracking — per-issue attempt history and the action policy.
//!
//! The tracker owns the retry/skip/pause decision for every session result
//! and the orthogonal model-escalation rule: repeated failures on the same
//! issue route later attempts to more capable model tiers without changing
//! the action decision itself.

use crate::routing::{ModelNames, ModelTier};
use crate::runner::{SessionOutcome, SessionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What the scheduler should do with an issue after a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Retry,
    Skip,
    Pause,
    Escalate,
}

impl std::fmt::Display for FailureAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Pause => write!(f, "pause"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

/// Failure classification used by the action policy. Timeouts arrive as
/// `failure` results whose error says so; the policy treats them separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Failure,
    Partial,
    ContextOverflow,
    Timeout,
}

impl FailureKind {
    pub fn of(result: &SessionResult) -> Option<Self> {
        match result.outcome {
            SessionOutcome::Success => None,
            SessionOutcome::Partial => Some(Self::Partial),
            SessionOutcome::ContextOverflow => Some(Self::ContextOverflow),
            SessionOutcome::Failure => {
                let timed_out = result
                    .error
                    .as_deref()
                    .map(|e| e.to_ascii_lowercase().contains("timed out"))
                    .unwrap_or(false);
                Some(if timed_out { Self::Timeout } else { Self::Failure })
            }
        }
    }
}

/// Per-kind action mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeActions {
    pub on_failure: FailureAction,
    pub on_partial: FailureAction,
    pub on_context_overflow: FailureAction,
    pub on_timeout: FailureAction,
}

impl Default for OutcomeActions {
    fn default() -> Self {
        Self {
            on_failure: FailureAction::Retry,
            on_partial: FailureAction::Skip,
            on_context_overflow: FailureAction::Skip,
            on_timeout: FailureAction::Retry,
        }
    }
}

impl OutcomeActions {
    fn action_for(&self, kind: FailureKind) -> FailureAction {
        match kind {
            FailureKind::Failure => self.on_failure,
            FailureKind::Partial => self.on_partial,
            FailureKind::ContextOverflow => self.on_context_overflow,
            FailureKind::Timeout => self.on_timeout,
        }
    }
}

/// Failure-handling policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub continue_on_failure: bool,
    pub max_consecutive_failures: u32,
    pub annotate_failures: bool,
    pub actions: OutcomeActions,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 5_000,
            continue_on_failure: true,
            max_consecutive_failures: 3,
            annotate_failures: true,
            actions: OutcomeActions::default(),
        }
    }
}

/// One recorded attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureAttempt {
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: SessionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Attempt history for one issue within a run. Created on the first
/// non-success; kept for the life of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub issue_id: String,
    pub attempts: Vec<FailureAttempt>,
    pub last_outcome: SessionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_action: Option<FailureAction>,
}

impl FailureRecord {
    fn new(issue_id: &str, outcome: SessionOutcome) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            attempts: Vec::new(),
            last_outcome: outcome,
            final_action: None,
        }
    }

    fn push_attempt(&mut self, result: &SessionResult) {
        self.attempts.push(FailureAttempt {
            attempt_number: self.attempts.len() as u32 + 1,
            timestamp: Utc::now(),
            outcome: result.outcome,
            error: result.error.clone(),
            duration_ms: result.duration_ms,
            model: result.model.clone(),
        });
        self.last_outcome = result.outcome;
    }

    /// Failed attempts routed to `tier`, per the configured model names.
    fn failures_at(&self, tier: ModelTier, models: &ModelNames) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.outcome != SessionOutcome::Success)
            .filter(|a| {
                a.model
                    .as_deref()
                    .and_then(|m| models.tier_of(m))
                    .map(|t| t == tier)
                    .unwrap_or(false)
            })
            .count() as u32
    }
}

/// The tracker's verdict on one session result.
#[derive(Debug, Clone)]
pub struct FailureDecision {
    pub action: FailureAction,
    pub reason: String,
    pub should_continue: bool,
    /// Delay before the retry, when the action is retry.
    pub retry_after_ms: Option<u64>,
    /// The scheduler should write a checkpoint before moving on.
    pub checkpoint_requested: bool,
}

/// Aggregate failure statistics for a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FailureStats {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_retries: u64,
    pub successful_retries: u64,
}

/// Per-run failure bookkeeping and action policy.
pub struct FailureTracker {
    policy: FailurePolicy,
    records: HashMap<String, FailureRecord>,
    stats: FailureStats,
}

impl FailureTracker {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            stats: FailureStats::default(),
        }
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    pub fn stats(&self) -> FailureStats {
        self.stats
    }

    pub fn record(&self, issue_id: &str) -> Option<&FailureRecord> {
        self.records.get(issue_id)
    }

    /// Number of session results recorded for an issue.
    pub fn attempts(&self, issue_id: &str) -> u32 {
        self.records
            .get(issue_id)
            .map(|r| r.attempts.len() as u32)
            .unwrap_or(0)
    }

    /// Apply the action policy to a finished session.
    pub fn decide(&mut self, result: &SessionResult) -> FailureDecision {
        if result.outcome == SessionOutcome::Success {
            self.stats.consecutive_failures = 0;
            if let Some(record) = self.records.get_mut(&result.issue_id) {
                // A success after recorded failures is a successful retry.
                record.push_attempt(result);
                record.final_action = None;
                self.stats.successful_retries += 1;
                info!(issue = %result.issue_id, attempts = record.attempts.len(), "retry succeeded");
            }
            return FailureDecision {
                action: FailureAction::Skip,
                reason: "success".to_string(),
                should_continue: true,
                retry_after_ms: None,
                checkpoint_requested: false,
            };
        }

        self.stats.consecutive_failures += 1;
        self.stats.total_failures += 1;

        let record = self
            .records
            .entry(result.issue_id.clone())
            .or_insert_with(|| FailureRecord::new(&result.issue_id, result.outcome));
        record.push_attempt(result);
        let attempts = record.attempts.len() as u32;

        if self.stats.consecutive_failures >= self.policy.max_consecutive_failures {
            record.final_action = Some(FailureAction::Pause);
            let reason = format!(
                "{} consecutive failures",
                self.stats.consecutive_failures
            );
            warn!(issue = %result.issue_id, %reason, "pausing run");
            return FailureDecision {
                action: FailureAction::Pause,
                reason,
                should_continue: false,
                retry_after_ms: None,
                checkpoint_requested: true,
            };
        }

        let kind = FailureKind::of(result).unwrap_or(FailureKind::Failure);
        let mut action = self.policy.actions.action_for(kind);
        let mut checkpoint_requested = false;
        let mut reason = format!("{} -> {action}", result.outcome);

        // The first attempt is not a retry; the budget covers re-runs only.
        if action == FailureAction::Retry && attempts > self.policy.max_retries {
            action = FailureAction::Skip;
            checkpoint_requested = true;
            reason = format!("retry budget exhausted after {attempts} attempts");
            debug!(issue = %result.issue_id, attempts, "downgrading retry to skip");
        }

        if action == FailureAction::Retry {
            self.stats.total_retries += 1;
        }
        record.final_action = Some(action);

        let should_continue = match action {
            FailureAction::Pause => false,
            FailureAction::Retry | FailureAction::Escalate => true,
            FailureAction::Skip => self.policy.continue_on_failure,
        };

        FailureDecision {
            action,
            reason,
            should_continue,
            retry_after_ms: (action == FailureAction::Retry)
                .then_some(self.policy.retry_delay_ms),
            checkpoint_requested,
        }
    }

    /// Model tier for the next attempt at this issue.
    ///
    /// A pure function of the record and the heuristically chosen base tier:
    /// one failure at Low routes to Mid, two failures at Mid route to High,
    /// and failures at both Low and Mid route straight to High. Never
    /// downgrades below the base.
    pub fn escalated_tier(
        &self,
        issue_id: &str,
        base: ModelTier,
        models: &ModelNames,
    ) -> (ModelTier, bool) {
        let Some(record) = self.records.get(issue_id) else {
            return (base, false);
        };
        let low_failures = record.failures_at(ModelTier::Low, models);
        let mid_failures = record.failures_at(ModelTier::Mid, models);

        let escalated = if low_failures >= 1 && mid_failures >= 1 {
            ModelTier::High
        } else if mid_failures >= 2 {
            ModelTier::High
        } else if low_failures >= 1 {
            ModelTier::Mid
        } else {
            base
        };

        let tier = escalated.max(base);
        (tier, tier > base)
    }
}

/// Annotation written to an issue when a post-escalation attempt succeeds,
/// carrying the title keywords for later routing-rule tuning.
pub fn escalation_note(model: &str, keywords: &[String]) -> String {
    format!(
        "Model escalation succeeded with `{model}`. Pattern keywords: {}. Consider adding a routing rule for similar tasks.",
        if keywords.is_empty() {
            "(none)".to_string()
        } else {
            keywords.join(", ")
        }
    )
}
