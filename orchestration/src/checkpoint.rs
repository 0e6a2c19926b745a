//! Checkpoint engine — trigger policy, confidence score, snapshot records.
//!
//! Checkpoints are the human audit surface: each one is persisted as its own
//! linked record in the issue store, tagged with the run id and numbered
//! sequentially. The description embeds a fenced JSON payload so a
//! checkpoint read back from the store reproduces the original exactly,
//! including the resume fields (last session id, accumulated cost).

use crate::review::ReviewAggregation;
use crate::runner::{SessionOutcome, SessionResult};
use crate::store::{
    run_label, AdapterResult, DependencyKind, IssueStore, IssueType, NewIssue, Priority,
    CHECKPOINT_LABEL,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// When the engine decides a checkpoint is due.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    pub after_sessions: u32,
    pub after_hours: f64,
    pub on_error: bool,
    /// Pause the run when confidence drops below this.
    pub on_confidence_below: f64,
    pub on_redirect: bool,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            after_sessions: 3,
            after_hours: 2.0,
            on_error: false,
            on_confidence_below: 0.4,
            on_redirect: true,
        }
    }
}

/// Why a checkpoint fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTrigger {
    AfterSessions,
    AfterHours,
    OnError,
    OnRedirect,
}

/// Per-agent status inside a swarm batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub issue_id: String,
    pub status: SwarmAgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmAgentState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Swarm-batch extras carried by a swarm checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmProgress {
    pub agents: Vec<AgentStatus>,
    /// successes / (successes + failures) over the batch.
    pub parallelism_efficiency: f64,
}

impl SwarmProgress {
    pub fn from_agents(agents: Vec<AgentStatus>) -> Self {
        let successes = agents
            .iter()
            .filter(|a| matches!(a.outcome, Some(SessionOutcome::Success)))
            .count();
        let failures = agents
            .iter()
            .filter(|a| {
                matches!(
                    a.outcome,
                    Some(SessionOutcome::Failure)
                        | Some(SessionOutcome::Partial)
                        | Some(SessionOutcome::ContextOverflow)
                )
            })
            .count();
        let denominator = successes + failures;
        let parallelism_efficiency = if denominator == 0 {
            0.0
        } else {
            successes as f64 / denominator as f64
        };
        Self {
            agents,
            parallelism_efficiency,
        }
    }
}

/// Resume payload serialised inside the checkpoint record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
}

/// A persisted progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub session_number: u32,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub issues_completed: Vec<String>,
    pub issues_in_progress: Vec<String>,
    pub issues_failed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    /// Rolling confidence in [0, 1], rounded to two decimals.
    pub confidence: f64,
    #[serde(default)]
    pub redirect_notes: Vec<String>,
    #[serde(default)]
    pub resume: ResumeInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewAggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm: Option<SwarmProgress>,
}

impl Checkpoint {
    pub fn with_review(mut self, review: ReviewAggregation) -> Self {
        self.review = Some(review);
        self
    }

    pub fn with_swarm(mut self, swarm: SwarmProgress) -> Self {
        self.swarm = Some(swarm);
        self
    }

    /// Markdown description for the store record, embedding the payload.
    pub fn render_description(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "## Checkpoint {} — run {}\n\n{}\n\n",
            self.session_number, self.run_id, self.summary
        ));
        out.push_str(&format!("- Confidence: {:.2}\n", self.confidence));
        out.push_str(&format!(
            "- Completed: {}\n",
            join_or_dash(&self.issues_completed)
        ));
        out.push_str(&format!(
            "- In progress: {}\n",
            join_or_dash(&self.issues_in_progress)
        ));
        out.push_str(&format!("- Failed: {}\n", join_or_dash(&self.issues_failed)));
        if let Some(commit) = &self.git_commit {
            out.push_str(&format!("- Commit: {commit}\n"));
        }
        if !self.redirect_notes.is_empty() {
            out.push_str("\nRedirects:\n");
            for note in &self.redirect_notes {
                out.push_str(&format!("- {note}\n"));
            }
        }
        out.push_str("\n```json\n");
        out.push_str(
            &serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string()),
        );
        out.push_str("\n```\n");
        out
    }

    /// Parse a checkpoint back out of a store record description.
    pub fn parse_description(description: &str) -> Option<Checkpoint> {
        let start = description.find("```json\n")? + "```json\n".len();
        let end = description[start..].find("\n```")? + start;
        serde_json::from_str(&description[start..end]).ok()
    }
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "—".to_string()
    } else {
        items.join(", ")
    }
}

/// Rolling buffer of session results plus the trigger policy.
pub struct CheckpointEngine {
    policy: CheckpointPolicy,
    buffer: Vec<SessionResult>,
    last_checkpoint_at: DateTime<Utc>,
    sequence: u32,
    last_confidence: f64,
}

impl CheckpointEngine {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            buffer: Vec::new(),
            last_checkpoint_at: Utc::now(),
            sequence: 0,
            last_confidence: 1.0,
        }
    }

    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }

    /// Resume at a given sequence number (loaded from the last checkpoint).
    pub fn resume_at(mut self, sequence: u32, confidence: f64) -> Self {
        self.sequence = sequence;
        self.last_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn record(&mut self, result: SessionResult) {
        self.buffer.push(result);
    }

    pub fn sessions_since_checkpoint(&self) -> usize {
        self.buffer.len()
    }

    /// Confidence over the buffered window:
    /// `(successes + 0.5·partials) / n`, minus `0.15` per failure among the
    /// last three results, clamped to [0, 1]. An empty window keeps the last
    /// computed value so a forced checkpoint does not fabricate a zero.
    pub fn confidence(&self) -> f64 {
        if self.buffer.is_empty() {
            return self.last_confidence;
        }
        let n = self.buffer.len() as f64;
        let successes = self
            .buffer
            .iter()
            .filter(|r| r.outcome == SessionOutcome::Success)
            .count() as f64;
        let partials = self
            .buffer
            .iter()
            .filter(|r| r.outcome == SessionOutcome::Partial)
            .count() as f64;
        let score = (successes + 0.5 * partials) / n;

        let recent_failures = self
            .buffer
            .iter()
            .rev()
            .take(3)
            .filter(|r| {
                matches!(
                    r.outcome,
                    SessionOutcome::Failure | SessionOutcome::ContextOverflow
                )
            })
            .count() as f64;
        (score - 0.15 * recent_failures).clamp(0.0, 1.0)
    }

    /// Confidence has fallen below the pause threshold.
    pub fn confidence_low(&self) -> bool {
        self.confidence() < self.policy.on_confidence_below
    }

    /// Whether a checkpoint is due. Never fires on an empty window; the
    /// pause-preserving final checkpoint is forced by the scheduler instead.
    pub fn should_checkpoint(&self, redirect_detected: bool) -> Option<CheckpointTrigger> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.buffer.len() as u32 >= self.policy.after_sessions {
            return Some(CheckpointTrigger::AfterSessions);
        }
        let hours_elapsed =
            (Utc::now() - self.last_checkpoint_at).num_seconds() as f64 / 3600.0;
        if hours_elapsed >= self.policy.after_hours {
            return Some(CheckpointTrigger::AfterHours);
        }
        if self.policy.on_error
            && self
                .buffer
                .last()
                .map(|r| r.outcome == SessionOutcome::Failure)
                .unwrap_or(false)
        {
            return Some(CheckpointTrigger::OnError);
        }
        if self.policy.on_redirect && redirect_detected {
            return Some(CheckpointTrigger::OnRedirect);
        }
        None
    }

    /// Build the next checkpoint from the buffered window and reset it.
    pub fn build(
        &mut self,
        run_id: &str,
        issues_in_progress: Vec<String>,
        git_commit: Option<String>,
        redirect_notes: Vec<String>,
        resume: ResumeInfo,
    ) -> Checkpoint {
        let confidence = (self.confidence() * 100.0).round() / 100.0;
        self.sequence += 1;

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for result in &self.buffer {
            let bucket = match result.outcome {
                SessionOutcome::Success => &mut completed,
                _ => &mut failed,
            };
            if !bucket.contains(&result.issue_id) {
                bucket.push(result.issue_id.clone());
            }
        }
        // An issue that eventually succeeded is not failed.
        failed.retain(|id| !completed.contains(id));

        let successes = self
            .buffer
            .iter()
            .filter(|r| r.outcome == SessionOutcome::Success)
            .count();
        let summary = format!(
            "{} session(s) since the last checkpoint: {} succeeded, {} other outcomes.",
            self.buffer.len(),
            successes,
            self.buffer.len() - successes,
        );

        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            session_number: self.sequence,
            timestamp: Utc::now(),
            summary,
            issues_completed: completed,
            issues_in_progress,
            issues_failed: failed,
            git_commit,
            confidence,
            redirect_notes,
            resume,
            review: None,
            swarm: None,
        };

        self.buffer.clear();
        self.last_checkpoint_at = Utc::now();
        self.last_confidence = confidence;
        debug!(run = run_id, number = checkpoint.session_number, confidence, "checkpoint built");
        checkpoint
    }
}

/// Persist a checkpoint as a linked store record; returns the record id.
pub fn persist_checkpoint(
    store: &dyn IssueStore,
    checkpoint: &Checkpoint,
) -> AdapterResult<String> {
    let record_id = store.create(
        NewIssue::new(format!(
            "Checkpoint {} — run {}",
            checkpoint.session_number, checkpoint.run_id
        ))
        .with_type(IssueType::Chore)
        .with_priority(Priority::LOWEST)
        .with_label(CHECKPOINT_LABEL)
        .with_label(run_label(&checkpoint.run_id))
        .with_description(checkpoint.render_description()),
    )?;
    store.add_dependency(&record_id, &checkpoint.run_id, DependencyKind::ParentChild)?;
    info!(
        run = %checkpoint.run_id,
        record = %record_id,
        number = checkpoint.session_number,
        confidence = checkpoint.confidence,
        "checkpoint persisted"
    );
    Ok(record_id)
}

/// Latest checkpoint for a run, if any.
pub fn load_latest_checkpoint(
    store: &dyn IssueStore,
    run_id: &str,
) -> AdapterResult<Option<Checkpoint>> {
    let tag = run_label(run_id);
    let mut checkpoints: Vec<Checkpoint> = store
        .list_all()?
        .into_iter()
        .filter(|i| i.has_label(CHECKPOINT_LABEL) && i.has_label(&tag))
        .filter_map(|i| Checkpoint::parse_description(&i.description))
        .collect();
    checkpoints.sort_by_key(|c| c.session_number);
    Ok(checkpoints.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn result(issue: &str, outcome: SessionOutcome) -> SessionResult {
        SessionResult {
            issue_id: issue.to_string(),
            outcome,
            summary: "did things".into(),
            git_commit: Some("abc1234".into()),
            context_used: 10,
            duration_ms: 50,
            error: None,
            model: None,
            session_id: Some("s-1".into()),
            cost_usd: Some(0.1),
            num_turns: Some(3),
            raw_output: String::new(),
        }
    }

    #[test]
    fn test_no_checkpoint_on_empty_window() {
        let engine = CheckpointEngine::new(CheckpointPolicy::default());
        assert!(engine.should_checkpoint(false).is_none());
        assert!(engine.should_checkpoint(true).is_none());
    }

    #[test]
    fn test_after_sessions_trigger() {
        let mut engine = CheckpointEngine::new(CheckpointPolicy {
            after_sessions: 3,
            ..CheckpointPolicy::default()
        });
        engine.record(result("a", SessionOutcome::Success));
        engine.record(result("b", SessionOutcome::Success));
        assert!(engine.should_checkpoint(false).is_none());
        engine.record(result("c", SessionOutcome::Success));
        assert_eq!(
            engine.should_checkpoint(false),
            Some(CheckpointTrigger::AfterSessions)
        );
    }

    #[test]
    fn test_on_error_trigger() {
        let mut engine = CheckpointEngine::new(CheckpointPolicy {
            after_sessions: 100,
            on_error: true,
            ..CheckpointPolicy::default()
        });
        engine.record(result("a", SessionOutcome::Failure));
        assert_eq!(
            engine.should_checkpoint(false),
            Some(CheckpointTrigger::OnError)
        );
    }

    #[test]
    fn test_on_redirect_trigger() {
        let mut engine = CheckpointEngine::new(CheckpointPolicy {
            after_sessions: 100,
            ..CheckpointPolicy::default()
        });
        engine.record(result("a", SessionOutcome::Success));
        assert!(engine.should_checkpoint(false).is_none());
        assert_eq!(
            engine.should_checkpoint(true),
            Some(CheckpointTrigger::OnRedirect)
        );
    }

    #[test]
    fn test_confidence_formula() {
        let mut engine = CheckpointEngine::new(CheckpointPolicy::default());
        // all success -> 1.0
        for id in ["a", "b", "c"] {
            engine.record(result(id, SessionOutcome::Success));
        }
        assert!((engine.confidence() - 1.0).abs() < f64::EPSILON);

        // success, partial, failure: score = 1.5/3 = 0.5, penalty 0.15
        let mut engine = CheckpointEngine::new(CheckpointPolicy::default());
        engine.record(result("a", SessionOutcome::Success));
        engine.record(result("b", SessionOutcome::Partial));
        engine.record(result("c", SessionOutcome::Failure));
        assert!((engine.confidence() - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_clamped() {
        let mut engine = CheckpointEngine::new(CheckpointPolicy::default());
        for id in ["a", "b", "c"] {
            engine.record(result(id, SessionOutcome::Failure));
        }
        assert_eq!(engine.confidence(), 0.0);
    }

    #[test]
    fn test_empty_window_keeps_last_confidence() {
        let mut engine = CheckpointEngine::new(CheckpointPolicy::default());
        assert!((engine.confidence() - 1.0).abs() < f64::EPSILON);
        engine.record(result("a", SessionOutcome::Failure));
        engine.record(result("b", SessionOutcome::Failure));
        let _ = engine.build("fm-1", vec![], None, vec![], ResumeInfo::default());
        // Window now empty; confidence is the checkpointed value, not 1.0.
        assert!(engine.confidence() < 0.5);
    }

    #[test]
    fn test_build_buckets_issues() {
        let mut engine = CheckpointEngine::new(CheckpointPolicy::default());
        engine.record(result("a", SessionOutcome::Success));
        engine.record(result("b", SessionOutcome::Failure));
        engine.record(result("b", SessionOutcome::Success));
        engine.record(result("c", SessionOutcome::Failure));
        let cp = engine.build(
            "fm-epic",
            vec!["d".into()],
            Some("abc1234".into()),
            vec!["note".into()],
            ResumeInfo {
                last_session_id: Some("s-9".into()),
                total_cost_usd: 1.5,
            },
        );
        assert_eq!(cp.session_number, 1);
        assert_eq!(cp.issues_completed, vec!["a", "b"]);
        // b succeeded on retry, so it is not failed.
        assert_eq!(cp.issues_failed, vec!["c"]);
        assert_eq!(cp.issues_in_progress, vec!["d"]);
        assert_eq!(cp.resume.last_session_id.as_deref(), Some("s-9"));
        // Engine reset.
        assert_eq!(engine.sessions_since_checkpoint(), 0);
    }

    #[test]
    fn test_description_roundtrip() {
        let mut engine = CheckpointEngine::new(CheckpointPolicy::default());
        engine.record(result("a", SessionOutcome::Success));
        engine.record(result("b", SessionOutcome::Partial));
        let cp = engine.build(
            "fm-epic",
            vec![],
            Some("abc1234".into()),
            vec!["priority change on fm-5".into()],
            ResumeInfo {
                last_session_id: Some("s-3".into()),
                total_cost_usd: 0.42,
            },
        );
        let description = cp.render_description();
        let parsed = Checkpoint::parse_description(&description).unwrap();
        assert_eq!(parsed.issues_completed, cp.issues_completed);
        assert_eq!(parsed.issues_failed, cp.issues_failed);
        assert_eq!(parsed.confidence, cp.confidence);
        assert_eq!(parsed.redirect_notes, cp.redirect_notes);
        assert_eq!(parsed.resume.last_session_id, cp.resume.last_session_id);
        assert_eq!(parsed.resume.total_cost_usd, cp.resume.total_cost_usd);
    }

    #[test]
    fn test_persist_and_load_latest() {
        let store = MemoryStore::new();
        let epic = store
            .create(
                NewIssue::new("run epic")
                    .with_type(IssueType::Epic)
                    .with_description("run"),
            )
            .unwrap();

        let mut engine = CheckpointEngine::new(CheckpointPolicy::default());
        engine.record(result("a", SessionOutcome::Success));
        let first = engine.build(&epic, vec![], None, vec![], ResumeInfo::default());
        persist_checkpoint(&store, &first).unwrap();

        engine.record(result("b", SessionOutcome::Success));
        let second = engine.build(&epic, vec![], None, vec![], ResumeInfo::default());
        persist_checkpoint(&store, &second).unwrap();

        let latest = load_latest_checkpoint(&store, &epic).unwrap().unwrap();
        assert_eq!(latest.session_number, 2);
        assert_eq!(latest.issues_completed, vec!["b"]);
    }

    #[test]
    fn test_swarm_progress_efficiency() {
        let agents = vec![
            AgentStatus {
                agent_id: "agent-1".into(),
                issue_id: "a".into(),
                status: SwarmAgentState::Completed,
                outcome: Some(SessionOutcome::Success),
                error: None,
            },
            AgentStatus {
                agent_id: "agent-2".into(),
                issue_id: "b".into(),
                status: SwarmAgentState::Failed,
                outcome: Some(SessionOutcome::Failure),
                error: Some("boom".into()),
            },
            AgentStatus {
                agent_id: "agent-3".into(),
                issue_id: "c".into(),
                status: SwarmAgentState::Completed,
                outcome: Some(SessionOutcome::Success),
                error: None,
            },
        ];
        let progress = SwarmProgress::from_agents(agents);
        assert!((progress.parallelism_efficiency - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_resume_at() {
        let mut engine =
            CheckpointEngine::new(CheckpointPolicy::default()).resume_at(4, 0.8);
        engine.record(result("a", SessionOutcome::Success));
        let cp = engine.build("fm-epic", vec![], None, vec![], ResumeInfo::default());
        assert_eq!(cp.session_number, 5);
    }
}
