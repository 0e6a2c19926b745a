//! End-to-end scheduler scenarios against an in-memory store and a
//! scripted agent.

use async_trait::async_trait;
use foreman::{RunEnd, Scheduler};
use orchestration::checkpoint::Checkpoint;
use orchestration::specfile::FeatureSpec;
use orchestration::store::{CHECKPOINT_LABEL, PAUSE_LABEL};
use orchestration::{
    initialize_run, run_label, AgentSession, GitWorkspace, HarnessConfig, InitOptions,
    IssueStatus, IssueStore, MemoryStore, NewIssue, Priority, ProjectSpec, SessionOutcome,
    SessionRequest, SessionResult,
};
use std::collections::{HashMap, VecDeque};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const PASS_REVIEW: &str = r#"{"outcome":"pass","confidence":0.9,"summary":"looks fine"}"#;

/// Agent fake: per-issue outcome queues, canned reviewer envelopes, and an
/// optional post-session hook for injecting store mutations mid-run.
struct ScriptedAgent {
    scripts: Mutex<HashMap<String, VecDeque<SessionOutcome>>>,
    review_outputs: Mutex<HashMap<String, String>>,
    /// (issue id, model) per work session, in execution order.
    sessions: Mutex<Vec<(String, String)>>,
    counter: AtomicU32,
    hook: Mutex<Option<Box<dyn FnMut(&str) + Send>>>,
}

impl ScriptedAgent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            review_outputs: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            counter: AtomicU32::new(0),
            hook: Mutex::new(None),
        })
    }

    fn script(&self, issue_id: &str, outcomes: &[SessionOutcome]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(issue_id.to_string(), outcomes.iter().copied().collect());
    }

    fn script_review(&self, reviewer: &str, output: &str) {
        self.review_outputs
            .lock()
            .unwrap()
            .insert(format!("review:{reviewer}"), output.to_string());
    }

    fn on_session(&self, hook: impl FnMut(&str) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    fn session_log(&self) -> Vec<(String, String)> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentSession for ScriptedAgent {
    async fn run_session(&self, request: SessionRequest) -> SessionResult {
        if request.issue_id.starts_with("review:") {
            let output = self
                .review_outputs
                .lock()
                .unwrap()
                .get(&request.issue_id)
                .cloned()
                .unwrap_or_else(|| PASS_REVIEW.to_string());
            let mut result = SessionResult::synthetic_failure(&request.issue_id, "");
            result.outcome = SessionOutcome::Success;
            result.error = None;
            result.raw_output = output;
            result.summary = "review done".into();
            return result;
        }

        self.sessions
            .lock()
            .unwrap()
            .push((request.issue_id.clone(), request.model.clone()));
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.issue_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(SessionOutcome::Success);
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook(&request.issue_id);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        SessionResult {
            issue_id: request.issue_id,
            outcome,
            summary: "did the work".into(),
            git_commit: Some("abc1234".into()),
            context_used: request.prompt.len() as u64,
            duration_ms: 5,
            error: match outcome {
                SessionOutcome::Failure => Some("agent exited non-zero".into()),
                _ => None,
            },
            model: Some(request.model),
            session_id: Some(format!("s-{n}")),
            cost_usd: Some(0.1),
            num_turns: Some(2),
            raw_output: "did the work".into(),
        }
    }
}

fn git_fixture() -> (tempfile::TempDir, Arc<GitWorkspace>) {
    let dir = tempfile::tempdir().unwrap();
    for args in [
        vec!["init"],
        vec!["config", "user.email", "t@t"],
        vec!["config", "user.name", "T"],
    ] {
        Command::new("git").args(&args).current_dir(dir.path()).output().unwrap();
    }
    std::fs::write(dir.path().join("README.md"), "x").unwrap();
    for args in [vec!["add", "."], vec!["commit", "-m", "init"]] {
        Command::new("git").args(&args).current_dir(dir.path()).output().unwrap();
    }
    let git = Arc::new(GitWorkspace::new(dir.path()));
    (dir, git)
}

fn test_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.gates.enabled = false;
    config.loop_delay_ms = 1;
    config.failure.retry_delay_ms = 1;
    config.checkpoint.on_confidence_below = 0.0;
    config
}

fn spec(features: &[(&str, u8, &[&str])]) -> ProjectSpec {
    ProjectSpec {
        title: "Scenario".into(),
        overview: None,
        property: None,
        complexity: None,
        features: features
            .iter()
            .map(|(title, priority, labels)| FeatureSpec {
                title: title.to_string(),
                priority: Some(*priority),
                labels: labels.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            })
            .collect(),
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<dyn IssueStore>,
    agent: Arc<ScriptedAgent>,
    scheduler: Scheduler,
    run_id: String,
    /// Feature title -> issue id.
    ids: HashMap<String, String>,
}

async fn harness(features: &[(&str, u8, &[&str])], config: HarnessConfig) -> Harness {
    let (dir, git) = git_fixture();
    let store: Arc<dyn IssueStore> = Arc::new(MemoryStore::new());
    let run = initialize_run(
        spec(features),
        &config,
        Arc::clone(&store),
        Arc::clone(&git),
        InitOptions {
            create_branch: false,
        },
    )
    .await
    .unwrap();

    let ids: HashMap<String, String> = store
        .list_all()
        .unwrap()
        .into_iter()
        .filter(|i| run.issue_ids.contains(&i.id))
        .map(|i| (i.title, i.id))
        .collect();
    let run_id = run.state.id.clone();
    let agent = ScriptedAgent::new();
    let scheduler = Scheduler::new(
        run.state,
        config,
        Arc::clone(&store),
        agent.clone() as Arc<dyn AgentSession>,
        git,
    );

    Harness {
        _dir: dir,
        store,
        agent,
        scheduler,
        run_id,
        ids,
    }
}

fn checkpoints(store: &dyn IssueStore, run_id: &str) -> Vec<Checkpoint> {
    let tag = run_label(run_id);
    let mut all: Vec<Checkpoint> = store
        .list_all()
        .unwrap()
        .into_iter()
        .filter(|i| i.has_label(CHECKPOINT_LABEL) && i.has_label(&tag))
        .filter_map(|i| Checkpoint::parse_description(&i.description))
        .collect();
    all.sort_by_key(|c| c.session_number);
    all
}

// ============================================================================
// Sequential happy path
// ============================================================================

#[tokio::test]
async fn sequential_happy_path() {
    let mut h = harness(
        &[("A", 2, &[]), ("B", 2, &[]), ("C", 2, &[])],
        test_config(),
    )
    .await;
    let end = h.scheduler.run().await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    // Three successful sessions in id order (priority ties break by id).
    let log = h.agent.session_log();
    let expected: Vec<String> = ["A", "B", "C"].iter().map(|t| h.ids[*t].clone()).collect();
    let actual: Vec<String> = log.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(actual, expected);

    // All three closed.
    for id in h.ids.values() {
        assert_eq!(h.store.get(id).unwrap().status, IssueStatus::Closed);
    }
    assert_eq!(h.scheduler.state().features_completed, 3);
    assert_eq!(h.scheduler.state().features_failed, 0);

    // Exactly one checkpoint, confidence 1.0, completed list covers A, B, C.
    let cps = checkpoints(h.store.as_ref(), &h.run_id);
    assert_eq!(cps.len(), 1);
    assert_eq!(cps[0].confidence, 1.0);
    let mut completed = cps[0].issues_completed.clone();
    completed.sort();
    let mut all: Vec<String> = h.ids.values().cloned().collect();
    all.sort();
    assert_eq!(completed, all);
}

// ============================================================================
// Retry then succeed
// ============================================================================

#[tokio::test]
async fn retry_then_succeed() {
    let mut h = harness(&[("A", 2, &[])], test_config()).await;
    let a = h.ids["A"].clone();
    h.agent.script(
        &a,
        &[
            SessionOutcome::Failure,
            SessionOutcome::Failure,
            SessionOutcome::Success,
        ],
    );

    let end = h.scheduler.run().await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    assert_eq!(h.scheduler.failure_tracker().attempts(&a), 3);
    let stats = h.scheduler.failure_tracker().stats();
    assert_eq!(stats.successful_retries, 1);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(h.store.get(&a).unwrap().status, IssueStatus::Closed);
}

// ============================================================================
// Pause on consecutive failures
// ============================================================================

#[tokio::test]
async fn pause_on_consecutive_failures() {
    let mut h = harness(
        &[("A", 2, &[]), ("B", 2, &[]), ("C", 2, &[])],
        test_config(),
    )
    .await;
    for title in ["A", "B", "C"] {
        h.agent.script(
            &h.ids[title],
            &[SessionOutcome::Failure, SessionOutcome::Failure, SessionOutcome::Failure],
        );
    }

    let end = h.scheduler.run().await.unwrap();
    match end {
        RunEnd::Paused(reason) => assert!(
            reason.contains("3 consecutive failures"),
            "reason: {reason}"
        ),
        other => panic!("expected pause, got {other:?}"),
    }

    // Exactly one transition to paused and exactly one checkpoint.
    assert_eq!(
        h.scheduler.state().status,
        orchestration::RunStatus::Paused
    );
    assert_eq!(checkpoints(h.store.as_ref(), &h.run_id).len(), 1);
}

// ============================================================================
// Redirect on a new urgent issue
// ============================================================================

#[tokio::test]
async fn redirect_on_new_urgent() {
    let mut h = harness(&[("A", 2, &[]), ("B", 2, &[])], test_config()).await;
    let store = Arc::clone(&h.store);
    let fired = std::sync::atomic::AtomicBool::new(false);
    h.agent.on_session(move |_| {
        if !fired.swap(true, Ordering::SeqCst) {
            store
                .create(
                    NewIssue::new("U — production incident")
                        .with_priority(Priority::HIGHEST)
                        .with_description("urgent"),
                )
                .unwrap();
        }
    });

    let end = h.scheduler.run().await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    // The urgent issue was adopted and ran before B.
    let log: Vec<String> = h.agent.session_log().iter().map(|(id, _)| id.clone()).collect();
    let urgent_id = h
        .store
        .list_all()
        .unwrap()
        .into_iter()
        .find(|i| i.title.starts_with("U —"))
        .unwrap()
        .id;
    let urgent_pos = log.iter().position(|id| *id == urgent_id).unwrap();
    let b_pos = log.iter().position(|id| *id == h.ids["B"]).unwrap();
    assert!(urgent_pos < b_pos, "urgent should schedule before B: {log:?}");

    // The redirect was checkpointed.
    let cps = checkpoints(h.store.as_ref(), &h.run_id);
    assert!(cps
        .iter()
        .any(|c| c.redirect_notes.iter().any(|n| n.contains("new urgent"))));
    assert_eq!(h.store.get(&urgent_id).unwrap().status, IssueStatus::Closed);
}

// ============================================================================
// Model escalation
// ============================================================================

#[tokio::test]
async fn model_escalation_to_high() {
    let mut h = harness(
        &[("Wire payment exports", 2, &["complexity:standard"])],
        test_config(),
    )
    .await;
    let a = h.ids["Wire payment exports"].clone();
    h.agent.script(
        &a,
        &[
            SessionOutcome::Failure,
            SessionOutcome::Failure,
            SessionOutcome::Success,
        ],
    );

    let end = h.scheduler.run().await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    // Routed to mid twice, then escalated to high.
    let models: Vec<String> = h.agent.session_log().iter().map(|(_, m)| m.clone()).collect();
    assert_eq!(models, vec!["sonnet", "sonnet", "opus"]);

    // The successful escalation annotated the issue with title keywords.
    let issue = h.store.get(&a).unwrap();
    assert!(issue.description.contains("Pattern keywords"), "{}", issue.description);
    assert!(issue.description.contains("wire") || issue.description.contains("payment"));
}

// ============================================================================
// Review blocking
// ============================================================================

#[tokio::test]
async fn review_blocks_run() {
    let mut config = test_config();
    config.checkpoint.after_sessions = 1;
    let mut h = harness(&[("A", 2, &[])], config).await;
    h.agent.script_review(
        "security",
        r#"{"outcome":"fail","confidence":0.95,"summary":"injection",
           "findings":[{"severity":"critical","category":"injection","title":"raw SQL in handler"}]}"#,
    );

    let end = h.scheduler.run().await.unwrap();
    match end {
        RunEnd::Paused(reason) => {
            assert!(reason.contains("1 critical finding"), "reason: {reason}");
            assert!(reason.contains("security"), "reason: {reason}");
        }
        other => panic!("expected pause, got {other:?}"),
    }
    assert_eq!(
        h.scheduler.state().status,
        orchestration::RunStatus::Paused
    );

    // The checkpoint carries the aggregation.
    let cps = checkpoints(h.store.as_ref(), &h.run_id);
    let reviewed = cps.iter().find(|c| c.review.is_some()).unwrap();
    let review = reviewed.review.as_ref().unwrap();
    assert!(!review.should_advance);
    assert_eq!(review.counts.critical, 1);
}

// ============================================================================
// Swarm batch
// ============================================================================

#[tokio::test]
async fn swarm_batch_runs_independent_issues() {
    let mut config = test_config();
    config.swarm.enabled = true;
    config.swarm.max_parallel_agents = 3;
    config.swarm.min_tasks_for_swarm = 2;
    let mut h = harness(
        &[("A", 2, &[]), ("B", 2, &[]), ("C", 2, &[])],
        config,
    )
    .await;

    let end = h.scheduler.run().await.unwrap();
    assert_eq!(end, RunEnd::Completed);
    for id in h.ids.values() {
        assert_eq!(h.store.get(id).unwrap().status, IssueStatus::Closed);
    }

    // A swarm checkpoint with per-agent statuses and full efficiency.
    let cps = checkpoints(h.store.as_ref(), &h.run_id);
    let swarm_cp = cps.iter().find(|c| c.swarm.is_some()).unwrap();
    let swarm = swarm_cp.swarm.as_ref().unwrap();
    assert_eq!(swarm.agents.len(), 3);
    assert!((swarm.parallelism_efficiency - 1.0).abs() < f64::EPSILON);

    // Accounting order is deterministic: priority then id.
    let issue_order: Vec<&str> = swarm.agents.iter().map(|a| a.issue_id.as_str()).collect();
    let mut expected: Vec<&str> = h.ids.values().map(String::as_str).collect();
    expected.sort();
    assert_eq!(issue_order, expected);
}

#[tokio::test]
async fn single_independent_issue_never_swarms() {
    let mut config = test_config();
    config.swarm.enabled = true;
    config.swarm.min_tasks_for_swarm = 2;
    let mut h = harness(&[("Only", 2, &[])], config).await;
    let end = h.scheduler.run().await.unwrap();
    assert_eq!(end, RunEnd::Completed);

    // No swarm checkpoint was written for a batch of one.
    let cps = checkpoints(h.store.as_ref(), &h.run_id);
    assert!(cps.iter().all(|c| c.swarm.is_none()));
}

// ============================================================================
// Pause marker and resume
// ============================================================================

#[tokio::test]
async fn pause_marker_pauses_after_current_session() {
    let mut h = harness(&[("A", 2, &[]), ("B", 2, &[])], test_config()).await;
    let store = Arc::clone(&h.store);
    let run_tag = run_label(&h.run_id);
    let fired = std::sync::atomic::AtomicBool::new(false);
    h.agent.on_session(move |_| {
        if !fired.swap(true, Ordering::SeqCst) {
            store
                .create(
                    NewIssue::new("hold on")
                        .with_label(PAUSE_LABEL)
                        .with_label(&run_tag)
                        .with_description("checking direction"),
                )
                .unwrap();
        }
    });

    let end = h.scheduler.run().await.unwrap();
    match end {
        RunEnd::Paused(reason) => assert!(reason.contains("pause requested"), "{reason}"),
        other => panic!("expected pause, got {other:?}"),
    }
    // The first session finished before the pause took effect.
    assert_eq!(h.store.get(&h.ids["A"]).unwrap().status, IssueStatus::Closed);
    // B never ran.
    assert_eq!(h.agent.session_log().len(), 1);
    // A hard pause preserved context in a final checkpoint.
    assert!(!checkpoints(h.store.as_ref(), &h.run_id).is_empty());
}

#[tokio::test]
async fn resume_after_pause_completes_remaining_work() {
    let mut h = harness(&[("A", 2, &[])], test_config()).await;
    let a = h.ids["A"].clone();
    h.agent.script(
        &a,
        &[
            SessionOutcome::Failure,
            SessionOutcome::Failure,
            SessionOutcome::Failure,
            SessionOutcome::Success,
        ],
    );

    let end = h.scheduler.run().await.unwrap();
    assert!(matches!(end, RunEnd::Paused(_)));
    h.scheduler.state().mirror_to_store(h.store.as_ref()).unwrap();

    // Rebuild from the store and keep going with the same agent script.
    let (state, report) = orchestration::resume_run(h.store.as_ref(), Some(&h.run_id)).unwrap();
    assert_eq!(state.features_completed, 0);
    assert!(report.checkpoint.is_some());

    let (dir, git) = git_fixture();
    let mut resumed = Scheduler::new(
        state,
        test_config(),
        Arc::clone(&h.store),
        h.agent.clone() as Arc<dyn AgentSession>,
        git,
    );
    let end = resumed.run().await.unwrap();
    assert_eq!(end, RunEnd::Completed);
    assert_eq!(h.store.get(&a).unwrap().status, IssueStatus::Closed);
    assert_eq!(resumed.state().features_completed, 1);
    drop(dir);
}

// ============================================================================
// Dependency ordering
// ============================================================================

#[tokio::test]
async fn blocked_issue_waits_for_its_blocker() {
    let mut h = harness(&[("First", 2, &[]), ("Second", 2, &[])], test_config()).await;
    // Second blocked by First.
    h.store
        .add_dependency(
            &h.ids["Second"],
            &h.ids["First"],
            orchestration::store::DependencyKind::Blocks,
        )
        .unwrap();

    let end = h.scheduler.run().await.unwrap();
    assert_eq!(end, RunEnd::Completed);
    let log: Vec<String> = h.agent.session_log().iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(log, vec![h.ids["First"].clone(), h.ids["Second"].clone()]);
}
