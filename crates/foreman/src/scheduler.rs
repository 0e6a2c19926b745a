//! The orchestration loop: pick work, run the agent, apply policy,
//! checkpoint, react to redirects.
//!
//! One scheduler owns one run. All engine state (run state, failure
//! tracker, checkpoint engine, breakers) lives here and never crosses a
//! task boundary; swarm workers communicate back only through their
//! returned session results. Cancellation is observed between sessions and
//! batches, never mid-session.

use chrono::Utc;
use orchestration::breaker::BreakerError;
use orchestration::checkpoint::{AgentStatus, SwarmAgentState, SwarmProgress};
use orchestration::failure::FailureAction;
use orchestration::plan::{independent_set, pending_work};
use orchestration::store::{AdapterErrorKind, AdapterResult, BLOCKER_LABEL};
use orchestration::{
    create_blockers, escalation_note, run_label, select_with_strategy, AgentSession,
    BaselineGates, BreakerConfig, CheckpointEngine, CircuitBreakerRegistry, CircuitState,
    ContextBuilder, ContextInputs, ExperimentLog, FailureTracker, GitWorkspace,
    HarnessConfig, HarnessError, HarnessResult, Issue, IssueStatus, IssueStore,
    RedirectDetector, RedirectKind, ResumeInfo, ReviewRequest, ReviewerPipeline,
    RoutingExperiment, RunState, RunStatus, SessionRequest, SessionResult, SwarmConfig,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a run ended, as seen by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    Paused(String),
    Failed(String),
}

/// Loop-level classification of a store failure.
enum StoreFlow {
    /// Retry at the next iteration.
    Transient,
    /// The record is gone; skip it.
    Missing,
    /// Run-level failure.
    Permanent(String),
}

/// Swarm mode requires at least two independent issues, whatever the
/// configured minimum says.
fn swarm_mode(independent: usize, config: &SwarmConfig) -> bool {
    config.enabled && independent >= config.min_tasks_for_swarm.max(2)
}

pub struct Scheduler {
    store: Arc<dyn IssueStore>,
    agent: Arc<dyn AgentSession>,
    git: Arc<GitWorkspace>,
    config: HarnessConfig,
    state: RunState,
    failure: FailureTracker,
    checkpoints: CheckpointEngine,
    detector: RedirectDetector,
    breakers: CircuitBreakerRegistry,
    reviews: Option<ReviewerPipeline>,
    gates: Option<BaselineGates>,
    experiments: Option<ExperimentLog>,
    cancel: CancellationToken,
    /// Redirect notes accumulated since the last checkpoint.
    redirect_notes: Vec<String>,
    /// A redirect fired since the last checkpoint.
    redirect_pending: bool,
    /// Per-issue agent session ids for continuation.
    resume_sessions: HashMap<String, String>,
    /// Issues this process closed since the last snapshot (self-echo filter).
    recently_closed: HashSet<String>,
    /// Records this process created since the last snapshot.
    recently_created: HashSet<String>,
    last_checkpoint_summary: Option<String>,
    run_start_commit: Option<String>,
    span_base_commit: Option<String>,
    /// Delay requested by a retry decision, honoured at the loop tail.
    pending_delay_ms: Option<u64>,
    max_hours: Option<f64>,
}

impl Scheduler {
    pub fn new(
        state: RunState,
        config: HarnessConfig,
        store: Arc<dyn IssueStore>,
        agent: Arc<dyn AgentSession>,
        git: Arc<GitWorkspace>,
    ) -> Self {
        let reviews = config.reviewers.enabled.then(|| {
            ReviewerPipeline::new(
                config.reviewers.panel.clone(),
                config.reviewers.policy.clone(),
                config.routing.models.clone(),
                Arc::clone(&agent),
            )
        });
        let gates = config.gates.enabled.then(|| {
            BaselineGates::new(config.gates.gates.clone(), git.working_dir())
        });
        let checkpoints =
            CheckpointEngine::new(config.checkpoint).resume_at(state.last_checkpoint, 1.0);
        let detector = RedirectDetector::new(&state.id);
        let run_start_commit = git.current_commit_full().ok();

        Self {
            failure: FailureTracker::new(config.failure.clone()),
            checkpoints,
            detector,
            breakers: CircuitBreakerRegistry::new(BreakerConfig::default()),
            reviews,
            gates,
            experiments: None,
            cancel: CancellationToken::new(),
            redirect_notes: Vec::new(),
            redirect_pending: false,
            resume_sessions: HashMap::new(),
            recently_closed: HashSet::new(),
            recently_created: HashSet::new(),
            last_checkpoint_summary: None,
            span_base_commit: run_start_commit.clone(),
            run_start_commit,
            pending_delay_ms: None,
            max_hours: None,
            store,
            agent,
            git,
            config,
            state,
        }
    }

    pub fn with_experiment_log(mut self, log: ExperimentLog) -> Self {
        self.experiments = Some(log);
        self
    }

    pub fn with_max_hours(mut self, hours: Option<f64>) -> Self {
        self.max_hours = hours;
        self
    }

    /// Token that stops the loop at the next session/batch boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn failure_tracker(&self) -> &FailureTracker {
        &self.failure
    }

    fn mirror(&self) {
        if let Err(e) = self.state.mirror_to_store(self.store.as_ref()) {
            warn!(run = %self.state.id, error = %e, "failed to mirror run state");
        }
    }

    /// Run a store operation through its named breaker.
    fn store_call<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&dyn IssueStore) -> AdapterResult<T>,
    ) -> Result<T, StoreFlow> {
        let store = Arc::clone(&self.store);
        let breaker = self.breakers.get(name);
        match breaker.call_sync(|| f(store.as_ref())) {
            Ok(value) => Ok(value),
            Err(BreakerError::Rejected { .. }) => Err(StoreFlow::Transient),
            Err(BreakerError::Timeout { .. }) => Err(StoreFlow::Transient),
            Err(BreakerError::Inner(e)) => match e.kind {
                AdapterErrorKind::Transient => Err(StoreFlow::Transient),
                AdapterErrorKind::NotFound => Err(StoreFlow::Missing),
                AdapterErrorKind::Permanent => Err(StoreFlow::Permanent(e.to_string())),
            },
        }
    }

    /// The main loop. Precondition: the run is initializing, paused (being
    /// resumed), or already running.
    pub async fn run(&mut self) -> HarnessResult<RunEnd> {
        match self.state.status {
            RunStatus::Initializing => self.state.start()?,
            RunStatus::Paused => self.state.resume()?,
            RunStatus::Running => {}
            other => {
                return Err(HarnessError::run(format!(
                    "run {} is already {other}",
                    self.state.id
                )))
            }
        }
        self.mirror();

        // Baseline gates before any work; persistent failures become
        // blocker issues that schedule ahead of feature work.
        if let Some(mut gates) = self.gates.take() {
            let report = gates.run_all().await;
            if !report.all_passed() {
                match create_blockers(self.store.as_ref(), &report, &self.state.id) {
                    Ok(created) => {
                        self.state.features_total += created.len() as u32;
                        self.recently_created.extend(created);
                    }
                    Err(e) => warn!(error = %e, "failed to create gate blockers"),
                }
            }
            self.gates = Some(gates);
        }

        // Baseline snapshot for the redirect detector.
        if let Err(e) = self.detector.observe(self.store.as_ref()) {
            warn!(error = %e, "initial store snapshot failed");
        }

        let end = loop {
            if self.cancel.is_cancelled() {
                break self.pause_now("stop requested").await?;
            }
            if let Some(max_hours) = self.max_hours {
                let hours =
                    (Utc::now() - self.state.started_at).num_seconds() as f64 / 3600.0;
                if hours >= max_hours {
                    break self
                        .pause_now(&format!("max run time of {max_hours:.1}h reached"))
                        .await?;
                }
            }

            // 1. Redirects since the last snapshot.
            if let Some(end) = self.observe_redirects().await? {
                break end;
            }

            // 2. Pending work.
            let run_id = self.state.id.clone();
            let pending = match self.store_call("tracker:list", |s| {
                pending_work(s, &run_id)
            }) {
                Ok(pending) => pending,
                Err(StoreFlow::Transient) => {
                    self.sleep_between_iterations().await;
                    continue;
                }
                Err(StoreFlow::Missing) => Vec::new(),
                Err(StoreFlow::Permanent(message)) => {
                    break self.fail_now(&message).await?;
                }
            };
            if pending.is_empty() {
                break self.complete_now().await?;
            }

            // 3. Independent set; open blockers freeze non-blocker work.
            let mut independent = independent_set(&pending);
            if pending.iter().any(|i| i.has_label(BLOCKER_LABEL)) {
                independent.retain(|i| i.has_label(BLOCKER_LABEL));
            }
            if independent.is_empty() {
                break self
                    .pause_now("no runnable work: all pending issues are blocked")
                    .await?;
            }

            // 4/5. One session, or one swarm batch.
            let maybe_end = if swarm_mode(independent.len(), &self.config.swarm) {
                self.run_swarm_batch(&independent).await?
            } else {
                let next = independent[0].clone();
                self.run_sequential(next).await?
            };
            if let Some(end) = maybe_end {
                break end;
            }

            // Optional between-session gate pass; fresh failures become
            // blockers exactly like the pre-run pass.
            if self.config.gates.between_sessions {
                if let Some(mut gates) = self.gates.take() {
                    let report = gates.run_all().await;
                    if !report.all_passed() {
                        match create_blockers(self.store.as_ref(), &report, &self.state.id) {
                            Ok(created) => {
                                self.state.features_total += created.len() as u32;
                                self.recently_created.extend(created);
                            }
                            Err(e) => warn!(error = %e, "failed to create gate blockers"),
                        }
                    }
                    self.gates = Some(gates);
                }
            }

            // 6. Checkpoint when due (reviewed when a pipeline is configured).
            if self
                .checkpoints
                .should_checkpoint(self.redirect_pending)
                .is_some()
            {
                if let Some(end) = self.write_checkpoint(true, None).await? {
                    break end;
                }
            }

            // 7. Low confidence pauses the run.
            if self.checkpoints.confidence_low() {
                let confidence = self.checkpoints.confidence();
                break self
                    .pause_now(&format!(
                        "confidence {confidence:.2} below threshold {:.2}",
                        self.checkpoints.policy().on_confidence_below
                    ))
                    .await?;
            }

            // 8. Fixed inter-iteration delay.
            self.sleep_between_iterations().await;
        };

        self.mirror();
        Ok(end)
    }

    async fn sleep_between_iterations(&mut self) {
        let delay = self
            .pending_delay_ms
            .take()
            .unwrap_or(0)
            .max(self.config.loop_delay_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Snapshot the store and react to human-initiated changes.
    async fn observe_redirects(&mut self) -> HarnessResult<Option<RunEnd>> {
        // `stop` closes the run epic; that is a terminal stop signal.
        if let Ok(epic) = self.store.get(&self.state.id) {
            if epic.status == IssueStatus::Closed {
                return Ok(Some(self.pause_now("stop requested").await?));
            }
        }

        let redirects = match self.detector.observe(self.store.as_ref()) {
            Ok(redirects) => redirects,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "redirect snapshot failed; retrying next iteration");
                return Ok(None);
            }
            Err(e) => {
                return Ok(Some(self.fail_now(&e.to_string()).await?));
            }
        };
        let recently_closed = std::mem::take(&mut self.recently_closed);
        let recently_created = std::mem::take(&mut self.recently_created);

        let redirects: Vec<_> = redirects
            .into_iter()
            .filter(|r| match r.kind {
                // This process's own writes are not redirects.
                RedirectKind::IssueClosed => !recently_closed.contains(&r.issue_id),
                RedirectKind::NewUrgent => !recently_created.contains(&r.issue_id),
                _ => true,
            })
            .collect();
        if redirects.is_empty() {
            return Ok(None);
        }

        self.redirect_pending = true;
        for redirect in &redirects {
            info!(kind = %redirect.kind, issue = %redirect.issue_id, "redirect");
            self.redirect_notes.push(redirect.note());
        }

        if let Some(pause) = redirects
            .iter()
            .find(|r| r.kind == RedirectKind::PauseRequested)
        {
            return Ok(Some(self.pause_now(&pause.note()).await?));
        }

        // Adopt urgent issues into the run so they schedule first.
        let tag = run_label(&self.state.id);
        let mut adopted = 0;
        for redirect in &redirects {
            if redirect.kind == RedirectKind::NewUrgent {
                match self.store_call("tracker:update", |s| {
                    s.add_label(&redirect.issue_id, &tag)
                }) {
                    Ok(()) => adopted += 1,
                    Err(_) => warn!(issue = %redirect.issue_id, "failed to adopt urgent issue"),
                }
            }
        }
        self.state.features_total += adopted;

        // An urgent redirect checkpoints immediately (when there is
        // anything to snapshot).
        let urgent = redirects.iter().any(|r| r.kind.requires_immediate_action());
        if urgent && self.checkpoints.sessions_since_checkpoint() > 0 {
            if let Some(end) = self.write_checkpoint(false, None).await? {
                return Ok(Some(end));
            }
        }
        Ok(None)
    }

    /// Build the session request for one issue, threading the per-issue
    /// resume session id and the escalated model tier.
    fn build_request(&mut self, issue: &Issue) -> (SessionRequest, String, &'static str, bool) {
        let (base, strategy) = select_with_strategy(&self.config.routing, issue);
        let (tier, escalated) =
            self.failure
                .escalated_tier(&issue.id, base, &self.config.routing.models);
        let model = self.config.routing.models.name_for(tier).to_string();

        let inputs = ContextInputs {
            recent_commits: self.git.recent_commit_subjects(10).unwrap_or_default(),
            last_checkpoint_summary: self.last_checkpoint_summary.clone(),
            redirect_notes: self.redirect_notes.clone(),
        };
        let prompt = ContextBuilder::new(self.git.working_dir()).build(issue, &inputs);

        let mut request =
            SessionRequest::new(&issue.id, prompt, self.git.working_dir(), &model);
        request.resume_session_id = self.resume_sessions.get(&issue.id).cloned();
        request.timeout = self.config.session_timeout();
        (request, model, strategy, escalated)
    }

    /// Invoke the agent through the spawn breaker. Business failures pass
    /// through; spawn failures count against the circuit, and an open
    /// circuit yields a rejection result the failure tracker treats as a
    /// transient failure.
    async fn invoke_agent(&mut self, request: SessionRequest) -> SessionResult {
        let issue_id = request.issue_id.clone();
        let agent = Arc::clone(&self.agent);
        let breaker = self.breakers.get("agent");
        if breaker.state() == CircuitState::Open {
            let retry_in = breaker.next_reset_in().unwrap_or_default();
            warn!(issue = %issue_id, "agent circuit open, rejecting session");
            return SessionResult::synthetic_failure(
                &issue_id,
                format!(
                    "agent spawn rejected: circuit open, retry in {}s",
                    retry_in.as_secs()
                ),
            );
        }

        let outcome = breaker
            .call(async {
                let result = agent.run_session(request).await;
                let spawn_failed = result
                    .error
                    .as_deref()
                    .map(|e| e.contains("spawn"))
                    .unwrap_or(false);
                if spawn_failed {
                    Err(result)
                } else {
                    Ok(result)
                }
            })
            .await;
        match outcome {
            Ok(result) => result,
            Err(BreakerError::Inner(result)) => result,
            Err(BreakerError::Rejected { retry_in }) => SessionResult::synthetic_failure(
                &issue_id,
                format!(
                    "agent spawn rejected: circuit open, retry in {}s",
                    retry_in.as_secs()
                ),
            ),
            Err(BreakerError::Timeout { after }) => SessionResult::synthetic_failure(
                &issue_id,
                format!("agent call timed out after {}s", after.as_secs()),
            ),
        }
    }

    /// One sequential iteration: highest-priority independent issue.
    async fn run_sequential(&mut self, issue: Issue) -> HarnessResult<Option<RunEnd>> {
        match self.store_call("tracker:update", |s| {
            s.update_status(&issue.id, IssueStatus::InProgress)
        }) {
            Ok(()) => {}
            Err(StoreFlow::Transient) => return Ok(None),
            Err(StoreFlow::Missing) => {
                warn!(issue = %issue.id, "issue vanished before scheduling");
                return Ok(None);
            }
            Err(StoreFlow::Permanent(message)) => {
                return Ok(Some(self.fail_now(&message).await?));
            }
        }

        self.state.begin_session()?;
        let (request, model, strategy, escalated) = self.build_request(&issue);
        info!(
            issue = %issue.id,
            session = self.state.current_session,
            %model,
            escalated,
            "starting agent session"
        );
        let result = self.invoke_agent(request).await;
        self.account_result(&issue, result, &model, strategy, escalated)
            .await
    }

    /// One swarm iteration: up to `max_parallel_agents` independent issues
    /// run concurrently, fail-soft, under an aggregate timeout.
    async fn run_swarm_batch(&mut self, independent: &[Issue]) -> HarnessResult<Option<RunEnd>> {
        let batch: Vec<Issue> = independent
            .iter()
            .take(self.config.swarm.max_parallel_agents)
            .cloned()
            .collect();
        info!(
            batch = batch.len(),
            independent = independent.len(),
            "starting swarm batch"
        );

        let mut launched: Vec<(String, Issue)> = Vec::new();
        let mut join: JoinSet<(String, String, SessionResult)> = JoinSet::new();
        for (index, issue) in batch.iter().enumerate() {
            match self.store_call("tracker:update", |s| {
                s.update_status(&issue.id, IssueStatus::InProgress)
            }) {
                Ok(()) => {}
                Err(StoreFlow::Permanent(message)) => {
                    join.abort_all();
                    return Ok(Some(self.fail_now(&message).await?));
                }
                Err(_) => continue,
            }
            self.state.begin_session()?;
            let (request, model, _, _) = self.build_request(issue);
            let agent_id = format!("agent-{}", index + 1);
            let agent = Arc::clone(&self.agent);
            let issue_id = issue.id.clone();
            launched.push((agent_id.clone(), issue.clone()));
            info!(issue = %issue_id, %agent_id, %model, "swarm session launched");
            join.spawn(async move {
                let result = agent.run_session(request).await;
                (agent_id, issue_id, result)
            });
        }

        if launched.is_empty() {
            // Every status update failed transiently; try again next pass.
            return Ok(None);
        }

        // Fail-soft collection under the aggregate batch timeout: one
        // agent's failure never cancels its siblings.
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.swarm.batch_timeout_secs);
        let mut finished: HashMap<String, (String, SessionResult)> = HashMap::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("swarm batch timeout reached, cancelling stragglers");
                join.abort_all();
                break;
            }
            match tokio::time::timeout(remaining, join.join_next()).await {
                Ok(Some(Ok((agent_id, issue_id, result)))) => {
                    finished.insert(issue_id.clone(), (agent_id, result));
                }
                Ok(Some(Err(join_error))) => {
                    warn!(error = %join_error, "swarm worker panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("swarm batch timeout reached, cancelling stragglers");
                    join.abort_all();
                    break;
                }
            }
        }

        // Deterministic accounting order: priority, then id.
        let mut ordered = launched;
        ordered.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.1.id.cmp(&b.1.id)));

        let mut agents = Vec::new();
        let mut deferred_end: Option<RunEnd> = None;
        for (agent_id, issue) in ordered {
            let (status, result) = match finished.remove(&issue.id) {
                Some((_, result)) => {
                    let status = if result.is_success() {
                        SwarmAgentState::Completed
                    } else {
                        SwarmAgentState::Failed
                    };
                    (status, result)
                }
                None => (
                    SwarmAgentState::Cancelled,
                    SessionResult::synthetic_failure(
                        &issue.id,
                        "swarm batch timed out before this agent finished",
                    ),
                ),
            };
            agents.push(AgentStatus {
                agent_id,
                issue_id: issue.id.clone(),
                status,
                outcome: Some(result.outcome),
                error: result.error.clone(),
            });

            let (_, model, strategy, escalated) = self.build_request(&issue);
            // A pause decision mid-batch takes effect after the batch.
            if let Some(end) = self
                .account_result(&issue, result, &model, strategy, escalated)
                .await?
            {
                deferred_end.get_or_insert(end);
            }
        }

        // Swarm batches always checkpoint, carrying per-agent statuses.
        let progress = SwarmProgress::from_agents(agents);
        if let Some(end) = self
            .write_checkpoint(true, Some(progress))
            .await?
        {
            deferred_end.get_or_insert(end);
        }
        Ok(deferred_end)
    }

    /// Fold one session result into every engine: run state, experiment
    /// log, checkpoint buffer, failure tracker, and the issue store.
    async fn account_result(
        &mut self,
        issue: &Issue,
        result: SessionResult,
        model: &str,
        strategy: &'static str,
        escalated: bool,
    ) -> HarnessResult<Option<RunEnd>> {
        if let Some(session_id) = &result.session_id {
            self.resume_sessions
                .insert(issue.id.clone(), session_id.clone());
            self.state.last_session_id = Some(session_id.clone());
        }
        self.state.add_cost(result.cost_usd);
        self.state.session_completed()?;

        if let Some(log) = &self.experiments {
            let record = RoutingExperiment::new(
                &issue.id,
                result.model.as_deref().unwrap_or(model),
                if escalated { "escalation" } else { strategy },
                result.is_success(),
            )
            .with_cost(result.cost_usd);
            if let Err(e) = log.append(&record) {
                warn!(error = %e, "failed to append routing experiment");
            }
        }

        self.checkpoints.record(result.clone());
        let decision = self.failure.decide(&result);
        info!(
            issue = %issue.id,
            outcome = %result.outcome,
            action = %decision.action,
            reason = %decision.reason,
            "session accounted"
        );

        if result.is_success() {
            match self.store_call("tracker:update", |s| {
                s.update_status(&issue.id, IssueStatus::Closed)
            }) {
                Ok(()) => {
                    self.recently_closed.insert(issue.id.clone());
                    if let Err(e) = self.state.feature_completed() {
                        warn!(error = %e, "feature counter");
                    }
                }
                Err(StoreFlow::Permanent(message)) => {
                    return Ok(Some(self.fail_now(&message).await?));
                }
                Err(_) => warn!(issue = %issue.id, "could not close issue; will retry"),
            }
            if escalated {
                let keywords = ContextBuilder::new(self.git.working_dir()).keywords(&issue.title);
                let note = escalation_note(
                    result.model.as_deref().unwrap_or(model),
                    &keywords,
                );
                let _ = self.store_call("tracker:update", |s| s.annotate(&issue.id, &note));
            }
            return Ok(None);
        }

        if self.failure.policy().annotate_failures {
            let attempts = self.failure.attempts(&issue.id);
            let note = format!(
                "Attempt {attempts}: {} — {}",
                result.outcome,
                result.error.as_deref().unwrap_or("no error detail"),
            );
            let _ = self.store_call("tracker:update", |s| s.annotate(&issue.id, &note));
        }

        match decision.action {
            FailureAction::Retry | FailureAction::Escalate => {
                let _ = self.store_call("tracker:update", |s| {
                    s.update_status(&issue.id, IssueStatus::Open)
                });
                self.pending_delay_ms = decision.retry_after_ms;
            }
            FailureAction::Skip => {
                let _ = self.store_call("tracker:update", |s| {
                    s.update_status(&issue.id, IssueStatus::Open)
                });
                let _ = self.store_call("tracker:update", |s| {
                    s.add_label(&issue.id, orchestration::store::SKIPPED_LABEL)
                });
                let _ = self.store_call("tracker:update", |s| {
                    s.annotate(
                        &issue.id,
                        &format!("Skipped by the harness: {}", decision.reason),
                    )
                });
                if let Err(e) = self.state.feature_failed() {
                    warn!(error = %e, "feature counter");
                }
                if !decision.should_continue {
                    return Ok(Some(
                        self.pause_now(&format!("stopping after skip: {}", decision.reason))
                            .await?,
                    ));
                }
            }
            FailureAction::Pause => {
                return Ok(Some(self.pause_now(&decision.reason).await?));
            }
        }

        if decision.checkpoint_requested {
            if let Some(end) = self.write_checkpoint(true, None).await? {
                return Ok(Some(end));
            }
        }
        Ok(None)
    }

    /// Write a checkpoint. When `reviewed` and a pipeline is configured,
    /// the reviewer fan-out runs over the span diff and can block the run.
    async fn write_checkpoint(
        &mut self,
        reviewed: bool,
        swarm: Option<SwarmProgress>,
    ) -> HarnessResult<Option<RunEnd>> {
        let commit = self.git.current_commit().ok();
        let in_progress: Vec<String> = self
            .store
            .list_all()
            .map(|issues| {
                issues
                    .into_iter()
                    .filter(|i| {
                        i.status == IssueStatus::InProgress
                            && i.has_label(&run_label(&self.state.id))
                    })
                    .map(|i| i.id)
                    .collect()
            })
            .unwrap_or_default();

        let notes = std::mem::take(&mut self.redirect_notes);
        self.redirect_pending = false;
        let resume = ResumeInfo {
            last_session_id: self.state.last_session_id.clone(),
            total_cost_usd: self.state.total_cost_usd,
        };
        let mut checkpoint = self.checkpoints.build(
            &self.state.id,
            in_progress,
            commit.clone(),
            notes,
            resume,
        );
        if let Some(swarm) = swarm {
            checkpoint = checkpoint.with_swarm(swarm);
        }

        let mut end = None;
        if reviewed {
            if let Some(pipeline) = self.reviews.take() {
                let span_base = self.span_base_commit.clone();
                let span_diff = span_base
                    .as_deref()
                    .and_then(|base| self.git.diff_since(base).ok())
                    .unwrap_or_default();
                let full_diff = self
                    .run_start_commit
                    .as_deref()
                    .and_then(|base| self.git.diff_since(base).ok())
                    .unwrap_or_default();
                let review_request = ReviewRequest {
                    run_id: self.state.id.clone(),
                    checkpoint_summary: checkpoint.summary.clone(),
                    issues_completed: checkpoint.issues_completed.clone(),
                    span_diff,
                    full_diff,
                    cwd: self.git.working_dir().to_path_buf(),
                };
                let aggregation = pipeline.run(&review_request).await;
                if !aggregation.should_advance {
                    let reasons = aggregation.blocking_reasons.join("; ");
                    self.materialise_review_block(&aggregation, &reasons);
                    end = Some(RunEnd::Paused(format!("review blocked: {reasons}")));
                }
                checkpoint = checkpoint.with_review(aggregation);
                self.reviews = Some(pipeline);
            }
        }

        match self.store_call("tracker:checkpoint", |s| {
            orchestration::persist_checkpoint(s, &checkpoint)
        }) {
            Ok(record_id) => {
                self.recently_created.insert(record_id);
            }
            Err(_) => warn!(
                run = %self.state.id,
                number = checkpoint.session_number,
                "failed to persist checkpoint record"
            ),
        }
        self.state.checkpoint_written(checkpoint.session_number);
        self.last_checkpoint_summary = Some(checkpoint.summary.clone());
        self.span_base_commit = self.git.current_commit_full().ok().or(commit);
        self.mirror();

        if let Some(RunEnd::Paused(reason)) = &end {
            let reason = reason.clone();
            self.state.pause(&reason)?;
            self.mirror();
        }
        Ok(end)
    }

    /// Persist a review-block record so the pause is auditable in the store.
    fn materialise_review_block(
        &mut self,
        aggregation: &orchestration::ReviewAggregation,
        reasons: &str,
    ) {
        let description = format!(
            "Review blocked advancement.\n\nReasons:\n{}\n\nFindings: {} critical, {} high, {} medium.",
            reasons,
            aggregation.counts.critical,
            aggregation.counts.high,
            aggregation.counts.medium,
        );
        let run_id = self.state.id.clone();
        let created = self.store_call("tracker:update", move |s| {
            s.create(
                orchestration::NewIssue::new("Review block")
                    .with_type(orchestration::IssueType::Chore)
                    .with_label(orchestration::store::REVIEW_LABEL)
                    .with_label(run_label(&run_id))
                    .with_description(description),
            )
        });
        if let Ok(id) = created {
            self.recently_created.insert(id);
        }
    }

    /// A hard pause always writes a checkpoint first so context survives.
    async fn pause_now(&mut self, reason: &str) -> HarnessResult<RunEnd> {
        warn!(run = %self.state.id, reason, "pausing run");
        let _ = self.write_checkpoint(false, None).await?;
        self.state.pause(reason)?;
        self.mirror();
        Ok(RunEnd::Paused(reason.to_string()))
    }

    async fn fail_now(&mut self, message: &str) -> HarnessResult<RunEnd> {
        error!(run = %self.state.id, message, "run failed");
        let _ = self.write_checkpoint(false, None).await;
        self.state.fail(message)?;
        self.mirror();
        Ok(RunEnd::Failed(message.to_string()))
    }

    async fn complete_now(&mut self) -> HarnessResult<RunEnd> {
        if self.checkpoints.sessions_since_checkpoint() > 0 {
            if let Some(end) = self.write_checkpoint(true, None).await? {
                return Ok(end);
            }
        }
        self.state.complete()?;
        self.mirror();
        info!(
            run = %self.state.id,
            completed = self.state.features_completed,
            failed = self.state.features_failed,
            cost = self.state.total_cost_usd,
            "run completed"
        );
        Ok(RunEnd::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swarm_mode_thresholds() {
        let config = SwarmConfig {
            enabled: true,
            min_tasks_for_swarm: 2,
            ..SwarmConfig::default()
        };
        assert!(!swarm_mode(1, &config));
        assert!(swarm_mode(2, &config));
        assert!(swarm_mode(5, &config));

        let disabled = SwarmConfig {
            enabled: false,
            ..config.clone()
        };
        assert!(!swarm_mode(5, &disabled));

        // A configured minimum of one still never swarms a single issue.
        let eager = SwarmConfig {
            enabled: true,
            min_tasks_for_swarm: 1,
            ..config
        };
        assert!(!swarm_mode(1, &eager));
        assert!(swarm_mode(2, &eager));
    }
}
