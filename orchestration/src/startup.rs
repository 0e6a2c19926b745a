//! Run initialization and resumption.
//!
//! Initialization is a saga: create the working branch, create the run
//! epic, seed one issue per spec feature with dependency edges. A failure
//! partway through unwinds what was already created instead of leaving a
//! half-initialised run behind. Resumption reads the mirrored state and the
//! last checkpoint back out of the store and reconciles the two, treating
//! the store as authoritative.

use crate::checkpoint::{load_latest_checkpoint, Checkpoint};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::git::{run_branch_name, GitWorkspace};
use crate::runstate::RunState;
use crate::saga::{Saga, SagaContext, SagaStep, StepOptions};
use crate::specfile::ProjectSpec;
use crate::store::{
    run_label, DependencyKind, IssueStatus, IssueStore, IssueType, NewIssue, Priority,
    CHECKPOINT_LABEL, REVIEW_LABEL, RUN_LABEL_PREFIX,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Initialization options.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Create and check out the dedicated branch. Disabled for dry runs.
    pub create_branch: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            create_branch: true,
        }
    }
}

/// A freshly initialised run.
#[derive(Debug)]
pub struct InitializedRun {
    pub state: RunState,
    /// Feature issue ids, in spec order.
    pub issue_ids: Vec<String>,
}

struct CreateBranchStep {
    git: Arc<GitWorkspace>,
    title: String,
    create: bool,
}

#[async_trait]
impl SagaStep for CreateBranchStep {
    fn name(&self) -> &str {
        "create-branch"
    }

    fn options(&self) -> StepOptions {
        StepOptions {
            retries: 1,
            ..StepOptions::default()
        }
    }

    async fn execute(&self, _ctx: &SagaContext) -> Result<Value, String> {
        if !self.create {
            return Ok(json!({ "branch": run_branch_name(&self.title), "created": false }));
        }
        let previous = self.git.current_branch().map_err(|e| e.to_string())?;
        let branch = self
            .git
            .create_run_branch(&self.title)
            .map_err(|e| e.to_string())?;
        Ok(json!({ "branch": branch, "previous": previous, "created": true }))
    }

    fn compensates(&self) -> bool {
        true
    }

    async fn compensate(&self, _ctx: &SagaContext, result: &Value) -> Result<(), String> {
        if result["created"] != json!(true) {
            return Ok(());
        }
        let branch = result["branch"].as_str().unwrap_or_default();
        let previous = result["previous"].as_str().unwrap_or("main");
        self.git.checkout(previous).map_err(|e| e.to_string())?;
        self.git.delete_branch(branch).map_err(|e| e.to_string())?;
        Ok(())
    }
}

struct CreateEpicStep {
    store: Arc<dyn IssueStore>,
    spec: Arc<ProjectSpec>,
}

#[async_trait]
impl SagaStep for CreateEpicStep {
    fn name(&self) -> &str {
        "create-epic"
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<Value, String> {
        let branch = ctx
            .get("create-branch")
            .and_then(|v| v["branch"].as_str())
            .unwrap_or_default()
            .to_string();
        let description = format!(
            "Run epic for spec **{}**.\n\nBranch: `{branch}`\n\n{}",
            self.spec.title,
            self.spec.overview.as_deref().unwrap_or(""),
        );
        let epic_id = self
            .store
            .create(
                NewIssue::new(format!("Run: {}", self.spec.title))
                    .with_type(IssueType::Epic)
                    .with_priority(Priority::LOWEST)
                    .with_description(description),
            )
            .map_err(|e| e.to_string())?;
        // The run tag is the epic's own id, so it is added after creation.
        self.store
            .add_label(&epic_id, &run_label(&epic_id))
            .map_err(|e| e.to_string())?;
        Ok(json!({ "epic_id": epic_id }))
    }

    fn compensates(&self) -> bool {
        true
    }

    async fn compensate(&self, _ctx: &SagaContext, result: &Value) -> Result<(), String> {
        if let Some(epic_id) = result["epic_id"].as_str() {
            self.store
                .update_status(epic_id, IssueStatus::Closed)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

struct SeedIssuesStep {
    store: Arc<dyn IssueStore>,
    spec: Arc<ProjectSpec>,
}

#[async_trait]
impl SagaStep for SeedIssuesStep {
    fn name(&self) -> &str {
        "seed-issues"
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<Value, String> {
        let epic_id = ctx
            .get("create-epic")
            .and_then(|v| v["epic_id"].as_str())
            .ok_or_else(|| "epic id missing from context".to_string())?
            .to_string();
        let tag = run_label(&epic_id);

        let mut ids_by_title: HashMap<String, String> = HashMap::new();
        let mut ids = Vec::new();
        for feature in &self.spec.features {
            let mut description = feature
                .description
                .clone()
                .unwrap_or_else(|| feature.title.clone());
            if !feature.acceptance.is_empty() {
                description.push_str("\n\nAcceptance criteria:\n");
                for criterion in &feature.acceptance {
                    description.push_str(&format!("- {}\n", criterion.render()));
                }
            }

            let mut new_issue = NewIssue::new(&feature.title)
                .with_type(IssueType::Feature)
                .with_priority(feature.priority.map(Priority::new).unwrap_or_default())
                .with_label(&tag)
                .with_description(description);
            for label in &feature.labels {
                new_issue = new_issue.with_label(label);
            }
            if let Some(complexity) = &feature.complexity {
                new_issue = new_issue.with_label(format!("complexity:{complexity}"));
            }
            if let Some(category) = &feature.category {
                new_issue = new_issue.with_label(format!("category:{}", category.to_ascii_lowercase()));
            }

            let id = self.store.create(new_issue).map_err(|e| e.to_string())?;
            self.store
                .add_dependency(&id, &epic_id, DependencyKind::ParentChild)
                .map_err(|e| e.to_string())?;
            ids_by_title.insert(feature.title.clone(), id.clone());
            ids.push(id);
        }

        // Dependency edges once every issue exists.
        for feature in &self.spec.features {
            let from = &ids_by_title[&feature.title];
            for dep_title in &feature.depends_on {
                let to = ids_by_title.get(dep_title).ok_or_else(|| {
                    format!("dependency on unknown feature {dep_title:?}")
                })?;
                self.store
                    .add_dependency(from, to, DependencyKind::Blocks)
                    .map_err(|e| e.to_string())?;
            }
        }

        Ok(json!({ "issue_ids": ids }))
    }

    fn compensates(&self) -> bool {
        true
    }

    async fn compensate(&self, _ctx: &SagaContext, result: &Value) -> Result<(), String> {
        if let Some(ids) = result["issue_ids"].as_array() {
            for id in ids.iter().filter_map(|v| v.as_str()) {
                if let Err(e) = self.store.update_status(id, IssueStatus::Closed) {
                    warn!(issue = id, error = %e, "failed to close seeded issue");
                }
            }
        }
        Ok(())
    }
}

/// Initialize a run from a validated spec.
pub async fn initialize_run(
    spec: ProjectSpec,
    config: &HarnessConfig,
    store: Arc<dyn IssueStore>,
    git: Arc<GitWorkspace>,
    options: InitOptions,
) -> HarnessResult<InitializedRun> {
    spec.validate()?;
    let spec = Arc::new(spec);
    let features_total = spec.features.len() as u32;

    let saga = Saga::new("initialize-run")
        .step(CreateBranchStep {
            git,
            title: spec.title.clone(),
            create: options.create_branch,
        })
        .step(CreateEpicStep {
            store: Arc::clone(&store),
            spec: Arc::clone(&spec),
        })
        .step(SeedIssuesStep {
            store: Arc::clone(&store),
            spec: Arc::clone(&spec),
        });

    let report = saga.run(SagaContext::new()).await;
    if !report.succeeded() {
        return Err(HarnessError::SagaFailed {
            saga: report.saga,
            step: report
                .steps
                .iter()
                .find(|s| matches!(s.outcome, crate::saga::StepOutcome::Failed { .. }))
                .map(|s| s.name.clone())
                .unwrap_or_default(),
            message: report.error.unwrap_or_default(),
        });
    }

    let branch = report
        .context
        .get("create-branch")
        .and_then(|v| v["branch"].as_str())
        .unwrap_or_default()
        .to_string();
    let epic_id = report
        .context
        .get("create-epic")
        .and_then(|v| v["epic_id"].as_str())
        .unwrap_or_default()
        .to_string();
    let issue_ids = report
        .context
        .get("seed-issues")
        .and_then(|v| v["issue_ids"].as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let state = RunState::new(
        &epic_id,
        &spec.title,
        &branch,
        features_total,
        config.checkpoint,
    );
    if let Err(e) = state.mirror_to_store(store.as_ref()) {
        warn!(error = %e, "failed to mirror initial run state");
    }
    info!(run = %epic_id, %branch, features = features_total, "run initialised");

    Ok(InitializedRun { state, issue_ids })
}

/// Checkpoint-vs-store deltas reported when resuming.
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub checkpoint: Option<Checkpoint>,
    /// Closed in the store but not in the last checkpoint's completed list.
    pub closed_since_checkpoint: Vec<String>,
    /// In the checkpoint's completed list but open again in the store.
    pub reopened_since_checkpoint: Vec<String>,
}

/// Locate the run epic: explicit id, or the most recently created one.
pub fn find_run_epic(
    store: &dyn IssueStore,
    run_id: Option<&str>,
) -> HarnessResult<String> {
    if let Some(id) = run_id {
        store
            .get(id)
            .map_err(|e| HarnessError::run(format!("run {id}: {e}")))?;
        return Ok(id.to_string());
    }
    let mut epics: Vec<_> = store
        .list_all()
        .map_err(|e| HarnessError::run(e.to_string()))?
        .into_iter()
        .filter(|i| {
            i.issue_type == IssueType::Epic
                && i.labels.iter().any(|l| l.starts_with(RUN_LABEL_PREFIX))
        })
        .collect();
    epics.sort_by_key(|i| i.created_at);
    epics
        .pop()
        .map(|i| i.id)
        .ok_or_else(|| HarnessError::run("no run epic found in the issue store"))
}

/// Rebuild a paused run's state from the store.
///
/// The mirrored state gives the shape; the last checkpoint gives the resume
/// payload; the store gives the authoritative issue statuses, so
/// `features_completed` is recomputed from the closed issues under the
/// run's label.
pub fn resume_run(
    store: &dyn IssueStore,
    run_id: Option<&str>,
) -> HarnessResult<(RunState, ResumeReport)> {
    let epic_id = find_run_epic(store, run_id)?;
    let epic = store
        .get(&epic_id)
        .map_err(|e| HarnessError::run(e.to_string()))?;
    let mut state = RunState::parse_mirror(&epic.description)
        .ok_or_else(|| HarnessError::run(format!("run {epic_id} has no mirrored state")))?;

    let checkpoint = load_latest_checkpoint(store, &epic_id)
        .map_err(|e| HarnessError::run(e.to_string()))?;

    let tag = run_label(&epic_id);
    let work_items: Vec<_> = store
        .list_all()
        .map_err(|e| HarnessError::run(e.to_string()))?
        .into_iter()
        .filter(|i| {
            i.id != epic_id
                && i.has_label(&tag)
                && !i.has_label(CHECKPOINT_LABEL)
                && !i.has_label(REVIEW_LABEL)
        })
        .collect();

    let closed: Vec<String> = work_items
        .iter()
        .filter(|i| i.status == IssueStatus::Closed)
        .map(|i| i.id.clone())
        .collect();

    let mut report = ResumeReport::default();
    if let Some(checkpoint) = &checkpoint {
        report.closed_since_checkpoint = closed
            .iter()
            .filter(|id| !checkpoint.issues_completed.contains(id))
            .cloned()
            .collect();
        report.reopened_since_checkpoint = checkpoint
            .issues_completed
            .iter()
            .filter(|id| !closed.contains(id))
            .cloned()
            .collect();
        state.last_session_id = checkpoint.resume.last_session_id.clone();
        if checkpoint.resume.total_cost_usd > state.total_cost_usd {
            state.total_cost_usd = checkpoint.resume.total_cost_usd;
        }
        state.last_checkpoint = checkpoint.session_number;
    }

    // The store is authoritative for completion counts.
    state.features_completed = closed.len() as u32;
    report.checkpoint = checkpoint;

    info!(
        run = %epic_id,
        completed = state.features_completed,
        closed_delta = report.closed_since_checkpoint.len(),
        reopened_delta = report.reopened_since_checkpoint.len(),
        "run state reconstructed"
    );
    Ok((state, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{persist_checkpoint, CheckpointEngine, CheckpointPolicy, ResumeInfo};
    use crate::runner::{SessionOutcome, SessionResult};
    use crate::specfile::FeatureSpec;
    use crate::store::MemoryStore;
    use std::process::Command;
    use tempfile::tempdir;

    fn demo_spec() -> ProjectSpec {
        ProjectSpec {
            title: "Demo".into(),
            overview: Some("a demo".into()),
            property: None,
            complexity: None,
            features: vec![
                FeatureSpec {
                    title: "Alpha".into(),
                    priority: Some(1),
                    ..Default::default()
                },
                FeatureSpec {
                    title: "Beta".into(),
                    depends_on: vec!["Alpha".into()],
                    ..Default::default()
                },
            ],
        }
    }

    fn git_fixture() -> (tempfile::TempDir, Arc<GitWorkspace>) {
        let dir = tempdir().unwrap();
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

    #[tokio::test]
    async fn test_initialize_seeds_store_and_branch() {
        let (_dir, git) = git_fixture();
        let store: Arc<dyn IssueStore> = Arc::new(MemoryStore::new());
        let run = initialize_run(
            demo_spec(),
            &HarnessConfig::default(),
            Arc::clone(&store),
            Arc::clone(&git),
            InitOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(run.issue_ids.len(), 2);
        assert_eq!(run.state.features_total, 2);
        assert!(run.state.branch.starts_with("harness/demo-"));
        assert_eq!(git.current_branch().unwrap(), run.state.branch);

        // Beta is blocked by Alpha.
        let ready: Vec<String> = store
            .list_ready()
            .unwrap()
            .into_iter()
            .filter(|i| i.issue_type == IssueType::Feature)
            .map(|i| i.title)
            .collect();
        assert_eq!(ready, vec!["Alpha".to_string()]);

        // The epic carries the mirrored state.
        let epic = store.get(&run.state.id).unwrap();
        assert!(RunState::parse_mirror(&epic.description).is_some());
    }

    #[tokio::test]
    async fn test_initialize_without_branch() {
        let (_dir, git) = git_fixture();
        let store: Arc<dyn IssueStore> = Arc::new(MemoryStore::new());
        let before = git.current_branch().unwrap();
        let run = initialize_run(
            demo_spec(),
            &HarnessConfig::default(),
            store,
            Arc::clone(&git),
            InitOptions {
                create_branch: false,
            },
        )
        .await
        .unwrap();
        // Branch name computed but nothing was created.
        assert!(run.state.branch.starts_with("harness/demo-"));
        assert_eq!(git.current_branch().unwrap(), before);
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_spec() {
        let (_dir, git) = git_fixture();
        let store: Arc<dyn IssueStore> = Arc::new(MemoryStore::new());
        let err = initialize_run(
            ProjectSpec::default(),
            &HarnessConfig::default(),
            store,
            git,
            InitOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::SpecInvalid { .. }));
    }

    fn session(issue: &str, outcome: SessionOutcome) -> SessionResult {
        SessionResult {
            issue_id: issue.to_string(),
            outcome,
            summary: String::new(),
            git_commit: None,
            context_used: 0,
            duration_ms: 1,
            error: None,
            model: None,
            session_id: Some("s-77".into()),
            cost_usd: Some(0.5),
            num_turns: None,
            raw_output: String::new(),
        }
    }

    #[tokio::test]
    async fn test_resume_reconciles_with_store() {
        let (_dir, git) = git_fixture();
        let store: Arc<dyn IssueStore> = Arc::new(MemoryStore::new());
        let run = initialize_run(
            demo_spec(),
            &HarnessConfig::default(),
            Arc::clone(&store),
            git,
            InitOptions::default(),
        )
        .await
        .unwrap();
        let (alpha, beta) = (run.issue_ids[0].clone(), run.issue_ids[1].clone());

        // Alpha completes and a checkpoint is written.
        store.update_status(&alpha, IssueStatus::Closed).unwrap();
        let mut engine = CheckpointEngine::new(CheckpointPolicy::default());
        engine.record(session(&alpha, SessionOutcome::Success));
        let checkpoint = engine.build(
            &run.state.id,
            vec![],
            None,
            vec![],
            ResumeInfo {
                last_session_id: Some("s-77".into()),
                total_cost_usd: 0.5,
            },
        );
        persist_checkpoint(store.as_ref(), &checkpoint).unwrap();

        let mut state = run.state;
        state.start().unwrap();
        state.pause("operator").unwrap();
        state.mirror_to_store(store.as_ref()).unwrap();

        // After the pause, a human closes Beta directly in the store.
        store.update_status(&beta, IssueStatus::Closed).unwrap();

        let (resumed, report) = resume_run(store.as_ref(), Some(&state.id)).unwrap();
        // Store is authoritative: both issues count as completed.
        assert_eq!(resumed.features_completed, 2);
        assert_eq!(report.closed_since_checkpoint, vec![beta]);
        assert!(report.reopened_since_checkpoint.is_empty());
        assert_eq!(resumed.last_session_id.as_deref(), Some("s-77"));
        assert_eq!(resumed.last_checkpoint, 1);
    }

    #[tokio::test]
    async fn test_find_run_epic_latest() {
        let (_dir, git) = git_fixture();
        let store: Arc<dyn IssueStore> = Arc::new(MemoryStore::new());
        let first = initialize_run(
            demo_spec(),
            &HarnessConfig::default(),
            Arc::clone(&store),
            Arc::clone(&git),
            InitOptions {
                create_branch: false,
            },
        )
        .await
        .unwrap();
        let mut second_spec = demo_spec();
        second_spec.title = "Second".into();
        let second = initialize_run(
            second_spec,
            &HarnessConfig::default(),
            Arc::clone(&store),
            git,
            InitOptions {
                create_branch: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            find_run_epic(store.as_ref(), None).unwrap(),
            second.state.id
        );
        assert_eq!(
            find_run_epic(store.as_ref(), Some(&first.state.id)).unwrap(),
            first.state.id
        );
        assert!(find_run_epic(store.as_ref(), Some("missing")).is_err());
    }
}
