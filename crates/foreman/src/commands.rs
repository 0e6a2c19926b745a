//! CLI command implementations.

use crate::scheduler::{RunEnd, Scheduler};
use anyhow::{bail, Context, Result};
use orchestration::store::PAUSE_LABEL;
use orchestration::{
    find_run_epic, initialize_run, load_latest_checkpoint, resume_run, run_label,
    select_model_for_task, AgentSession, ContextBuilder, ContextInputs, ExperimentLog,
    GitWorkspace, HarnessConfig, InitOptions, IssueStatus, IssueStore, IssueType, JsonlStore,
    MemoryStore, ModelTier, NewIssue, ProjectSpec, RunState, SessionRequest, SessionRunner,
    TrackerCli,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Exit code for a run-level failure.
const EXIT_FAILURE: i32 = 1;

pub struct StartOpts {
    pub spec_path: PathBuf,
    pub checkpoint_every: Option<u32>,
    pub max_hours: Option<f64>,
    pub config: Option<PathBuf>,
    pub reviewers: Option<Vec<String>>,
    pub no_review: bool,
    pub review_block_high: bool,
    pub swarm: bool,
    pub max_agents: Option<usize>,
    pub min_tasks: Option<usize>,
    pub dry_run: bool,
}

pub struct WorkOpts {
    pub issue_id: Option<String>,
    pub create: Option<String>,
    pub model: Option<String>,
    pub config: Option<PathBuf>,
    pub full_context: bool,
    pub dry_run: bool,
}

/// Load config from an explicit path, the well-known location, or defaults.
pub fn load_config(path: Option<&Path>, cwd: &Path) -> Result<HarnessConfig> {
    if let Some(path) = path {
        return HarnessConfig::from_path(path).context("loading config");
    }
    let well_known = cwd.join(".foreman/config.yaml");
    if well_known.exists() {
        return HarnessConfig::from_path(&well_known).context("loading .foreman/config.yaml");
    }
    Ok(HarnessConfig::default())
}

/// The tracker CLI when it answers `--version`, else the JSONL fallback.
pub fn open_store(cwd: &Path) -> Arc<dyn IssueStore> {
    let bin = std::env::var("FOREMAN_TRACKER_BIN").unwrap_or_else(|_| "bd".into());
    let available = std::process::Command::new(&bin)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if available {
        info!(%bin, "using tracker CLI issue store");
        Arc::new(TrackerCli::new().with_cwd(cwd))
    } else {
        info!("tracker CLI unavailable, using JSONL fallback store");
        Arc::new(JsonlStore::at_root(cwd))
    }
}

/// Fold CLI flags into the loaded config.
fn apply_start_overrides(config: &mut HarnessConfig, opts: &StartOpts) {
    if let Some(n) = opts.checkpoint_every {
        config.checkpoint.after_sessions = n;
    }
    if opts.no_review {
        config.reviewers.enabled = false;
    }
    if opts.review_block_high {
        config.reviewers.policy.block_on_high = true;
    }
    if let Some(wanted) = &opts.reviewers {
        config
            .reviewers
            .panel
            .retain(|spec| wanted.iter().any(|w| spec.id.starts_with(w.as_str())));
    }
    if opts.swarm {
        config.swarm.enabled = true;
    }
    if let Some(n) = opts.max_agents {
        config.swarm.max_parallel_agents = n.max(1);
    }
    if let Some(n) = opts.min_tasks {
        config.swarm.min_tasks_for_swarm = n;
    }
}

/// Wire Ctrl-C to the scheduler's cancellation token.
fn wire_ctrl_c(scheduler: &Scheduler) {
    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping at the next session boundary");
            token.cancel();
        }
    });
}

fn report_end(end: RunEnd) -> i32 {
    match end {
        RunEnd::Completed => {
            println!("run completed");
            0
        }
        RunEnd::Paused(reason) => {
            println!("run paused: {reason}");
            0
        }
        RunEnd::Failed(reason) => {
            eprintln!("run failed: {reason}");
            EXIT_FAILURE
        }
    }
}

pub async fn start(opts: StartOpts) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let mut config = load_config(opts.config.as_deref(), &cwd)?;
    apply_start_overrides(&mut config, &opts);
    let spec = ProjectSpec::from_path(&opts.spec_path)?;
    let git = Arc::new(GitWorkspace::new(&cwd));

    if opts.dry_run {
        // Everything lands in an in-memory store; no branch is created.
        let store: Arc<dyn IssueStore> = Arc::new(MemoryStore::new());
        let run = initialize_run(
            spec,
            &config,
            Arc::clone(&store),
            git,
            InitOptions {
                create_branch: false,
            },
        )
        .await?;
        println!(
            "dry run: would start '{}' on branch {} with {} issue(s)",
            run.state.spec_title,
            run.state.branch,
            run.issue_ids.len()
        );
        for issue in store.list_ready().map_err(|e| anyhow::anyhow!(e))? {
            if issue.issue_type == IssueType::Feature {
                println!("  ready: {} {} ({})", issue.id, issue.title, issue.priority);
            }
        }
        println!(
            "  mode: {}",
            if config.swarm.enabled {
                "swarm"
            } else {
                "sequential"
            }
        );
        return Ok(0);
    }

    let store = open_store(&cwd);
    let run = initialize_run(
        spec,
        &config,
        Arc::clone(&store),
        Arc::clone(&git),
        InitOptions::default(),
    )
    .await?;
    println!(
        "run {} started on branch {} ({} issues)",
        run.state.id,
        run.state.branch,
        run.issue_ids.len()
    );

    let agent = Arc::new(SessionRunner::new(config.agent.command.clone()));
    let mut scheduler = Scheduler::new(run.state, config, store, agent, git)
        .with_max_hours(opts.max_hours)
        .with_experiment_log(ExperimentLog::at_root(&cwd));
    wire_ctrl_c(&scheduler);
    let end = scheduler.run().await?;
    Ok(report_end(end))
}

pub async fn work(opts: WorkOpts) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let config = load_config(opts.config.as_deref(), &cwd)?;
    let real_store = open_store(&cwd);
    // Dry runs absorb every write into a seeded in-memory copy.
    let store: Arc<dyn IssueStore> = if opts.dry_run {
        Arc::new(MemoryStore::seeded_from(real_store.as_ref()).map_err(|e| anyhow::anyhow!(e))?)
    } else {
        real_store
    };

    let issue_id = match (&opts.issue_id, &opts.create) {
        (Some(id), None) => id.clone(),
        (None, Some(title)) => store
            .create(
                NewIssue::new(title)
                    .with_type(IssueType::Task)
                    .with_description(title),
            )
            .map_err(|e| anyhow::anyhow!(e))?,
        _ => bail!("provide an issue id or --create \"<title>\""),
    };
    let issue = store.get(&issue_id).map_err(|e| anyhow::anyhow!(e))?;

    let git = GitWorkspace::new(&cwd);
    let mut builder = ContextBuilder::new(&cwd);
    if opts.full_context {
        builder = builder.full_context();
    }
    let inputs = ContextInputs {
        recent_commits: git.recent_commit_subjects(10).unwrap_or_default(),
        last_checkpoint_summary: None,
        redirect_notes: Vec::new(),
    };
    let prompt = builder.build(&issue, &inputs);

    let tier = match &opts.model {
        Some(tier) => tier
            .parse::<ModelTier>()
            .map_err(|e| anyhow::anyhow!(e))?,
        None => select_model_for_task(&config.routing, &issue),
    };
    let model = config.routing.models.name_for(tier).to_string();

    if opts.dry_run {
        println!("dry run: would run {model} against {issue_id}");
        println!("--- prompt ---\n{prompt}");
        return Ok(0);
    }

    let runner = SessionRunner::new(config.agent.command.clone());
    let mut request = SessionRequest::new(&issue.id, prompt, &cwd, &model);
    request.timeout = config.session_timeout();
    let result = runner.run_session(request).await;

    println!("outcome: {}", result.outcome);
    if let Some(commit) = &result.git_commit {
        println!("commit: {commit}");
    }
    println!("{}", result.summary);

    if result.is_success() {
        store
            .update_status(&issue.id, IssueStatus::Closed)
            .map_err(|e| anyhow::anyhow!(e))?;
        store
            .annotate(&issue.id, &format!("Closed by foreman work: {}", result.summary))
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(0)
    } else {
        if let Some(error) = &result.error {
            eprintln!("error: {error}");
        }
        Ok(EXIT_FAILURE)
    }
}

pub fn pause(reason: Option<String>, run_id: Option<String>) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let store = open_store(&cwd);
    let epic = find_run_epic(store.as_ref(), run_id.as_deref())?;
    let reason = reason.unwrap_or_else(|| "pause requested by operator".to_string());
    let marker = store
        .create(
            NewIssue::new("Pause requested")
                .with_type(IssueType::Chore)
                .with_label(PAUSE_LABEL)
                .with_label(run_label(&epic))
                .with_description(&reason),
        )
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("pause marker {marker} created for run {epic}; the scheduler will pause at the next boundary");
    Ok(0)
}

pub async fn resume(run_id: Option<String>, dry_run: bool) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let store = open_store(&cwd);
    let (state, report) = resume_run(store.as_ref(), run_id.as_deref())?;

    println!(
        "run {}: {} of {} features completed",
        state.id, state.features_completed, state.features_total
    );
    if let Some(checkpoint) = &report.checkpoint {
        println!(
            "last checkpoint #{} (confidence {:.2})",
            checkpoint.session_number, checkpoint.confidence
        );
    }
    for id in &report.closed_since_checkpoint {
        println!("  closed since checkpoint: {id}");
    }
    for id in &report.reopened_since_checkpoint {
        println!("  reopened since checkpoint: {id}");
    }
    if dry_run {
        return Ok(0);
    }

    // Clear any outstanding pause markers before running again.
    let tag = run_label(&state.id);
    for marker in store
        .list_all()
        .map_err(|e| anyhow::anyhow!(e))?
        .into_iter()
        .filter(|i| i.is_open() && i.has_label(PAUSE_LABEL) && i.has_label(&tag))
    {
        store
            .update_status(&marker.id, IssueStatus::Closed)
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    // The branch must exist from initialization; check it out if needed.
    let git = Arc::new(GitWorkspace::new(&cwd));
    if git.branch_exists(&state.branch)
        && git.current_branch().ok().as_deref() != Some(state.branch.as_str())
    {
        git.checkout(&state.branch)?;
    }

    if state.status.is_terminal() {
        bail!("run {} is already {}", state.id, state.status);
    }

    let config = load_config(None, &cwd)?;
    let agent = Arc::new(SessionRunner::new(config.agent.command.clone()));
    let mut scheduler = Scheduler::new(state, config, store, agent, git)
        .with_experiment_log(ExperimentLog::at_root(&cwd));
    wire_ctrl_c(&scheduler);
    let end = scheduler.run().await?;
    Ok(report_end(end))
}

pub fn status(run_id: Option<String>) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let store = open_store(&cwd);
    let epic_id = find_run_epic(store.as_ref(), run_id.as_deref())?;
    let epic = store.get(&epic_id).map_err(|e| anyhow::anyhow!(e))?;

    match RunState::parse_mirror(&epic.description) {
        Some(state) => {
            println!("run {} — {}", state.id, state.status);
            println!("  spec: {}", state.spec_title);
            println!("  branch: {}", state.branch);
            println!(
                "  sessions: {} started, {} completed",
                state.current_session, state.sessions_completed
            );
            println!(
                "  features: {}/{} completed, {} failed",
                state.features_completed, state.features_total, state.features_failed
            );
            println!("  cost: ${:.2}", state.total_cost_usd);
            if let Some(reason) = &state.pause_reason {
                println!("  paused: {reason}");
            }
        }
        None => println!("run {epic_id} has no mirrored state yet"),
    }

    if let Some(checkpoint) =
        load_latest_checkpoint(store.as_ref(), &epic_id).map_err(|e| anyhow::anyhow!(e))?
    {
        println!(
            "latest checkpoint #{} at {} — confidence {:.2}",
            checkpoint.session_number, checkpoint.timestamp, checkpoint.confidence
        );
        println!("  {}", checkpoint.summary);
        if !checkpoint.redirect_notes.is_empty() {
            for note in &checkpoint.redirect_notes {
                println!("  redirect: {note}");
            }
        }
    } else {
        println!("no checkpoints yet");
    }
    Ok(0)
}

pub fn stop() -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let store = open_store(&cwd);
    let epic_id = find_run_epic(store.as_ref(), None)?;
    store
        .annotate(&epic_id, "Stop requested by operator.")
        .map_err(|e| anyhow::anyhow!(e))?;
    store
        .update_status(&epic_id, IssueStatus::Closed)
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("run {epic_id} stopped (epic closed); the scheduler will pause at the next boundary");
    Ok(0)
}
