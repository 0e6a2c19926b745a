//! Baseline gates — pre-work quality checks with auto-fix.
//!
//! An ordered set of shell commands (typecheck, lint, tests, build, plus
//! user-defined gates), each with its own timeout and optional fix command.
//! A failed gate with a fix command gets the fix run once and is
//! re-evaluated; persistent failures turn into blocker issues that stop
//! non-blocker scheduling until cleared.

use crate::shell_safety::truncate_to;
use crate::store::{
    run_label, AdapterResult, IssueStore, IssueType, NewIssue, Priority, BLOCKER_LABEL,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Cap on captured stderr per gate.
const STDERR_EXCERPT_BYTES: usize = 4096;

/// One shell check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub command: String,
    #[serde(default = "default_gate_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_command: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_gate_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl GateSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout_secs: default_gate_timeout(),
            fix_command: None,
            enabled: true,
        }
    }

    pub fn with_fix(mut self, fix_command: impl Into<String>) -> Self {
        self.fix_command = Some(fix_command.into());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Standard gate set for a cargo project; config replaces these for
    /// other stacks.
    pub fn default_gates() -> Vec<GateSpec> {
        vec![
            GateSpec::new("typecheck", "cargo check --all-targets"),
            GateSpec::new("lint", "cargo clippy --all-targets -- -D warnings")
                .with_fix("cargo clippy --fix --allow-dirty --allow-staged"),
            GateSpec::new("tests", "cargo test"),
            GateSpec::new("build", "cargo build"),
        ]
    }
}

/// How one gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    /// Failed, fix ran, re-check passed.
    FixedThenPassed,
    Failed,
    TimedOut,
}

impl GateOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed | Self::FixedThenPassed)
    }
}

/// Result of one gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub outcome: GateOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_excerpt: Option<String>,
    pub fix_attempted: bool,
}

/// Results of one full gate pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRunReport {
    pub results: Vec<GateResult>,
}

impl GateRunReport {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_pass())
    }

    pub fn failed(&self) -> Vec<&GateResult> {
        self.results.iter().filter(|r| !r.outcome.is_pass()).collect()
    }

    pub fn summary(&self) -> String {
        self.results
            .iter()
            .map(|r| format!("{}:{:?}", r.gate, r.outcome))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Rolling health record across gate passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateHealth {
    pub total_runs: u64,
    pub clean_passes: u64,
    pub passes_after_fix: u64,
    pub failures_by_gate: HashMap<String, u64>,
}

impl GateHealth {
    pub fn record(&mut self, report: &GateRunReport) {
        self.total_runs += 1;
        if report.all_passed() {
            if report
                .results
                .iter()
                .any(|r| r.outcome == GateOutcome::FixedThenPassed)
            {
                self.passes_after_fix += 1;
            } else {
                self.clean_passes += 1;
            }
        }
        for result in report.failed() {
            *self.failures_by_gate.entry(result.gate.clone()).or_insert(0) += 1;
        }
    }

    /// The gate that fails most often, if any has failed.
    pub fn most_failing(&self) -> Option<(&str, u64)> {
        self.failures_by_gate
            .iter()
            .max_by_key(|(name, count)| (**count, std::cmp::Reverse(name.as_str())))
            .map(|(name, count)| (name.as_str(), *count))
    }
}

/// Gate engine bound to one working tree.
pub struct BaselineGates {
    gates: Vec<GateSpec>,
    cwd: PathBuf,
    health: GateHealth,
}

impl BaselineGates {
    pub fn new(gates: Vec<GateSpec>, cwd: impl AsRef<Path>) -> Self {
        Self {
            gates,
            cwd: cwd.as_ref().to_path_buf(),
            health: GateHealth::default(),
        }
    }

    pub fn health(&self) -> &GateHealth {
        &self.health
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> Option<(bool, i32, String)> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.cwd)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(timeout, child).await {
            Err(_) => None,
            Ok(Err(e)) => Some((false, -1, format!("failed to run: {e}"))),
            Ok(Ok(output)) => Some((
                output.status.success(),
                output.status.code().unwrap_or(-1),
                truncate_to(
                    String::from_utf8_lossy(&output.stderr).trim(),
                    STDERR_EXCERPT_BYTES,
                ),
            )),
        }
    }

    async fn evaluate_gate(&self, gate: &GateSpec) -> GateResult {
        let timeout = Duration::from_secs(gate.timeout_secs);
        let started = Instant::now();

        let first = self.run_command(&gate.command, timeout).await;
        match first {
            None => {
                warn!(gate = %gate.name, "gate timed out");
                return GateResult {
                    gate: gate.name.clone(),
                    outcome: GateOutcome::TimedOut,
                    duration_ms: started.elapsed().as_millis() as u64,
                    exit_code: None,
                    stderr_excerpt: None,
                    fix_attempted: false,
                };
            }
            Some((true, code, _)) => {
                return GateResult {
                    gate: gate.name.clone(),
                    outcome: GateOutcome::Passed,
                    duration_ms: started.elapsed().as_millis() as u64,
                    exit_code: Some(code),
                    stderr_excerpt: None,
                    fix_attempted: false,
                };
            }
            Some((false, code, stderr)) => {
                let Some(fix) = &gate.fix_command else {
                    return GateResult {
                        gate: gate.name.clone(),
                        outcome: GateOutcome::Failed,
                        duration_ms: started.elapsed().as_millis() as u64,
                        exit_code: Some(code),
                        stderr_excerpt: Some(stderr),
                        fix_attempted: false,
                    };
                };

                info!(gate = %gate.name, "gate failed, running fix command once");
                let _ = self.run_command(fix, timeout).await;
                let recheck = self.run_command(&gate.command, timeout).await;
                match recheck {
                    Some((true, recheck_code, _)) => GateResult {
                        gate: gate.name.clone(),
                        outcome: GateOutcome::FixedThenPassed,
                        duration_ms: started.elapsed().as_millis() as u64,
                        exit_code: Some(recheck_code),
                        stderr_excerpt: None,
                        fix_attempted: true,
                    },
                    Some((false, recheck_code, recheck_stderr)) => GateResult {
                        gate: gate.name.clone(),
                        outcome: GateOutcome::Failed,
                        duration_ms: started.elapsed().as_millis() as u64,
                        exit_code: Some(recheck_code),
                        stderr_excerpt: Some(recheck_stderr),
                        fix_attempted: true,
                    },
                    None => GateResult {
                        gate: gate.name.clone(),
                        outcome: GateOutcome::TimedOut,
                        duration_ms: started.elapsed().as_millis() as u64,
                        exit_code: Some(code),
                        stderr_excerpt: Some(stderr),
                        fix_attempted: true,
                    },
                }
            }
        }
    }

    /// Run every enabled gate in order and record health.
    pub async fn run_all(&mut self) -> GateRunReport {
        let mut results = Vec::new();
        for gate in self.gates.iter().filter(|g| g.enabled) {
            let result = self.evaluate_gate(gate).await;
            info!(
                gate = %result.gate,
                outcome = ?result.outcome,
                duration_ms = result.duration_ms,
                "gate evaluated"
            );
            results.push(result);
        }
        let report = GateRunReport { results };
        self.health.record(&report);
        report
    }
}

/// Create blocker issues for persistently failed gates; returns new ids.
/// Skips gates that already have an open blocker.
pub fn create_blockers(
    store: &dyn IssueStore,
    report: &GateRunReport,
    run_id: &str,
) -> AdapterResult<Vec<String>> {
    let open_blockers: Vec<String> = store
        .list_all()?
        .into_iter()
        .filter(|i| i.is_open() && i.has_label(BLOCKER_LABEL))
        .map(|i| i.title)
        .collect();

    let mut created = Vec::new();
    for failed in report.failed() {
        let title = format!("Gate '{}' failing", failed.gate);
        if open_blockers.contains(&title) {
            continue;
        }
        let description = format!(
            "Baseline gate `{}` is failing (exit code {:?}).\n\n```\n{}\n```",
            failed.gate,
            failed.exit_code,
            failed.stderr_excerpt.as_deref().unwrap_or("(no stderr)"),
        );
        let id = store.create(
            NewIssue::new(title)
                .with_type(IssueType::Bug)
                .with_priority(Priority::HIGHEST)
                .with_label(BLOCKER_LABEL)
                .with_label(run_label(run_id))
                .with_description(description),
        )?;
        warn!(gate = %failed.gate, blocker = %id, "created gate blocker issue");
        created.push(id);
    }
    Ok(created)
}

/// Whether any open blocker issues exist.
pub fn has_open_blockers(store: &dyn IssueStore) -> AdapterResult<bool> {
    Ok(store
        .list_all()?
        .iter()
        .any(|i| i.is_open() && i.has_label(BLOCKER_LABEL)))
}
