//! Bridge to the ticket-tracker CLI binary.
//!
//! The tracker is a binary-only tool, so we shell out. The binary name is
//! read from the `FOREMAN_TRACKER_BIN` env var, defaulting to `"bd"`.
//! Identifier arguments are validated against shell metacharacters and
//! free text is capped before it reaches a command line.

use super::types::{
    Dependency, DependencyKind, Issue, IssueStatus, IssueType, NewIssue, Priority,
};
use super::{AdapterError, AdapterResult, IssueStore};
use crate::shell_safety::{truncate_text, validate_arg};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Command;

/// An issue as returned by `<tracker> list --json`.
#[derive(Debug, Clone, Deserialize)]
struct TrackerIssue {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    status: String,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(rename = "type", default)]
    issue_type: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: Vec<TrackerDependency>,
}

#[derive(Debug, Clone, Deserialize)]
struct TrackerDependency {
    depends_on: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

fn parse_issue_type(raw: Option<&str>) -> IssueType {
    match raw.map(|s| s.to_ascii_lowercase()) {
        Some(ref s) if s == "bug" => IssueType::Bug,
        Some(ref s) if s == "feature" => IssueType::Feature,
        Some(ref s) if s == "epic" => IssueType::Epic,
        Some(ref s) if s == "chore" => IssueType::Chore,
        _ => IssueType::Task,
    }
}

fn parse_dependency_kind(raw: Option<&str>) -> DependencyKind {
    match raw.map(|s| s.to_ascii_lowercase()) {
        Some(ref s) if s == "parent-child" => DependencyKind::ParentChild,
        Some(ref s) if s == "related" => DependencyKind::Related,
        Some(ref s) if s == "discovered-from" => DependencyKind::DiscoveredFrom,
        _ => DependencyKind::Blocks,
    }
}

impl TrackerIssue {
    fn into_issue(self) -> AdapterResult<Issue> {
        let status: IssueStatus = self
            .status
            .parse()
            .map_err(AdapterError::permanent)?;
        let now = Utc::now();
        Ok(Issue {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            priority: self.priority.map(Priority::new).unwrap_or_default(),
            issue_type: parse_issue_type(self.issue_type.as_deref()),
            labels: self.labels.into_iter().collect::<BTreeSet<_>>(),
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at.unwrap_or(now),
            closed_at: self.closed_at,
            metadata: self.metadata,
            dependencies: self
                .dependencies
                .into_iter()
                .map(|d| Dependency {
                    depends_on: d.depends_on,
                    kind: parse_dependency_kind(d.kind.as_deref()),
                })
                .collect(),
        })
    }
}

/// Issue store backed by the tracker CLI.
pub struct TrackerCli {
    bin: String,
    /// Working directory for tracker invocations (the repo root).
    cwd: Option<PathBuf>,
}

impl Default for TrackerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerCli {
    pub fn new() -> Self {
        Self {
            bin: std::env::var("FOREMAN_TRACKER_BIN").unwrap_or_else(|_| "bd".into()),
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Run the tracker binary and return trimmed stdout.
    fn run(&self, args: &[String]) -> AdapterResult<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd.output().map_err(|e| {
            AdapterError::permanent(format!("failed to run `{}`: {e}", self.bin))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_cli_failure(&self.bin, args, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn checked_id<'a>(&self, id: &'a str) -> AdapterResult<&'a str> {
        validate_arg(id)
            .map_err(|e| AdapterError::permanent(format!("bad issue id {id:?}: {e}")))?;
        Ok(id)
    }
}

/// Map a tracker CLI failure onto the adapter taxonomy by stderr heuristics.
fn classify_cli_failure(bin: &str, args: &[String], stderr: &str) -> AdapterError {
    let lower = stderr.to_lowercase();
    let message = format!(
        "`{bin} {}` failed: {}",
        args.first().map(String::as_str).unwrap_or(""),
        truncate_text(stderr.trim())
    );
    if lower.contains("not found") || lower.contains("no such issue") {
        AdapterError::not_found(message)
    } else if lower.contains("lock")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("busy")
        || lower.contains("connection")
        || lower.contains("temporarily")
    {
        AdapterError::transient(message)
    } else {
        AdapterError::permanent(message)
    }
}

impl IssueStore for TrackerCli {
    fn list_all(&self) -> AdapterResult<Vec<Issue>> {
        let stdout = self.run(&[
            "list".to_string(),
            "--all".to_string(),
            "--json".to_string(),
        ])?;
        if stdout.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<TrackerIssue> = serde_json::from_str(&stdout).map_err(|e| {
            AdapterError::permanent(format!("failed to parse `{} list` output: {e}", self.bin))
        })?;
        raw.into_iter().map(TrackerIssue::into_issue).collect()
    }

    fn create(&self, new: NewIssue) -> AdapterResult<String> {
        if new.description.trim().is_empty() {
            return Err(AdapterError::permanent(
                "tracker rejects an empty description",
            ));
        }
        let title: String = new
            .title
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        let mut args = vec![
            "create".to_string(),
            format!("--title={title}"),
            format!("--type={}", new.issue_type.unwrap_or(IssueType::Task)),
            format!("--priority={}", new.priority.unwrap_or_default().level()),
            format!("--description={}", truncate_text(&new.description)),
        ];
        for label in &new.labels {
            validate_arg(label)
                .map_err(|e| AdapterError::permanent(format!("bad label {label:?}: {e}")))?;
            args.push(format!("--label={label}"));
        }
        let stdout = self.run(&args)?;
        // The tracker prints the new id on the first line.
        let id = stdout
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if id.is_empty() {
            return Err(AdapterError::permanent(format!(
                "`{} create` returned no id",
                self.bin
            )));
        }
        Ok(id)
    }

    fn update_status(&self, id: &str, status: IssueStatus) -> AdapterResult<()> {
        let id = self.checked_id(id)?;
        self.run(&[
            "update".to_string(),
            id.to_string(),
            format!("--status={status}"),
        ])?;
        Ok(())
    }

    fn update_priority(&self, id: &str, priority: Priority) -> AdapterResult<()> {
        let id = self.checked_id(id)?;
        self.run(&[
            "update".to_string(),
            id.to_string(),
            format!("--priority={}", priority.level()),
        ])?;
        Ok(())
    }

    fn add_dependency(&self, from: &str, to: &str, kind: DependencyKind) -> AdapterResult<()> {
        let from = self.checked_id(from)?;
        let to = self.checked_id(to)?;
        let kind = serde_json::to_value(kind)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "blocks".to_string());
        self.run(&[
            "dep".to_string(),
            "add".to_string(),
            from.to_string(),
            to.to_string(),
            format!("--type={kind}"),
        ])?;
        Ok(())
    }

    fn add_label(&self, id: &str, label: &str) -> AdapterResult<()> {
        let id = self.checked_id(id)?;
        validate_arg(label)
            .map_err(|e| AdapterError::permanent(format!("bad label {label:?}: {e}")))?;
        self.run(&[
            "label".to_string(),
            "add".to_string(),
            id.to_string(),
            label.to_string(),
        ])?;
        Ok(())
    }

    fn remove_label(&self, id: &str, label: &str) -> AdapterResult<()> {
        let id = self.checked_id(id)?;
        validate_arg(label)
            .map_err(|e| AdapterError::permanent(format!("bad label {label:?}: {e}")))?;
        self.run(&[
            "label".to_string(),
            "remove".to_string(),
            id.to_string(),
            label.to_string(),
        ])?;
        Ok(())
    }

    fn annotate(&self, id: &str, markdown: &str) -> AdapterResult<()> {
        let id = self.checked_id(id)?;
        self.run(&[
            "comment".to_string(),
            "add".to_string(),
            id.to_string(),
            format!("--text={}", truncate_text(markdown)),
        ])?;
        Ok(())
    }
}
