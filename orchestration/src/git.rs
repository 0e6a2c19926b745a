//! Git plumbing for the working tree.
//!
//! The harness owns one dedicated branch per run (`harness/<slug>-<date>`)
//! and only ever reads history and diffs beyond that; commits come from the
//! agent, and nothing is pushed.

use crate::error::{HarnessError, HarnessResult};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Default number of retry attempts for transient git failures
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Git state manager for one working tree.
pub struct GitWorkspace {
    working_dir: PathBuf,
    max_retries: u32,
}

impl GitWorkspace {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run git and return trimmed stdout.
    fn run_git(&self, args: &[&str]) -> HarnessResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| HarnessError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::git(args.join(" "), stderr.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git with retry for transient failures (lock contention).
    /// Backoff: 100ms, 200ms, 400ms, ...
    fn run_git_with_retry(&self, args: &[&str]) -> HarnessResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run_git(args) {
                Ok(output) => return Ok(output),
                Err(e) => {
                    if e.is_retryable() && attempt < self.max_retries {
                        let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                        std::thread::sleep(std::time::Duration::from_millis(delay));
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| HarnessError::git("retry", "max retries exceeded")))
    }

    pub fn current_branch(&self) -> HarnessResult<String> {
        self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Current commit hash (short).
    pub fn current_commit(&self) -> HarnessResult<String> {
        self.run_git(&["rev-parse", "--short", "HEAD"])
    }

    pub fn current_commit_full(&self) -> HarnessResult<String> {
        self.run_git(&["rev-parse", "HEAD"])
    }

    pub fn has_uncommitted_changes(&self) -> HarnessResult<bool> {
        let status = self.run_git(&["status", "--porcelain"])?;
        Ok(!status.is_empty())
    }

    /// Subject lines of the most recent commits, newest first.
    pub fn recent_commit_subjects(&self, count: usize) -> HarnessResult<Vec<String>> {
        let output = self.run_git(&["log", "--format=%s", &format!("-{count}")])?;
        Ok(output
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Diff between two commits (unified patch text).
    pub fn diff(&self, from: &str, to: &str) -> HarnessResult<String> {
        self.run_git(&["diff", from, to])
    }

    /// Diff of everything since `commit` (committed and uncommitted).
    pub fn diff_since(&self, commit: &str) -> HarnessResult<String> {
        self.run_git(&["diff", commit])
    }

    /// Create and check out the dedicated run branch:
    /// `harness/<slug>-<YYYYMMDD>`. Returns the branch name.
    pub fn create_run_branch(&self, title: &str) -> HarnessResult<String> {
        let branch = run_branch_name(title);
        self.run_git_with_retry(&["checkout", "-b", &branch])?;
        Ok(branch)
    }

    pub fn checkout(&self, branch: &str) -> HarnessResult<()> {
        self.run_git_with_retry(&["checkout", branch])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> HarnessResult<()> {
        self.run_git(&["branch", "-D", branch])?;
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.run_git(&["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .is_ok()
    }
}

/// Run branch name for a spec title, dated today.
pub fn run_branch_name(title: &str) -> String {
    format!("harness/{}-{}", slugify(title), Utc::now().format("%Y%m%d"))
}

/// Lowercase, alphanumeric-and-dash slug, capped at 40 chars.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "run".to_string()
    } else {
        slug
    }
}
