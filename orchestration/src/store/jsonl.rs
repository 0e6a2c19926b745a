//! Line-delimited JSON fallback store.
//!
//! When no tracker CLI is installed, issues live in a JSONL file at a
//! well-known path (`.foreman/issues.jsonl`), one record per line. Every
//! operation is load → modify → atomically rewrite, serialised by a lock so
//! in-process writes are visible to the next read.

use super::types::{Dependency, Issue, IssueStatus, IssueType, NewIssue, Priority};
use super::{AdapterError, AdapterResult, IssueStore};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default store location relative to the repo root.
pub const DEFAULT_JSONL_PATH: &str = ".foreman/issues.jsonl";

pub struct JsonlStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlStore {
    /// Store rooted at `repo_root/.foreman/issues.jsonl`.
    pub fn at_root(repo_root: impl AsRef<Path>) -> Self {
        Self::new(repo_root.as_ref().join(DEFAULT_JSONL_PATH))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> AdapterResult<Vec<Issue>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| AdapterError::transient(format!("read {}: {e}", self.path.display())))?;
        let mut issues = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let issue: Issue = serde_json::from_str(line).map_err(|e| {
                AdapterError::permanent(format!(
                    "corrupt record at {}:{}: {e}",
                    self.path.display(),
                    lineno + 1
                ))
            })?;
            issues.push(issue);
        }
        Ok(issues)
    }

    /// Write all records to a temp file, then rename over the store.
    fn save(&self, issues: &[Issue]) -> AdapterResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AdapterError::transient(format!("mkdir {}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)
                .map_err(|e| AdapterError::transient(format!("create {}: {e}", tmp.display())))?;
            for issue in issues {
                let line = serde_json::to_string(issue)
                    .map_err(|e| AdapterError::permanent(format!("serialize issue: {e}")))?;
                writeln!(file, "{line}")
                    .map_err(|e| AdapterError::transient(format!("write: {e}")))?;
            }
        }
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| AdapterError::transient(format!("rename: {e}")))?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Issue) -> T,
    ) -> AdapterResult<T> {
        let _guard = self.lock.lock().expect("store lock");
        let mut issues = self.load()?;
        let issue = issues
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| AdapterError::not_found(format!("issue {id} not found")))?;
        let result = f(issue);
        let now = Utc::now();
        issue.updated_at = if now > issue.updated_at {
            now
        } else {
            issue.updated_at + Duration::milliseconds(1)
        };
        self.save(&issues)?;
        Ok(result)
    }
}

impl IssueStore for JsonlStore {
    fn list_all(&self) -> AdapterResult<Vec<Issue>> {
        let _guard = self.lock.lock().expect("store lock");
        self.load()
    }

    fn create(&self, new: NewIssue) -> AdapterResult<String> {
        if new.description.trim().is_empty() {
            return Err(AdapterError::permanent(
                "tracker rejects an empty description",
            ));
        }
        let _guard = self.lock.lock().expect("store lock");
        let mut issues = self.load()?;
        let id = format!("fm-{}", issues.len() as u64 + 1);
        let now = Utc::now();
        issues.push(Issue {
            id: id.clone(),
            title: new.title,
            description: new.description,
            status: IssueStatus::Open,
            priority: new.priority.unwrap_or_default(),
            issue_type: new.issue_type.unwrap_or(IssueType::Task),
            labels: new.labels.into_iter().collect(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            metadata: BTreeMap::new(),
            dependencies: Vec::new(),
        });
        self.save(&issues)?;
        Ok(id)
    }

    fn update_status(&self, id: &str, status: IssueStatus) -> AdapterResult<()> {
        self.mutate(id, |issue| {
            issue.status = status;
            issue.closed_at = match status {
                IssueStatus::Closed => Some(Utc::now()),
                _ => None,
            };
        })
    }

    fn update_priority(&self, id: &str, priority: Priority) -> AdapterResult<()> {
        self.mutate(id, |issue| issue.priority = priority)
    }

    fn add_dependency(
        &self,
        from: &str,
        to: &str,
        kind: super::DependencyKind,
    ) -> AdapterResult<()> {
        {
            let _guard = self.lock.lock().expect("store lock");
            let issues = self.load()?;
            if !issues.iter().any(|i| i.id == to) {
                return Err(AdapterError::not_found(format!("issue {to} not found")));
            }
        }
        self.mutate(from, |issue| {
            let dep = Dependency {
                depends_on: to.to_string(),
                kind,
            };
            if !issue.dependencies.contains(&dep) {
                issue.dependencies.push(dep);
            }
        })
    }

    fn add_label(&self, id: &str, label: &str) -> AdapterResult<()> {
        self.mutate(id, |issue| {
            issue.labels.insert(label.to_string());
        })
    }

    fn remove_label(&self, id: &str, label: &str) -> AdapterResult<()> {
        self.mutate(id, |issue| {
            issue.labels.remove(label);
        })
    }

    fn annotate(&self, id: &str, markdown: &str) -> AdapterResult<()> {
        self.mutate(id, |issue| {
            if !issue.description.is_empty() {
                issue.description.push_str("\n\n---\n\n");
            }
            issue.description.push_str(markdown);
        })
    }
}
