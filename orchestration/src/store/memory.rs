//! In-memory issue store for dry runs and tests.

use super::types::{Dependency, Issue, IssueStatus, IssueType, NewIssue, Priority};
use super::{AdapterError, AdapterResult, IssueStore};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Mutex-guarded map of issues with a monotonically increasing id counter.
///
/// Used directly by `--dry-run` (seeded from the real store, absorbing all
/// writes) and as the store fake in tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    issues: BTreeMap<String, Issue>,
    next_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone every record out of another store, absorbing future writes
    /// locally. Read errors propagate.
    pub fn seeded_from(source: &dyn IssueStore) -> AdapterResult<Self> {
        let store = Self::new();
        {
            let mut inner = store.inner.lock().expect("store lock");
            for issue in source.list_all()? {
                inner.issues.insert(issue.id.clone(), issue);
            }
            inner.next_id = inner.issues.len() as u64;
        }
        Ok(store)
    }

    /// Insert a fully-formed issue (test setup).
    pub fn insert(&self, issue: Issue) {
        let mut inner = self.inner.lock().expect("store lock");
        inner.issues.insert(issue.id.clone(), issue);
    }

    fn with_issue<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Issue) -> T,
    ) -> AdapterResult<T> {
        let mut inner = self.inner.lock().expect("store lock");
        let issue = inner
            .issues
            .get_mut(id)
            .ok_or_else(|| AdapterError::not_found(format!("issue {id} not found")))?;
        let result = f(issue);
        // updated_at is monotonic even when the wall clock is not.
        let now = Utc::now();
        issue.updated_at = if now > issue.updated_at {
            now
        } else {
            issue.updated_at + Duration::milliseconds(1)
        };
        Ok(result)
    }
}

impl IssueStore for MemoryStore {
    fn list_all(&self) -> AdapterResult<Vec<Issue>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.issues.values().cloned().collect())
    }

    fn create(&self, new: NewIssue) -> AdapterResult<String> {
        if new.description.trim().is_empty() {
            return Err(AdapterError::permanent(
                "tracker rejects an empty description",
            ));
        }
        let mut inner = self.inner.lock().expect("store lock");
        inner.next_id += 1;
        let id = format!("fm-{}", inner.next_id);
        let now = Utc::now();
        let issue = Issue {
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
        };
        inner.issues.insert(id.clone(), issue);
        Ok(id)
    }

    fn update_status(&self, id: &str, status: IssueStatus) -> AdapterResult<()> {
        self.with_issue(id, |issue| {
            issue.status = status;
            issue.closed_at = match status {
                IssueStatus::Closed => Some(Utc::now()),
                _ => None,
            };
        })
    }

    fn update_priority(&self, id: &str, priority: Priority) -> AdapterResult<()> {
        self.with_issue(id, |issue| issue.priority = priority)
    }

    fn add_dependency(
        &self,
        from: &str,
        to: &str,
        kind: super::DependencyKind,
    ) -> AdapterResult<()> {
        // Validate the target exists first.
        self.get(to)?;
        self.with_issue(from, |issue| {
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
        self.with_issue(id, |issue| {
            issue.labels.insert(label.to_string());
        })
    }

    fn remove_label(&self, id: &str, label: &str) -> AdapterResult<()> {
        self.with_issue(id, |issue| {
            issue.labels.remove(label);
        })
    }

    fn annotate(&self, id: &str, markdown: &str) -> AdapterResult<()> {
        self.with_issue(id, |issue| {
            if !issue.description.is_empty() {
                issue.description.push_str("\n\n---\n\n");
            }
            issue.description.push_str(markdown);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DependencyKind;

    #[test]
    fn test_create_assigns_sequential_ids() {
        let store = MemoryStore::new();
        let a = store.create(NewIssue::new("a").with_description("x")).unwrap();
        let b = store.create(NewIssue::new("b").with_description("y")).unwrap();
        assert_eq!(a, "fm-1");
        assert_eq!(b, "fm-2");
    }

    #[test]
    fn test_create_rejects_empty_description() {
        let store = MemoryStore::new();
        let err = store.create(NewIssue::new("no body")).unwrap_err();
        assert!(err.to_string().contains("description"));
    }

    #[test]
    fn test_updated_at_monotonic() {
        let store = MemoryStore::new();
        let id = store.create(NewIssue::new("a").with_description("x")).unwrap();
        let before = store.get(&id).unwrap().updated_at;
        store.add_label(&id, "l1").unwrap();
        let mid = store.get(&id).unwrap().updated_at;
        store.add_label(&id, "l2").unwrap();
        let after = store.get(&id).unwrap().updated_at;
        assert!(before < mid);
        assert!(mid < after);
    }

    #[test]
    fn test_close_sets_closed_at() {
        let store = MemoryStore::new();
        let id = store.create(NewIssue::new("a").with_description("x")).unwrap();
        store.update_status(&id, IssueStatus::Closed).unwrap();
        let issue = store.get(&id).unwrap();
        assert!(issue.closed_at.is_some());
        store.update_status(&id, IssueStatus::Open).unwrap();
        assert!(store.get(&id).unwrap().closed_at.is_none());
    }

    #[test]
    fn test_add_dependency_requires_target() {
        let store = MemoryStore::new();
        let a = store.create(NewIssue::new("a").with_description("x")).unwrap();
        let err = store
            .add_dependency(&a, "missing", DependencyKind::Blocks)
            .unwrap_err();
        assert_eq!(err.kind, crate::store::AdapterErrorKind::NotFound);
    }

    #[test]
    fn test_dependency_dedup() {
        let store = MemoryStore::new();
        let a = store.create(NewIssue::new("a").with_description("x")).unwrap();
        let b = store.create(NewIssue::new("b").with_description("y")).unwrap();
        store.add_dependency(&b, &a, DependencyKind::Blocks).unwrap();
        store.add_dependency(&b, &a, DependencyKind::Blocks).unwrap();
        assert_eq!(store.get(&b).unwrap().dependencies.len(), 1);
    }

    #[test]
    fn test_annotate_appends() {
        let store = MemoryStore::new();
        let id = store
            .create(NewIssue::new("a").with_description("body"))
            .unwrap();
        store.annotate(&id, "first note").unwrap();
        store.annotate(&id, "second note").unwrap();
        let issue = store.get(&id).unwrap();
        assert!(issue.description.starts_with("body"));
        assert!(issue.description.contains("first note"));
        assert!(issue.description.contains("second note"));
    }

    #[test]
    fn test_seeded_from() {
        let source = MemoryStore::new();
        source.create(NewIssue::new("a").with_description("x")).unwrap();
        let copy = MemoryStore::seeded_from(&source).unwrap();
        copy.create(NewIssue::new("b").with_description("y")).unwrap();
        // Writes to the copy never reach the source.
        assert_eq!(source.list_all().unwrap().len(), 1);
        assert_eq!(copy.list_all().unwrap().len(), 2);
    }
}
