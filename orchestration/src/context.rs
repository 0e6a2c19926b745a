//! Context discovery — composes the priming prompt for an agent session.
//!
//! Deterministic assembly from the issue, recent git history, the last
//! checkpoint, accumulated redirect notes, and a bounded keyword scan of the
//! working tree. The output is a single markdown document.

use crate::store::Issue;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

/// Words dropped from issue titles before keyword matching.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "for", "with", "to", "of", "in", "on", "at", "by",
    "from", "into", "over", "when", "that", "this", "it", "is", "are", "be", "as",
    "add", "fix", "implement", "support", "make", "use", "update", "create", "new",
    "remove", "should", "can", "not",
];

/// Static guidance included in every prompt.
const DRY_GUIDANCE: &[&str] = &[
    "Search for existing helpers before writing new ones; extend rather than duplicate.",
    "Follow the conventions already present in neighbouring files.",
    "Commit once with a descriptive subject line when the change is complete.",
    "State `## Summary` at the end of your output with what was done.",
];

/// Domain hints keyed off label substrings.
const DOMAIN_HINTS: &[(&str, &str)] = &[
    ("api", "Keep request/response shapes backward compatible; update any schema or contract files."),
    ("ui", "Match the existing component structure and styling approach; avoid new dependencies."),
    ("db", "Write migrations for any schema change and keep them reversible."),
    ("storage", "Write migrations for any schema change and keep them reversible."),
    ("security", "Treat all external input as untrusted; never log secrets."),
    ("auth", "Treat all external input as untrusted; never log secrets."),
    ("test", "Prefer deterministic tests; no sleeps or wall-clock assertions."),
    ("perf", "Measure before and after; note the numbers in your summary."),
];

/// Maximum file size considered during content scans.
const MAX_SCAN_BYTES: u64 = 64 * 1024;

/// Everything the builder folds into a prompt besides the tree scan.
#[derive(Debug, Clone, Default)]
pub struct ContextInputs {
    /// Up to 10 recent commit subjects, newest first.
    pub recent_commits: Vec<String>,
    /// Summary of the most recent checkpoint, if any.
    pub last_checkpoint_summary: Option<String>,
    /// Redirect notes accumulated since the last checkpoint.
    pub redirect_notes: Vec<String>,
}

/// Prompt composer over one working tree.
pub struct ContextBuilder {
    root: PathBuf,
    max_files: usize,
    max_keywords: usize,
}

impl ContextBuilder {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_files: 10,
            max_keywords: 3,
        }
    }

    /// Lift the scan caps for single-issue `work --full-context` runs.
    pub fn full_context(mut self) -> Self {
        self.max_files = 20;
        self.max_keywords = 5;
        self
    }

    /// Keywords from an issue title after stopword removal.
    pub fn keywords(&self, title: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for word in title.split(|c: char| !c.is_ascii_alphanumeric()) {
            let word = word.to_ascii_lowercase();
            if word.len() < 3 || STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            if !seen.contains(&word) {
                seen.push(word);
            }
            if seen.len() >= self.max_keywords {
                break;
            }
        }
        seen
    }

    /// Working-tree files whose name or contents match a keyword.
    ///
    /// Respects .gitignore; skips binaries and anything over 64 KiB; results
    /// are sorted for determinism and capped.
    pub fn matching_files(&self, keywords: &[String]) -> Vec<PathBuf> {
        if keywords.is_empty() {
            return Vec::new();
        }
        let mut matches = Vec::new();
        for entry in WalkBuilder::new(&self.root).hidden(true).build().flatten() {
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            let name_hit = keywords.iter().any(|k| name.contains(k.as_str()));
            let content_hit = || {
                let small = entry
                    .metadata()
                    .map(|m| m.len() <= MAX_SCAN_BYTES)
                    .unwrap_or(false);
                if !small {
                    return false;
                }
                match std::fs::read(path) {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).to_ascii_lowercase();
                        keywords.iter().any(|k| text.contains(k.as_str()))
                    }
                    Err(_) => false,
                }
            };
            if name_hit || content_hit() {
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    matches.push(rel.to_path_buf());
                }
            }
        }
        matches.sort();
        matches.truncate(self.max_files);
        matches
    }

    /// Compose the priming prompt.
    pub fn build(&self, issue: &Issue, inputs: &ContextInputs) -> String {
        let mut prompt = String::new();

        prompt.push_str(&format!("# Task: {} ({})\n\n", issue.title, issue.id));
        prompt.push_str(&format!(
            "**Type:** {} | **Priority:** {}\n\n",
            issue.issue_type, issue.priority
        ));
        if !issue.description.trim().is_empty() {
            prompt.push_str("## Description\n\n");
            prompt.push_str(issue.description.trim());
            prompt.push_str("\n\n");
        }

        if !inputs.recent_commits.is_empty() {
            prompt.push_str("## Recent commits\n\n");
            for subject in inputs.recent_commits.iter().take(10) {
                prompt.push_str(&format!("- {subject}\n"));
            }
            prompt.push('\n');
        }

        if let Some(summary) = &inputs.last_checkpoint_summary {
            prompt.push_str("## Last checkpoint\n\n");
            prompt.push_str(summary.trim());
            prompt.push_str("\n\n");
        }

        if !inputs.redirect_notes.is_empty() {
            prompt.push_str("## Direction changes since the last checkpoint\n\n");
            for note in &inputs.redirect_notes {
                prompt.push_str(&format!("- {note}\n"));
            }
            prompt.push('\n');
        }

        let keywords = self.keywords(&issue.title);
        let files = self.matching_files(&keywords);
        if !files.is_empty() {
            prompt.push_str("## Possibly relevant files\n\n");
            for file in &files {
                prompt.push_str(&format!("- `{}`\n", file.display()));
            }
            prompt.push('\n');
        }

        prompt.push_str("## Working guidance\n\n");
        for line in DRY_GUIDANCE {
            prompt.push_str(&format!("- {line}\n"));
        }
        for (fragment, hint) in DOMAIN_HINTS {
            if issue
                .labels
                .iter()
                .any(|label| label.to_ascii_lowercase().contains(fragment))
            {
                prompt.push_str(&format!("- {hint}\n"));
            }
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IssueStatus, IssueType, Priority};
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::tempdir;

    fn issue(title: &str, labels: &[&str]) -> Issue {
        Issue {
            id: "fm-7".into(),
            title: title.into(),
            description: "Make it work end to end.".into(),
            status: IssueStatus::Open,
            priority: Priority::new(1),
            issue_type: IssueType::Feature,
            labels: labels.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            closed_at: None,
            metadata: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_keywords_drop_stopwords() {
        let builder = ContextBuilder::new(".");
        let kw = builder.keywords("Add retry logic to the upload handler");
        assert_eq!(kw, vec!["retry", "logic", "upload"]);
    }

    #[test]
    fn test_keywords_dedup_and_cap() {
        let builder = ContextBuilder::new(".");
        let kw = builder.keywords("parser parser tokenizer lexer grammar");
        assert_eq!(kw.len(), 3);
        assert_eq!(kw, vec!["parser", "tokenizer", "lexer"]);
    }

    #[test]
    fn test_matching_files_by_name_and_content() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("upload.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("other.rs"), "handles retry backoff").unwrap();
        std::fs::write(dir.path().join("unrelated.rs"), "nothing here").unwrap();

        let builder = ContextBuilder::new(dir.path());
        let files = builder.matching_files(&["retry".into(), "upload".into()]);
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"upload.rs".to_string()));
        assert!(names.contains(&"other.rs".to_string()));
        assert!(!names.contains(&"unrelated.rs".to_string()));
    }

    #[test]
    fn test_matching_files_capped_and_sorted() {
        let dir = tempdir().unwrap();
        for i in 0..15 {
            std::fs::write(dir.path().join(format!("widget_{i:02}.rs")), "x").unwrap();
        }
        let builder = ContextBuilder::new(dir.path());
        let files = builder.matching_files(&["widget".into()]);
        assert_eq!(files.len(), 10);
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted);
    }

    #[test]
    fn test_prompt_sections() {
        let dir = tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path());
        let inputs = ContextInputs {
            recent_commits: vec!["Add parser".into(), "Fix lexer".into()],
            last_checkpoint_summary: Some("3 issues done, confidence 0.9".into()),
            redirect_notes: vec!["new urgent issue fm-9".into()],
        };
        let prompt = builder.build(&issue("Wire up the parser", &[]), &inputs);

        assert!(prompt.starts_with("# Task: Wire up the parser (fm-7)"));
        assert!(prompt.contains("## Description"));
        assert!(prompt.contains("- Add parser"));
        assert!(prompt.contains("## Last checkpoint"));
        assert!(prompt.contains("confidence 0.9"));
        assert!(prompt.contains("new urgent issue fm-9"));
        assert!(prompt.contains("## Working guidance"));
    }

    #[test]
    fn test_domain_hints_from_labels() {
        let dir = tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path());
        let prompt = builder.build(
            &issue("Harden login flow", &["area:security"]),
            &ContextInputs::default(),
        );
        assert!(prompt.contains("untrusted"));

        let prompt = builder.build(&issue("Harden login flow", &[]), &ContextInputs::default());
        assert!(!prompt.contains("untrusted"));
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("parser.rs"), "x").unwrap();
        let builder = ContextBuilder::new(dir.path());
        let i = issue("Extend parser coverage", &[]);
        let a = builder.build(&i, &ContextInputs::default());
        let b = builder.build(&i, &ContextInputs::default());
        assert_eq!(a, b);
    }
}
