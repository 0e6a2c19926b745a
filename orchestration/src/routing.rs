//! Model routing — which capability tier handles an issue.
//!
//! Routing consults configured patterns first and falls back to a pure
//! heuristic over labels, title, and description size. Every session
//! completion is appended to a JSONL experiment log so routing rules can be
//! tuned offline.

use crate::store::Issue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Capability class of a model route.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Low,
    Mid,
    High,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Mid => write!(f, "mid"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "mid" | "medium" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            other => Err(format!("unknown model tier: {other}")),
        }
    }
}

/// Concrete model names per tier, passed through to the agent binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelNames {
    pub low: String,
    pub mid: String,
    pub high: String,
}

impl Default for ModelNames {
    fn default() -> Self {
        Self {
            low: "haiku".to_string(),
            mid: "sonnet".to_string(),
            high: "opus".to_string(),
        }
    }
}

impl ModelNames {
    pub fn name_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Low => &self.low,
            ModelTier::Mid => &self.mid,
            ModelTier::High => &self.high,
        }
    }

    /// Tier for a model name the agent reported, if it matches a known one.
    pub fn tier_of(&self, model: &str) -> Option<ModelTier> {
        if model == self.low {
            Some(ModelTier::Low)
        } else if model == self.mid {
            Some(ModelTier::Mid)
        } else if model == self.high {
            Some(ModelTier::High)
        } else {
            None
        }
    }
}

/// One configured routing rule: substring match over labels and title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPattern {
    pub pattern: String,
    pub tier: ModelTier,
}

/// Routing section of the harness config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub patterns: Vec<RoutingPattern>,
    pub models: ModelNames,
}

/// Pure heuristic tier choice from the issue alone.
pub fn heuristic_tier(issue: &Issue) -> ModelTier {
    // Complexity labels are authoritative when present.
    for label in &issue.labels {
        let label = label.to_ascii_lowercase();
        if label.contains("complexity:trivial") || label.contains("complexity:simple") {
            return ModelTier::Low;
        }
        if label.contains("complexity:standard") {
            return ModelTier::Mid;
        }
        if label.contains("complexity:complex") || label.contains("complexity:epic") {
            return ModelTier::High;
        }
    }

    let title = issue.title.to_ascii_lowercase();
    const HIGH_MARKERS: &[&str] = &["refactor", "architecture", "redesign", "migrate", "rewrite"];
    const LOW_MARKERS: &[&str] = &["typo", "rename", "bump", "docs", "comment", "whitespace"];
    if HIGH_MARKERS.iter().any(|m| title.contains(m)) {
        return ModelTier::High;
    }
    if LOW_MARKERS.iter().any(|m| title.contains(m)) {
        return ModelTier::Low;
    }
    if issue.description.len() > 2_000 {
        return ModelTier::High;
    }
    ModelTier::Mid
}

/// Tier choice with the strategy that produced it: configured patterns
/// first, heuristic fallback.
pub fn select_with_strategy(config: &RoutingConfig, issue: &Issue) -> (ModelTier, &'static str) {
    let title = issue.title.to_ascii_lowercase();
    for rule in &config.patterns {
        let needle = rule.pattern.to_ascii_lowercase();
        let label_hit = issue
            .labels
            .iter()
            .any(|l| l.to_ascii_lowercase().contains(&needle));
        if label_hit || title.contains(&needle) {
            return (rule.tier, "pattern");
        }
    }
    (heuristic_tier(issue), "heuristic")
}

/// Tier choice: configured patterns first, heuristic fallback.
pub fn select_model_for_task(config: &RoutingConfig, issue: &Issue) -> ModelTier {
    select_with_strategy(config, issue).0
}

/// One routing-experiment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingExperiment {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub issue_id: String,
    pub model_used: String,
    /// How the model was chosen: `pattern`, `heuristic`, or `escalation`.
    pub strategy: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RoutingExperiment {
    pub fn new(
        issue_id: impl Into<String>,
        model_used: impl Into<String>,
        strategy: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            issue_id: issue_id.into(),
            model_used: model_used.into(),
            strategy: strategy.into(),
            success,
            cost: None,
            notes: None,
        }
    }

    pub fn with_cost(mut self, cost: Option<f64>) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Append-only JSONL experiment log.
pub struct ExperimentLog {
    path: PathBuf,
}

impl ExperimentLog {
    /// Log rooted at `repo_root/.foreman/routing-log.jsonl`.
    pub fn at_root(repo_root: impl AsRef<Path>) -> Self {
        Self::new(repo_root.as_ref().join(".foreman/routing-log.jsonl"))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &RoutingExperiment) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{line}")
    }

    pub fn read_all(&self) -> std::io::Result<Vec<RoutingExperiment>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IssueStatus, IssueType, Priority};
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::tempdir;

    fn issue(title: &str, labels: &[&str], description: &str) -> Issue {
        Issue {
            id: "fm-1".into(),
            title: title.into(),
            description: description.into(),
            status: IssueStatus::Open,
            priority: Priority::default(),
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
    fn test_tier_ordering_and_parse() {
        assert!(ModelTier::Low < ModelTier::Mid);
        assert!(ModelTier::Mid < ModelTier::High);
        assert_eq!("high".parse::<ModelTier>().unwrap(), ModelTier::High);
        assert_eq!("Medium".parse::<ModelTier>().unwrap(), ModelTier::Mid);
        assert!("giant".parse::<ModelTier>().is_err());
    }

    #[test]
    fn test_heuristic_complexity_labels() {
        assert_eq!(
            heuristic_tier(&issue("anything", &["complexity:simple"], "")),
            ModelTier::Low
        );
        assert_eq!(
            heuristic_tier(&issue("anything", &["complexity:standard"], "")),
            ModelTier::Mid
        );
        assert_eq!(
            heuristic_tier(&issue("anything", &["complexity:complex"], "")),
            ModelTier::High
        );
    }

    #[test]
    fn test_heuristic_title_markers() {
        assert_eq!(
            heuristic_tier(&issue("Refactor the storage layer", &[], "")),
            ModelTier::High
        );
        assert_eq!(
            heuristic_tier(&issue("Fix typo in README", &[], "")),
            ModelTier::Low
        );
        assert_eq!(
            heuristic_tier(&issue("Wire up uploads", &[], "")),
            ModelTier::Mid
        );
    }

    #[test]
    fn test_heuristic_long_description() {
        let long = "x".repeat(3_000);
        assert_eq!(
            heuristic_tier(&issue("Wire up uploads", &[], &long)),
            ModelTier::High
        );
    }

    #[test]
    fn test_patterns_beat_heuristic() {
        let config = RoutingConfig {
            patterns: vec![RoutingPattern {
                pattern: "payments".into(),
                tier: ModelTier::High,
            }],
            models: ModelNames::default(),
        };
        // Heuristic alone would say Low.
        let i = issue("Fix typo in payments docs", &[], "");
        assert_eq!(select_model_for_task(&config, &i), ModelTier::High);

        let other = issue("Fix typo in README", &[], "");
        assert_eq!(select_model_for_task(&config, &other), ModelTier::Low);
    }

    #[test]
    fn test_pattern_matches_labels() {
        let config = RoutingConfig {
            patterns: vec![RoutingPattern {
                pattern: "area:billing".into(),
                tier: ModelTier::High,
            }],
            models: ModelNames::default(),
        };
        let i = issue("Small tweak", &["area:billing"], "");
        assert_eq!(select_model_for_task(&config, &i), ModelTier::High);
    }

    #[test]
    fn test_model_names_lookup() {
        let names = ModelNames::default();
        assert_eq!(names.name_for(ModelTier::Mid), "sonnet");
        assert_eq!(names.tier_of("opus"), Some(ModelTier::High));
        assert_eq!(names.tier_of("unknown"), None);
    }

    #[test]
    fn test_experiment_log_roundtrip() {
        let dir = tempdir().unwrap();
        let log = ExperimentLog::at_root(dir.path());
        log.append(
            &RoutingExperiment::new("fm-1", "sonnet", "heuristic", true).with_cost(Some(0.2)),
        )
        .unwrap();
        log.append(
            &RoutingExperiment::new("fm-2", "opus", "escalation", false)
                .with_notes("second failure"),
        )
        .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].issue_id, "fm-1");
        assert_eq!(records[0].cost, Some(0.2));
        assert_eq!(records[1].strategy, "escalation");
        assert_ne!(records[0].id, records[1].id);
    }
}
