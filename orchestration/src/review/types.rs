//! Reviewer specs, findings, and aggregation types.

use serde::{Deserialize, Serialize};

/// Finding severity, most severe first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// What a reviewer specialises in. Custom reviewers carry their own prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ReviewerKind {
    Security,
    Architecture,
    Quality,
    Custom { prompt: String },
}

impl ReviewerKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Architecture => "architecture",
            Self::Quality => "quality",
            Self::Custom { .. } => "custom",
        }
    }
}

/// One configured reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerSpec {
    pub id: String,
    pub kind: ReviewerKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A failing blocking reviewer stops the run from advancing.
    #[serde(default)]
    pub can_block: bool,
    /// Findings below this severity are dropped from this reviewer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
}

fn default_true() -> bool {
    true
}

impl ReviewerSpec {
    pub fn new(id: impl Into<String>, kind: ReviewerKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
            can_block: false,
            min_severity: None,
        }
    }

    pub fn blocking(mut self) -> Self {
        self.can_block = true;
        self
    }

    /// The conventional default panel: blocking security, advisory
    /// architecture and quality.
    pub fn default_panel() -> Vec<ReviewerSpec> {
        vec![
            ReviewerSpec::new("security", ReviewerKind::Security).blocking(),
            ReviewerSpec::new("architecture", ReviewerKind::Architecture),
            ReviewerSpec::new("quality", ReviewerKind::Quality),
        ]
    }
}

/// A single structured finding from a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Reviewer-level verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Pass,
    PassWithFindings,
    Fail,
    Error,
}

impl std::fmt::Display for ReviewOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::PassWithFindings => write!(f, "pass_with_findings"),
            Self::Fail => write!(f, "fail"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// What one reviewer produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerResult {
    pub reviewer_id: String,
    pub kind_name: String,
    pub can_block: bool,
    pub outcome: ReviewOutcome,
    pub confidence: f64,
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Finding counts by severity across reviewers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn tally(findings: impl Iterator<Item = Severity>) -> Self {
        let mut counts = Self::default();
        for severity in findings {
            match severity {
                Severity::Critical => counts.critical += 1,
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
                Severity::Info => counts.info += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low + self.info
    }
}

/// The pipeline's combined verdict over all reviewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAggregation {
    pub reviewers: Vec<ReviewerResult>,
    pub counts: SeverityCounts,
    pub outcome: ReviewOutcome,
    pub confidence: f64,
    pub should_advance: bool,
    #[serde(default)]
    pub blocking_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_review: Option<MetaReview>,
}

/// Cross-reviewer synthesis produced when findings pile up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaReview {
    pub model_tier: crate::routing::ModelTier,
    pub summary: String,
    #[serde(default)]
    pub proposed_issues: Vec<String>,
}

/// Gate policy applied at aggregation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewPolicy {
    pub block_on_critical: bool,
    pub block_on_high: bool,
    pub min_confidence_to_advance: f64,
    /// Reviewer fan-out bound.
    pub max_parallel_reviewers: usize,
    pub reviewer_timeout_secs: u64,
    /// Findings at or above this total trigger the meta-review.
    pub meta_review_threshold: usize,
    /// Meta-review enabled at all.
    pub meta_review: bool,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            block_on_critical: true,
            block_on_high: false,
            min_confidence_to_advance: 0.5,
            max_parallel_reviewers: 3,
            reviewer_timeout_secs: 600,
            meta_review_threshold: 10,
            meta_review: true,
        }
    }
}
