//! Reviewer pipeline — fan-out of specialised review sessions over a diff.
//!
//! Each enabled reviewer runs as its own agent session with a kind-specific
//! prompt over the checkpoint-span diff plus the full-run diff. Reviewers
//! run concurrently under a parallelism bound; their structured findings
//! are aggregated into a single advance/block verdict.

mod types;

pub use types::{
    Finding, MetaReview, ReviewAggregation, ReviewOutcome, ReviewPolicy, ReviewerKind,
    ReviewerResult, ReviewerSpec, Severity, SeverityCounts,
};

use crate::routing::{ModelNames, ModelTier};
use crate::runner::{AgentSession, SessionRequest};
use futures::stream::{FuturesOrdered, StreamExt};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Cap on diff text embedded in a reviewer prompt.
const MAX_DIFF_CHARS: usize = 30_000;

/// Inputs for one review pass.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub run_id: String,
    pub checkpoint_summary: String,
    /// `id — title` lines for the issues completed in this span.
    pub issues_completed: Vec<String>,
    /// Working-tree diff for the checkpoint span.
    pub span_diff: String,
    /// Wider full-run diff for cross-file pattern checks.
    pub full_diff: String,
    pub cwd: PathBuf,
}

fn truncate_block(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n... [truncated — {} total chars]",
        &text[..end],
        text.len()
    )
}

/// Focus paragraph per reviewer kind.
fn kind_focus(kind: &ReviewerKind) -> String {
    match kind {
        ReviewerKind::Security => "You are a security reviewer. Look for injection, \
            unsafe deserialization, secrets in code or logs, missing authentication or \
            authorization checks, and unsafe handling of external input."
            .to_string(),
        ReviewerKind::Architecture => "You are an architecture reviewer. Look for layering \
            violations, duplicated responsibilities, leaky abstractions, and changes that \
            contradict the structure visible in the full-run diff."
            .to_string(),
        ReviewerKind::Quality => "You are a code-quality reviewer. Look for bugs, missing \
            error handling, dead code, misleading names, and missing tests for changed \
            behaviour."
            .to_string(),
        ReviewerKind::Custom { prompt } => prompt.clone(),
    }
}

/// Build the prompt for one reviewer.
fn reviewer_prompt(spec: &ReviewerSpec, request: &ReviewRequest) -> String {
    let span = if request.span_diff.trim().is_empty() {
        "(the diff for this span is empty)".to_string()
    } else {
        format!("```diff\n{}\n```", truncate_block(&request.span_diff, MAX_DIFF_CHARS))
    };
    let full = if request.full_diff.trim().is_empty() {
        "(empty)".to_string()
    } else {
        format!("```diff\n{}\n```", truncate_block(&request.full_diff, MAX_DIFF_CHARS))
    };

    format!(
        "{focus}\n\n\
         Checkpoint: {summary}\n\
         Issues completed in this span:\n{issues}\n\n\
         ## Diff for this span\n{span}\n\n\
         ## Full-run diff (context only)\n{full}\n\n\
         Respond with STRICT JSON ONLY using the schema:\n\
         {{\"outcome\":\"pass|pass_with_findings|fail\",\"confidence\":0.0,\
         \"summary\":\"...\",\"findings\":[{{\"severity\":\"critical|high|medium|low|info\",\
         \"category\":\"...\",\"title\":\"...\",\"description\":\"...\",\"file\":\"...\",\
         \"line\":0,\"quote\":\"...\",\"suggestion\":\"...\"}}]}}",
        focus = kind_focus(&spec.kind),
        summary = request.checkpoint_summary,
        issues = if request.issues_completed.is_empty() {
            "- (none)".to_string()
        } else {
            request
                .issues_completed
                .iter()
                .map(|i| format!("- {i}"))
                .collect::<Vec<_>>()
                .join("\n")
        },
    )
}

/// The first JSON-shaped object in free-form output.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct RawReviewEnvelope {
    outcome: Option<String>,
    confidence: Option<f64>,
    summary: Option<String>,
    #[serde(default)]
    findings: Vec<Finding>,
}

/// Parse one reviewer's output into a result. Missing or malformed
/// envelopes yield `outcome = error`.
fn parse_reviewer_output(spec: &ReviewerSpec, output: &str) -> ReviewerResult {
    let error_result = |message: String| ReviewerResult {
        reviewer_id: spec.id.clone(),
        kind_name: spec.kind.name().to_string(),
        can_block: spec.can_block,
        outcome: ReviewOutcome::Error,
        confidence: 0.0,
        summary: message.clone(),
        findings: Vec::new(),
        error: Some(message),
    };

    let Some(json) = first_json_object(output) else {
        return error_result("no JSON object in reviewer output".to_string());
    };
    let envelope: RawReviewEnvelope = match serde_json::from_str(json) {
        Ok(envelope) => envelope,
        Err(e) => return error_result(format!("malformed reviewer envelope: {e}")),
    };
    let outcome = match envelope.outcome.as_deref() {
        Some("pass") => ReviewOutcome::Pass,
        Some("pass_with_findings") => ReviewOutcome::PassWithFindings,
        Some("fail") => ReviewOutcome::Fail,
        other => {
            return error_result(format!("unrecognised reviewer outcome: {other:?}"));
        }
    };

    let mut findings = envelope.findings;
    if let Some(min) = spec.min_severity {
        findings.retain(|f| f.severity <= min);
    }
    // A pass with surviving findings is a pass-with-findings.
    let outcome = if outcome == ReviewOutcome::Pass && !findings.is_empty() {
        ReviewOutcome::PassWithFindings
    } else {
        outcome
    };

    ReviewerResult {
        reviewer_id: spec.id.clone(),
        kind_name: spec.kind.name().to_string(),
        can_block: spec.can_block,
        outcome,
        confidence: envelope.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        summary: envelope.summary.unwrap_or_default(),
        findings,
        error: None,
    }
}

/// Aggregate reviewer results into the combined verdict.
pub fn aggregate(results: Vec<ReviewerResult>, policy: &ReviewPolicy) -> ReviewAggregation {
    let counts = SeverityCounts::tally(
        results
            .iter()
            .flat_map(|r| r.findings.iter().map(|f| f.severity)),
    );

    let outcome = if results.iter().any(|r| r.outcome == ReviewOutcome::Error) {
        ReviewOutcome::Error
    } else if results.iter().any(|r| r.outcome == ReviewOutcome::Fail) {
        ReviewOutcome::Fail
    } else if counts.total() > 0 {
        ReviewOutcome::PassWithFindings
    } else {
        ReviewOutcome::Pass
    };

    let scoring: Vec<&ReviewerResult> = results
        .iter()
        .filter(|r| r.outcome != ReviewOutcome::Error)
        .collect();
    let confidence = if scoring.is_empty() {
        0.0
    } else {
        scoring.iter().map(|r| r.confidence).sum::<f64>() / scoring.len() as f64
    };

    let mut blocking_reasons = Vec::new();
    if policy.block_on_critical && counts.critical > 0 {
        blocking_reasons.push(format!(
            "{} critical finding(s) with block_on_critical enabled",
            counts.critical
        ));
    }
    if policy.block_on_high && counts.high > 0 {
        blocking_reasons.push(format!(
            "{} high-severity finding(s) with block_on_high enabled",
            counts.high
        ));
    }
    if confidence < policy.min_confidence_to_advance {
        blocking_reasons.push(format!(
            "overall confidence {confidence:.2} below minimum {:.2}",
            policy.min_confidence_to_advance
        ));
    }
    for result in &results {
        if result.can_block && result.outcome == ReviewOutcome::Fail {
            blocking_reasons.push(format!(
                "blocking reviewer '{}' failed",
                result.reviewer_id
            ));
        }
    }

    ReviewAggregation {
        reviewers: results,
        counts,
        outcome,
        confidence,
        should_advance: blocking_reasons.is_empty(),
        blocking_reasons,
        meta_review: None,
    }
}

/// Model tier for the meta-review: the highest tier when security or
/// architecture reviewers produced high/critical findings, mid otherwise.
pub fn meta_review_tier(results: &[ReviewerResult]) -> ModelTier {
    let serious = results
        .iter()
        .filter(|r| matches!(r.kind_name.as_str(), "security" | "architecture"))
        .flat_map(|r| r.findings.iter())
        .any(|f| f.severity <= Severity::High);
    if serious {
        ModelTier::High
    } else {
        ModelTier::Mid
    }
}

#[derive(Debug, Deserialize)]
struct RawMetaEnvelope {
    summary: Option<String>,
    #[serde(default)]
    proposed_issues: Vec<String>,
}

/// Fan-out runner over the reviewer set.
pub struct ReviewerPipeline {
    reviewers: Vec<ReviewerSpec>,
    policy: ReviewPolicy,
    models: ModelNames,
    agent: Arc<dyn AgentSession>,
}

impl ReviewerPipeline {
    pub fn new(
        reviewers: Vec<ReviewerSpec>,
        policy: ReviewPolicy,
        models: ModelNames,
        agent: Arc<dyn AgentSession>,
    ) -> Self {
        Self {
            reviewers,
            policy,
            models,
            agent,
        }
    }

    pub fn reviewer_count(&self) -> usize {
        self.reviewers.iter().filter(|r| r.enabled).count()
    }

    /// Run every enabled reviewer and aggregate. Reviewers run even when
    /// the span diff is empty; the prompt says so and cheap passes are fine.
    pub async fn run(&self, request: &ReviewRequest) -> ReviewAggregation {
        let semaphore = Arc::new(Semaphore::new(self.policy.max_parallel_reviewers.max(1)));
        let timeout = Duration::from_secs(self.policy.reviewer_timeout_secs);
        let model = self.models.name_for(ModelTier::Mid).to_string();

        let mut ordered = FuturesOrdered::new();
        for spec in self.reviewers.iter().filter(|r| r.enabled) {
            let agent = Arc::clone(&self.agent);
            let semaphore = Arc::clone(&semaphore);
            let prompt = reviewer_prompt(spec, request);
            let model = model.clone();
            let cwd = request.cwd.clone();
            let spec = spec.clone();
            ordered.push_back(async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                let mut session = SessionRequest::new(
                    format!("review:{}", spec.id),
                    prompt,
                    cwd,
                    model,
                );
                session.timeout = timeout;
                let result = agent.run_session(session).await;
                if let Some(error) = &result.error {
                    warn!(reviewer = %spec.id, %error, "reviewer session errored");
                    return ReviewerResult {
                        reviewer_id: spec.id.clone(),
                        kind_name: spec.kind.name().to_string(),
                        can_block: spec.can_block,
                        outcome: ReviewOutcome::Error,
                        confidence: 0.0,
                        summary: error.clone(),
                        findings: Vec::new(),
                        error: Some(error.clone()),
                    };
                }
                parse_reviewer_output(&spec, &result.raw_output)
            });
        }

        let results: Vec<ReviewerResult> = ordered.collect().await;
        let mut aggregation = aggregate(results, &self.policy);
        info!(
            run = %request.run_id,
            outcome = %aggregation.outcome,
            findings = aggregation.counts.total(),
            should_advance = aggregation.should_advance,
            "review aggregated"
        );

        if self.policy.meta_review
            && aggregation.counts.total() >= self.policy.meta_review_threshold
        {
            aggregation.meta_review = Some(self.run_meta_review(request, &aggregation).await);
        }

        aggregation
    }

    /// Synthesis pass over the aggregated findings.
    async fn run_meta_review(
        &self,
        request: &ReviewRequest,
        aggregation: &ReviewAggregation,
    ) -> MetaReview {
        let tier = meta_review_tier(&aggregation.reviewers);
        let findings_json = serde_json::to_string_pretty(
            &aggregation
                .reviewers
                .iter()
                .flat_map(|r| r.findings.iter())
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());

        let prompt = format!(
            "You are synthesising the output of several code reviewers for one \
             checkpoint. Identify cross-reviewer patterns (the same root cause seen \
             from different angles) and propose follow-up issues.\n\n\
             Findings:\n{findings_json}\n\n\
             Respond with STRICT JSON ONLY: \
             {{\"summary\":\"...\",\"proposed_issues\":[\"title\", ...]}}"
        );

        let mut session = SessionRequest::new(
            "review:meta",
            prompt,
            request.cwd.clone(),
            self.models.name_for(tier).to_string(),
        );
        session.timeout = Duration::from_secs(self.policy.reviewer_timeout_secs);
        let result = self.agent.run_session(session).await;

        let parsed = first_json_object(&result.raw_output)
            .and_then(|json| serde_json::from_str::<RawMetaEnvelope>(json).ok());
        match parsed {
            Some(envelope) => MetaReview {
                model_tier: tier,
                summary: envelope.summary.unwrap_or_default(),
                proposed_issues: envelope.proposed_issues,
            },
            None => MetaReview {
                model_tier: tier,
                summary: result.summary,
                proposed_issues: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{SessionOutcome, SessionResult};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Fake agent mapping reviewer id -> scripted output.
    struct ScriptedReviews {
        outputs: HashMap<String, String>,
    }

    #[async_trait]
    impl AgentSession for ScriptedReviews {
        async fn run_session(&self, request: SessionRequest) -> SessionResult {
            let output = self
                .outputs
                .get(&request.issue_id)
                .cloned()
                .unwrap_or_else(|| r#"{"outcome":"pass","confidence":0.9,"summary":"ok"}"#.into());
            SessionResult {
                issue_id: request.issue_id,
                outcome: SessionOutcome::Success,
                summary: "review done".into(),
                git_commit: None,
                context_used: 0,
                duration_ms: 5,
                error: None,
                model: Some(request.model),
                session_id: None,
                cost_usd: None,
                num_turns: None,
                raw_output: output,
            }
        }
    }

    fn request() -> ReviewRequest {
        ReviewRequest {
            run_id: "fm-1".into(),
            checkpoint_summary: "3 sessions, all green".into(),
            issues_completed: vec!["fm-2 — parser".into()],
            span_diff: "diff --git a/x b/x".into(),
            full_diff: String::new(),
            cwd: std::env::temp_dir(),
        }
    }

    fn pipeline(outputs: HashMap<String, String>, policy: ReviewPolicy) -> ReviewerPipeline {
        ReviewerPipeline::new(
            ReviewerSpec::default_panel(),
            policy,
            ModelNames::default(),
            Arc::new(ScriptedReviews { outputs }),
        )
    }

    #[test]
    fn test_first_json_object() {
        assert_eq!(
            first_json_object("noise {\"a\":1} trailing").unwrap(),
            "{\"a\":1}"
        );
        assert_eq!(
            first_json_object("{\"nested\":{\"b\":2}}").unwrap(),
            "{\"nested\":{\"b\":2}}"
        );
        // Braces inside strings do not count.
        assert_eq!(
            first_json_object(r#"{"s":"}{"}"#).unwrap(),
            r#"{"s":"}{"}"#
        );
        assert!(first_json_object("no json here").is_none());
        assert!(first_json_object("{unclosed").is_none());
    }

    #[tokio::test]
    async fn test_all_pass() {
        let aggregation = pipeline(HashMap::new(), ReviewPolicy::default())
            .run(&request())
            .await;
        assert_eq!(aggregation.outcome, ReviewOutcome::Pass);
        assert!(aggregation.should_advance);
        assert!(aggregation.blocking_reasons.is_empty());
        assert_eq!(aggregation.reviewers.len(), 3);
        assert!((aggregation.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_security_critical_blocks() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "review:security".to_string(),
            r#"{"outcome":"fail","confidence":0.95,"summary":"injection found",
               "findings":[{"severity":"critical","category":"injection","title":"raw SQL"}]}"#
                .to_string(),
        );
        let aggregation = pipeline(outputs, ReviewPolicy::default()).run(&request()).await;
        assert_eq!(aggregation.outcome, ReviewOutcome::Fail);
        assert!(!aggregation.should_advance);
        assert_eq!(aggregation.counts.critical, 1);
        // Reasons carry both the count and the blocking reviewer's name.
        assert!(aggregation
            .blocking_reasons
            .iter()
            .any(|r| r.contains("1 critical finding")));
        assert!(aggregation
            .blocking_reasons
            .iter()
            .any(|r| r.contains("'security' failed")));
    }

    #[tokio::test]
    async fn test_block_on_high_flag() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "review:quality".to_string(),
            r#"{"outcome":"pass_with_findings","confidence":0.8,"summary":"high issues",
               "findings":[
                 {"severity":"high","category":"bug","title":"a"},
                 {"severity":"high","category":"bug","title":"b"},
                 {"severity":"high","category":"bug","title":"c"}]}"#
                .to_string(),
        );

        // blockOnHigh=true blocks...
        let blocked = pipeline(
            outputs.clone(),
            ReviewPolicy {
                block_on_high: true,
                ..ReviewPolicy::default()
            },
        )
        .run(&request())
        .await;
        assert!(!blocked.should_advance);
        assert_eq!(blocked.counts.high, 3);

        // ...and blockOnHigh=false does not, with critical blocking still armed.
        let advancing = pipeline(
            outputs,
            ReviewPolicy {
                block_on_high: false,
                block_on_critical: true,
                ..ReviewPolicy::default()
            },
        )
        .run(&request())
        .await;
        assert!(advancing.should_advance);
        assert_eq!(advancing.outcome, ReviewOutcome::PassWithFindings);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_error() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "review:architecture".to_string(),
            "I could not produce JSON today".to_string(),
        );
        let aggregation = pipeline(outputs, ReviewPolicy::default()).run(&request()).await;
        assert_eq!(aggregation.outcome, ReviewOutcome::Error);
        let arch = aggregation
            .reviewers
            .iter()
            .find(|r| r.reviewer_id == "architecture")
            .unwrap();
        assert_eq!(arch.outcome, ReviewOutcome::Error);
        // Erroring reviewers are excluded from the confidence mean.
        assert!((aggregation.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_low_confidence_blocks() {
        let mut outputs = HashMap::new();
        for id in ["review:security", "review:architecture", "review:quality"] {
            outputs.insert(
                id.to_string(),
                r#"{"outcome":"pass","confidence":0.2,"summary":"unsure"}"#.to_string(),
            );
        }
        let aggregation = pipeline(outputs, ReviewPolicy::default()).run(&request()).await;
        assert!(!aggregation.should_advance);
        assert!(aggregation
            .blocking_reasons
            .iter()
            .any(|r| r.contains("below minimum")));
    }

    #[tokio::test]
    async fn test_meta_review_triggered_by_threshold() {
        let mut outputs = HashMap::new();
        let findings: Vec<String> = (0..4)
            .map(|i| {
                format!(r#"{{"severity":"medium","category":"dup","title":"finding {i}"}}"#)
            })
            .collect();
        outputs.insert(
            "review:quality".to_string(),
            format!(
                r#"{{"outcome":"pass_with_findings","confidence":0.8,"summary":"dups","findings":[{}]}}"#,
                findings.join(",")
            ),
        );
        outputs.insert(
            "review:meta".to_string(),
            r#"{"summary":"all four findings share one root cause","proposed_issues":["dedupe helpers"]}"#
                .to_string(),
        );
        let aggregation = pipeline(
            outputs,
            ReviewPolicy {
                meta_review_threshold: 4,
                ..ReviewPolicy::default()
            },
        )
        .run(&request())
        .await;

        let meta = aggregation.meta_review.unwrap();
        assert_eq!(meta.model_tier, ModelTier::Mid);
        assert_eq!(meta.proposed_issues, vec!["dedupe helpers"]);
    }

    #[tokio::test]
    async fn test_meta_review_tier_rule() {
        let security_high = vec![ReviewerResult {
            reviewer_id: "security".into(),
            kind_name: "security".into(),
            can_block: true,
            outcome: ReviewOutcome::PassWithFindings,
            confidence: 0.9,
            summary: String::new(),
            findings: vec![Finding {
                severity: Severity::High,
                category: "x".into(),
                title: "t".into(),
                description: String::new(),
                file: None,
                line: None,
                quote: None,
                suggestion: None,
            }],
            error: None,
        }];
        assert_eq!(meta_review_tier(&security_high), ModelTier::High);

        let quality_high = vec![ReviewerResult {
            kind_name: "quality".into(),
            reviewer_id: "quality".into(),
            ..security_high[0].clone()
        }];
        assert_eq!(meta_review_tier(&quality_high), ModelTier::Mid);
    }

    #[tokio::test]
    async fn test_min_severity_filter() {
        let spec = ReviewerSpec {
            min_severity: Some(Severity::High),
            ..ReviewerSpec::new("security", ReviewerKind::Security)
        };
        let output = r#"{"outcome":"pass_with_findings","confidence":0.9,"summary":"mixed",
            "findings":[
              {"severity":"critical","category":"a","title":"keep"},
              {"severity":"low","category":"b","title":"drop"}]}"#;
        let result = parse_reviewer_output(&spec, output);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].title, "keep");
    }

    #[tokio::test]
    async fn test_empty_diff_still_reviews() {
        let mut req = request();
        req.span_diff = String::new();
        let aggregation = pipeline(HashMap::new(), ReviewPolicy::default()).run(&req).await;
        assert_eq!(aggregation.reviewers.len(), 3);
        assert_eq!(aggregation.outcome, ReviewOutcome::Pass);
    }
}
