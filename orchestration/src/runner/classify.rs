//! Outcome classification and field extraction for agent output.
//!
//! The agent process speaks best-effort: a JSON envelope when the binary
//! supports structured output, free-form markdown otherwise. Everything
//! here is tolerant of both.

use super::SessionOutcome;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Markers indicating a context/token limit was exceeded.
const OVERFLOW_MARKERS: &[&str] = &[
    "context limit",
    "context window",
    "context length",
    "token limit",
    "maximum context",
    "context_length_exceeded",
    "prompt is too long",
];

/// Markers on a zero-exit session that still needs human follow-up.
const PARTIAL_MARKERS: &[&str] = &["blocked", "unable to complete", "need clarification"];

/// Classify a finished session from its exit status and captured streams.
pub fn classify_outcome(exit_success: bool, stdout: &str, stderr: &str) -> SessionOutcome {
    let stdout_lower = stdout.to_lowercase();
    let stderr_lower = stderr.to_lowercase();

    if OVERFLOW_MARKERS
        .iter()
        .any(|m| stdout_lower.contains(m) || stderr_lower.contains(m))
    {
        return SessionOutcome::ContextOverflow;
    }
    if !exit_success {
        return SessionOutcome::Failure;
    }
    if PARTIAL_MARKERS.iter().any(|m| stdout_lower.contains(m)) {
        return SessionOutcome::Partial;
    }
    SessionOutcome::Success
}

fn commit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:created\s+commit|commit)\b[^0-9a-fA-F]{0,10}([0-9a-f]{7,40})\b")
            .expect("commit regex")
    })
}

/// First hexadecimal hash near a `commit` / `created commit` token.
pub fn extract_commit(text: &str) -> Option<String> {
    commit_regex()
        .captures(text)
        .map(|c| c[1].to_string())
}

/// Summary text: the body of a `Summary` heading when present, otherwise
/// the final five non-heading lines of output.
pub fn extract_summary(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let heading =
        |line: &str| -> bool { line.trim_start().starts_with('#') };
    let summary_heading = lines.iter().position(|line| {
        let t = line.trim_start();
        t.starts_with('#') && t.trim_start_matches('#').trim().to_lowercase().starts_with("summary")
    });

    if let Some(start) = summary_heading {
        let body: Vec<&str> = lines[start + 1..]
            .iter()
            .take_while(|line| !heading(line))
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        if !body.is_empty() {
            return body.join("\n");
        }
    }

    lines
        .iter()
        .rev()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !heading(l))
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n")
}

/// JSON envelope the agent binary emits with `--output-format json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentEnvelope {
    /// The agent's final text.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
}

impl AgentEnvelope {
    pub fn cost(&self) -> Option<f64> {
        self.total_cost_usd.or(self.cost_usd)
    }
}

/// Parse the JSON envelope from stdout when present.
///
/// Tries the whole output first, then individual lines from the end (the
/// envelope is the final record in stream output).
pub fn parse_envelope(stdout: &str) -> Option<AgentEnvelope> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<AgentEnvelope>(trimmed) {
            return Some(envelope);
        }
    }
    for line in trimmed.lines().rev() {
        let line = line.trim();
        if line.starts_with('{') && line.ends_with('}') {
            if let Ok(envelope) = serde_json::from_str::<AgentEnvelope>(line) {
                return Some(envelope);
            }
        }
    }
    None
}
