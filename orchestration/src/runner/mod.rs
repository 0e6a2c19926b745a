//! Session runner — one agent invocation bound to one issue.
//!
//! Spawns the configured agent binary with flags requesting structured JSON
//! output, writes the priming prompt to stdin, closes it, and drains both
//! output streams to completion. The runner classifies what happened but
//! never interprets business meaning; retry/skip/pause policy lives in the
//! failure tracker.

mod classify;

pub use classify::{
    classify_outcome, extract_commit, extract_summary, parse_envelope, AgentEnvelope,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{info, warn};

/// Default session timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Cap on captured bytes per stream.
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// Business-level outcome of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Success,
    Partial,
    Failure,
    ContextOverflow,
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failure => write!(f, "failure"),
            Self::ContextOverflow => write!(f, "context_overflow"),
        }
    }
}

/// Result of one agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub issue_id: String,
    pub outcome: SessionOutcome,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    /// Bytes of prompt plus captured output, as a context-use proxy.
    pub context_used: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    /// The agent's final text, before summary extraction. Consumers that
    /// expect structured output (reviewers) parse this.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_output: String,
}

impl SessionResult {
    /// A failure result that never ran (spawn error, rejected call).
    pub fn synthetic_failure(issue_id: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            issue_id: issue_id.to_string(),
            outcome: SessionOutcome::Failure,
            summary: error.clone(),
            git_commit: None,
            context_used: 0,
            duration_ms: 0,
            error: Some(error),
            model: None,
            session_id: None,
            cost_usd: None,
            num_turns: None,
            raw_output: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == SessionOutcome::Success
    }
}

/// What to run and where.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub issue_id: String,
    /// Priming prompt, written to the agent's stdin.
    pub prompt: String,
    pub cwd: PathBuf,
    /// Model identifier passed through to the agent binary.
    pub model: String,
    /// Continue a previous session of the same issue when set.
    pub resume_session_id: Option<String>,
    pub timeout: Duration,
}

impl SessionRequest {
    pub fn new(issue_id: impl Into<String>, prompt: impl Into<String>, cwd: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            issue_id: issue_id.into(),
            prompt: prompt.into(),
            cwd: cwd.into(),
            model: model.into(),
            resume_session_id: None,
            timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

/// Abstraction over agent execution.
///
/// The production impl spawns a subprocess; tests and reviewers provide
/// their own. Implementations never error; anything that goes wrong is a
/// `failure` result.
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn run_session(&self, request: SessionRequest) -> SessionResult;
}

/// How to invoke the agent binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommand {
    /// Binary name or path.
    pub program: String,
    /// Base flags (structured output, non-interactive mode).
    pub base_args: Vec<String>,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            base_args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
        }
    }
}

/// Subprocess-backed agent session runner.
pub struct SessionRunner {
    command: AgentCommand,
}

impl SessionRunner {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }
}

/// Drain a stream to a capped buffer, discarding the overflow.
async fn drain_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buffer.len() < MAX_CAPTURE_BYTES {
                    let room = MAX_CAPTURE_BYTES - buffer.len();
                    buffer.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
            .await
            .is_ok()
        {
            return;
        }
        warn!("agent ignored SIGTERM, force-killing");
    }
    let _ = child.kill().await;
}

#[async_trait]
impl AgentSession for SessionRunner {
    async fn run_session(&self, request: SessionRequest) -> SessionResult {
        let started = Instant::now();

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.base_args)
            .arg("--model")
            .arg(&request.model)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(sid) = &request.resume_session_id {
            cmd.arg("--resume").arg(sid);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(issue = %request.issue_id, error = %e, "agent spawn failed");
                return SessionResult::synthetic_failure(
                    &request.issue_id,
                    format!("failed to spawn {}: {e}", self.command.program),
                );
            }
        };

        // Feed the prompt and close stdin so the agent sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                warn!(issue = %request.issue_id, error = %e, "failed to write prompt");
            }
            drop(stdin);
        }

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain_capped(out)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain_capped(err)));

        let mut timed_out = false;
        let exit_status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = tokio::time::sleep(request.timeout) => {
                timed_out = true;
                warn!(
                    issue = %request.issue_id,
                    timeout_secs = request.timeout.as_secs(),
                    "session timed out, terminating agent"
                );
                terminate(&mut child).await;
                None
            }
        };

        // A bounded join: an orphaned grandchild can keep the pipe open
        // after the agent itself is gone.
        let join_stream = |task: Option<tokio::task::JoinHandle<String>>| async move {
            match task {
                Some(task) => {
                    let abort = task.abort_handle();
                    match tokio::time::timeout(Duration::from_secs(5), task).await {
                        Ok(Ok(captured)) => captured,
                        _ => {
                            abort.abort();
                            String::new()
                        }
                    }
                }
                None => String::new(),
            }
        };
        let stdout = join_stream(stdout_task).await;
        let stderr = join_stream(stderr_task).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let exit_success = !timed_out && exit_status.map(|s| s.success()).unwrap_or(false);

        let envelope = parse_envelope(&stdout).unwrap_or_default();
        // Classify over the agent's text when the envelope carries it.
        let text = envelope.result.clone().unwrap_or_else(|| stdout.clone());

        let outcome = classify_outcome(exit_success, &text, &stderr);
        let error = if timed_out {
            Some(format!(
                "session timed out after {}s",
                request.timeout.as_secs()
            ))
        } else if outcome == SessionOutcome::Failure {
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
            Some(if tail.is_empty() {
                "agent exited non-zero".to_string()
            } else {
                tail
            })
        } else {
            None
        };

        info!(
            issue = %request.issue_id,
            outcome = %outcome,
            duration_ms,
            model = %request.model,
            "session finished"
        );

        SessionResult {
            issue_id: request.issue_id,
            outcome,
            summary: extract_summary(&text),
            git_commit: extract_commit(&text),
            context_used: (request.prompt.len() + stdout.len()) as u64,
            duration_ms,
            error,
            model: envelope.model.clone().or(Some(request.model)),
            session_id: envelope.session_id.clone(),
            cost_usd: envelope.cost(),
            num_turns: envelope.num_turns,
            raw_output: text,
        }
    }
}
