//! Harness configuration.
//!
//! Parsed from a YAML document or a markdown file with YAML front-matter.
//! Every field has a default so a missing or partial config file is fine.

use crate::checkpoint::CheckpointPolicy;
use crate::error::{HarnessError, HarnessResult};
use crate::failure::FailurePolicy;
use crate::gates::GateSpec;
use crate::review::{ReviewPolicy, ReviewerSpec};
use crate::routing::RoutingConfig;
use crate::runner::AgentCommand;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Swarm-mode knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub enabled: bool,
    pub max_parallel_agents: usize,
    /// Minimum independent issues before a batch is worth spawning.
    pub min_tasks_for_swarm: usize,
    /// Aggregate wall-clock limit for one batch.
    pub batch_timeout_secs: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_parallel_agents: 3,
            min_tasks_for_swarm: 2,
            batch_timeout_secs: 2 * 60 * 60,
        }
    }
}

/// Reviewer section: the panel plus the aggregation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewersConfig {
    pub enabled: bool,
    pub panel: Vec<ReviewerSpec>,
    pub policy: ReviewPolicy,
}

impl Default for ReviewersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            panel: ReviewerSpec::default_panel(),
            policy: ReviewPolicy::default(),
        }
    }
}

/// Baseline-gate section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    pub enabled: bool,
    pub gates: Vec<GateSpec>,
    /// Also re-run gates between sessions, not just before the run.
    pub between_sessions: bool,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gates: GateSpec::default_gates(),
            between_sessions: false,
        }
    }
}

/// Agent invocation section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: AgentCommand,
    pub session_timeout_mins: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: AgentCommand::default(),
            session_timeout_mins: 30,
        }
    }
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub routing: RoutingConfig,
    pub reviewers: ReviewersConfig,
    pub swarm: SwarmConfig,
    pub failure: FailurePolicy,
    pub gates: GatesConfig,
    pub checkpoint: CheckpointPolicy,
    pub agent: AgentConfig,
    /// Fixed inter-iteration delay of the scheduler loop.
    pub loop_delay_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            reviewers: ReviewersConfig::default(),
            swarm: SwarmConfig::default(),
            failure: FailurePolicy::default(),
            gates: GatesConfig::default(),
            checkpoint: CheckpointPolicy::default(),
            agent: AgentConfig::default(),
            loop_delay_ms: 1_000,
        }
    }
}

impl HarnessConfig {
    /// Load from a file: `.md` files carry the config as YAML front-matter,
    /// anything else is parsed as a whole YAML document.
    pub fn from_path(path: &Path) -> HarnessResult<HarnessConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::config(format!("read {}: {e}", path.display())))?;
        let is_markdown = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("md") | Some("markdown")
        );
        if is_markdown {
            Self::from_frontmatter(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    pub fn from_yaml(contents: &str) -> HarnessResult<HarnessConfig> {
        let mut config: HarnessConfig = serde_yaml::from_str(contents)
            .map_err(|e| HarnessError::config(format!("invalid config: {e}")))?;
        config.normalise();
        Ok(config)
    }

    /// Parse the YAML front-matter block of a markdown document.
    pub fn from_frontmatter(contents: &str) -> HarnessResult<HarnessConfig> {
        let rest = contents
            .strip_prefix("---\n")
            .or_else(|| contents.strip_prefix("---\r\n"))
            .ok_or_else(|| HarnessError::config("markdown config is missing front-matter"))?;
        let end = rest
            .find("\n---")
            .ok_or_else(|| HarnessError::config("unterminated front-matter block"))?;
        Self::from_yaml(&rest[..end])
    }

    fn normalise(&mut self) {
        if self.loop_delay_ms == 0 {
            self.loop_delay_ms = 1_000;
        }
        if self.swarm.max_parallel_agents == 0 {
            self.swarm.max_parallel_agents = 1;
        }
    }

    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.agent.session_timeout_mins * 60)
    }
}
