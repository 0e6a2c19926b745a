//! Command-line surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "foreman",
    about = "Autonomous agent harness: drives a coding agent through a tracker backlog",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize a run from a spec file and drive it.
    Start {
        /// Path to the spec (markdown or YAML).
        spec_path: PathBuf,
        /// Checkpoint after this many sessions.
        #[arg(long, value_name = "N")]
        checkpoint_every: Option<u32>,
        /// Pause the run after this many hours.
        #[arg(long, value_name = "H")]
        max_hours: Option<f64>,
        /// Harness config file (YAML or markdown front-matter).
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Comma-separated reviewer ids to enable (prefix match).
        #[arg(long, value_delimiter = ',', value_name = "IDS")]
        reviewers: Option<Vec<String>>,
        /// Disable the reviewer pipeline entirely.
        #[arg(long)]
        no_review: bool,
        /// Block advancement on high-severity findings.
        #[arg(long)]
        review_block_high: bool,
        /// Enable bounded-parallel swarm mode.
        #[arg(long)]
        swarm: bool,
        /// Maximum concurrent swarm agents.
        #[arg(long, value_name = "N")]
        max_agents: Option<usize>,
        /// Minimum independent issues before a swarm batch.
        #[arg(long, value_name = "N")]
        min_tasks: Option<usize>,
        /// Plan only; no writes to the issue store, no branch.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a single agent session against one issue.
    Work {
        /// Existing issue id (omit when using --create).
        issue_id: Option<String>,
        /// Create a new issue with this title and work on it.
        #[arg(long, value_name = "TITLE", conflicts_with = "issue_id")]
        create: Option<String>,
        /// Model tier: low, mid, or high.
        #[arg(long, value_name = "TIER")]
        model: Option<String>,
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Lift the context-discovery caps.
        #[arg(long)]
        full_context: bool,
        /// Print the priming prompt instead of running the agent.
        #[arg(long)]
        dry_run: bool,
    },
    /// Ask the running scheduler to pause via an advisory marker issue.
    Pause {
        #[arg(long, value_name = "TEXT")]
        reason: Option<String>,
        #[arg(long, value_name = "ID")]
        run_id: Option<String>,
    },
    /// Resume a paused run.
    Resume {
        #[arg(long, value_name = "ID")]
        run_id: Option<String>,
        /// Report the reconciled state without running anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show run status and the latest checkpoint.
    Status {
        #[arg(long, value_name = "ID")]
        run_id: Option<String>,
    },
    /// Stop the most recent run by closing its epic.
    Stop,
}
