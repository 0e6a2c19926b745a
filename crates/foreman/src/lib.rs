//! Foreman — an autonomous agent harness.
//!
//! Drives an external AI coding agent through a tracker backlog on a
//! dedicated branch, with periodic human-auditable checkpoints, failure
//! policy with model escalation, redirect detection, and a reviewer
//! pipeline. The engine components live in the `orchestration` crate; this
//! crate owns the scheduler loop and the CLI.

pub mod cli;
pub mod commands;
pub mod scheduler;

pub use scheduler::{RunEnd, Scheduler};
