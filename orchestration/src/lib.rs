//! Engine components for the foreman agent harness.
//!
//! This crate holds everything below the scheduler loop:
//! - issue store adapters (tracker CLI, JSONL fallback, in-memory)
//! - resilience primitives (circuit breaker, saga)
//! - the agent session runner and outcome classification
//! - context discovery for priming prompts
//! - failure tracking with model escalation
//! - the checkpoint engine and confidence scoring
//! - redirect detection over issue-store snapshots
//! - the reviewer pipeline
//! - baseline quality gates
//! - run state, spec parsing, configuration, model routing, git plumbing
//!
//! The `foreman` binary wires these into the top-level orchestration loop.

pub mod breaker;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod failure;
pub mod gates;
pub mod git;
pub mod plan;
pub mod redirect;
pub mod review;
pub mod routing;
pub mod runner;
pub mod runstate;
pub mod saga;
pub mod shell_safety;
pub mod specfile;
pub mod startup;
pub mod store;

// Re-export the types the scheduler and CLI touch constantly.
pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use checkpoint::{
    load_latest_checkpoint, persist_checkpoint, AgentStatus, Checkpoint, CheckpointEngine,
    CheckpointPolicy, CheckpointTrigger, ResumeInfo, SwarmAgentState, SwarmProgress,
};
pub use config::{AgentConfig, GatesConfig, HarnessConfig, ReviewersConfig, SwarmConfig};
pub use context::{ContextBuilder, ContextInputs};
pub use error::{HarnessError, HarnessResult};
pub use failure::{
    escalation_note, FailureAction, FailureDecision, FailurePolicy, FailureRecord,
    FailureTracker,
};
pub use gates::{
    create_blockers, has_open_blockers, BaselineGates, GateHealth, GateOutcome,
    GateRunReport, GateSpec,
};
pub use git::GitWorkspace;
pub use plan::{independent_set, pending_work};
pub use redirect::{Redirect, RedirectDetector, RedirectKind};
pub use review::{
    ReviewAggregation, ReviewOutcome, ReviewPolicy, ReviewRequest, ReviewerKind,
    ReviewerPipeline, ReviewerSpec, Severity,
};
pub use routing::{
    select_model_for_task, select_with_strategy, ExperimentLog, ModelNames, ModelTier,
    RoutingConfig, RoutingExperiment,
};
pub use runner::{
    AgentCommand, AgentSession, SessionOutcome, SessionRequest, SessionResult, SessionRunner,
};
pub use runstate::{RunState, RunStatus};
pub use saga::{Saga, SagaContext, SagaStatus, SagaStep, StepOptions};
pub use specfile::ProjectSpec;
pub use startup::{
    find_run_epic, initialize_run, resume_run, InitOptions, InitializedRun, ResumeReport,
};
pub use store::{
    run_label, AdapterError, AdapterErrorKind, Issue, IssueStatus, IssueStore, IssueType,
    JsonlStore, MemoryStore, NewIssue, Priority, TrackerCli,
};
