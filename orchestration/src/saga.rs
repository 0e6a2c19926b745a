//! Saga — ordered forward steps with reverse compensation.
//!
//! A linear workflow where each step can declare an undo. When a required
//! step fails after its retries, forward motion stops and the already
//! completed steps are compensated in reverse order. Used for multi-step
//! store/git workflows (branch → epic → seed issues) where a half-finished
//! setup must not be left behind.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-step execution knobs.
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Retries after the first attempt fails.
    pub retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Wall-clock limit per attempt.
    pub timeout: Duration,
    /// Optional steps never stop the saga and never trigger compensation.
    pub optional: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            retries: 2,
            retry_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
            optional: false,
        }
    }
}

/// Results of completed steps, keyed by step name.
#[derive(Debug, Default, Clone)]
pub struct SagaContext {
    values: HashMap<String, Value>,
}

impl SagaContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value before the saga runs.
    pub fn seed(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    fn insert(&mut self, key: String, value: Value) {
        self.values.insert(key, value);
    }
}

/// One forward step of a saga.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    fn options(&self) -> StepOptions {
        StepOptions::default()
    }

    /// Run the step. Prior results are available in the context under their
    /// step names.
    async fn execute(&self, ctx: &SagaContext) -> Result<Value, String>;

    /// Whether this step defines an undo.
    fn compensates(&self) -> bool {
        false
    }

    /// Undo a completed step. Only invoked when [`Self::compensates`] is
    /// true, with the step's own result.
    async fn compensate(&self, _ctx: &SagaContext, _result: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Terminal status of a saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// All required steps completed.
    Completed,
    /// A step failed and every applicable compensation succeeded.
    Compensated,
    /// A step failed and at least one compensation also failed.
    CompensationFailed,
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed { error: String },
    /// Optional step failed; the saga moved on.
    SkippedOptional { error: String },
    Compensated,
    CompensationFailed { error: String },
}

/// Per-step record in the saga report.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub name: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub outcome: StepOutcome,
}

/// Full account of a saga run.
#[derive(Debug)]
pub struct SagaReport {
    pub saga: String,
    pub status: SagaStatus,
    pub steps: Vec<StepRecord>,
    pub context: SagaContext,
    /// Error from the step that stopped forward motion, if any.
    pub error: Option<String>,
}

impl SagaReport {
    pub fn succeeded(&self) -> bool {
        self.status == SagaStatus::Completed
    }
}

/// Saga configuration.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Keep compensating remaining steps after one compensation fails.
    pub continue_compensation_on_error: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            continue_compensation_on_error: true,
        }
    }
}

/// A named, ordered list of steps.
pub struct Saga {
    name: String,
    config: SagaConfig,
    steps: Vec<Box<dyn SagaStep>>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: SagaConfig::default(),
            steps: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn step(mut self, step: impl SagaStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Run one step with retry + fixed delay and a per-attempt timeout.
    async fn run_step(
        step: &dyn SagaStep,
        ctx: &SagaContext,
    ) -> (u32, Result<Value, String>) {
        let options = step.options();
        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts <= options.retries {
            attempts += 1;
            let attempt = tokio::time::timeout(options.timeout, step.execute(ctx)).await;
            match attempt {
                Ok(Ok(value)) => return (attempts, Ok(value)),
                Ok(Err(e)) => {
                    warn!(step = step.name(), attempt = attempts, error = %e, "step attempt failed");
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        step = step.name(),
                        attempt = attempts,
                        timeout_ms = options.timeout.as_millis() as u64,
                        "step attempt timed out"
                    );
                    last_error = format!(
                        "step '{}' timed out after {}ms",
                        step.name(),
                        options.timeout.as_millis()
                    );
                }
            }
            if attempts <= options.retries {
                tokio::time::sleep(options.retry_delay).await;
            }
        }
        (attempts, Err(last_error))
    }

    /// Execute the saga.
    pub async fn run(&self, mut ctx: SagaContext) -> SagaReport {
        let mut records: Vec<StepRecord> = Vec::new();
        // Indices into `self.steps` of steps that completed successfully.
        let mut completed: Vec<(usize, Value)> = Vec::new();
        let mut stop_error: Option<String> = None;

        info!(saga = %self.name, steps = self.steps.len(), "saga started");

        for (index, step) in self.steps.iter().enumerate() {
            let started = Instant::now();
            let (attempts, result) = Self::run_step(step.as_ref(), &ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    debug!(saga = %self.name, step = step.name(), duration_ms, "step completed");
                    ctx.insert(step.name().to_string(), value.clone());
                    completed.push((index, value));
                    records.push(StepRecord {
                        name: step.name().to_string(),
                        attempts,
                        duration_ms,
                        outcome: StepOutcome::Succeeded,
                    });
                }
                Err(e) if step.options().optional => {
                    warn!(saga = %self.name, step = step.name(), error = %e, "optional step failed, continuing");
                    records.push(StepRecord {
                        name: step.name().to_string(),
                        attempts,
                        duration_ms,
                        outcome: StepOutcome::SkippedOptional { error: e },
                    });
                }
                Err(e) => {
                    error!(saga = %self.name, step = step.name(), error = %e, "step failed, compensating");
                    records.push(StepRecord {
                        name: step.name().to_string(),
                        attempts,
                        duration_ms,
                        outcome: StepOutcome::Failed { error: e.clone() },
                    });
                    stop_error = Some(e);
                    break;
                }
            }
        }

        let Some(error) = stop_error else {
            info!(saga = %self.name, "saga completed");
            return SagaReport {
                saga: self.name.clone(),
                status: SagaStatus::Completed,
                steps: records,
                context: ctx,
                error: None,
            };
        };

        // Reverse compensation of completed steps.
        let mut compensation_failed = false;
        for (index, result) in completed.iter().rev() {
            let step = &self.steps[*index];
            if !step.compensates() {
                continue;
            }
            let started = Instant::now();
            let outcome = match step.compensate(&ctx, result).await {
                Ok(()) => {
                    debug!(saga = %self.name, step = step.name(), "compensated");
                    StepOutcome::Compensated
                }
                Err(e) => {
                    error!(saga = %self.name, step = step.name(), error = %e, "compensation failed");
                    compensation_failed = true;
                    StepOutcome::CompensationFailed { error: e }
                }
            };
            records.push(StepRecord {
                name: step.name().to_string(),
                attempts: 1,
                duration_ms: started.elapsed().as_millis() as u64,
                outcome,
            });
            if compensation_failed && !self.config.continue_compensation_on_error {
                break;
            }
        }

        SagaReport {
            saga: self.name.clone(),
            status: if compensation_failed {
                SagaStatus::CompensationFailed
            } else {
                SagaStatus::Compensated
            },
            steps: records,
            context: ctx,
            error: Some(error),
        }
    }
}
