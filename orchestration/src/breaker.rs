//! Circuit breaker for unreliable outward calls.
//!
//! One instance per named dependency (agent spawn, each class of tracker
//! call). Failures inside a sliding window trip the circuit *open*; after a
//! cooldown it goes *half-open* to probe recovery, and enough consecutive
//! successes close it again. A call against an open circuit is rejected
//! without invoking the dependency; a rejection is not a failure of the
//! callee.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy — calls pass through.
    Closed,
    /// Tripped — calls are rejected until the reset timeout elapses.
    Open,
    /// Probing — calls pass through; successes close, any failure reopens.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Why a wrapped call did not produce the callee's result.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the dependency was never invoked.
    Rejected {
        /// Time until the next half-open probe is allowed.
        retry_in: Duration,
    },
    /// The call exceeded the configured call timeout.
    Timeout { after: Duration },
    /// The callee itself failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { retry_in } => {
                write!(f, "circuit open, retry in {}ms", retry_in.as_millis())
            }
            Self::Timeout { after } => {
                write!(f, "call timed out after {}ms", after.as_millis())
            }
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BreakerError<E> {}

impl<E> BreakerError<E> {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window before Closed → Open.
    pub failure_threshold: u32,
    /// Consecutive successes before HalfOpen → Closed.
    pub success_threshold: u32,
    /// Time in Open before a half-open probe is allowed.
    pub reset_timeout: Duration,
    /// Sliding window over which failures are counted.
    pub failure_window: Duration,
    /// Per-call timeout; exceeding it is recorded as a timeout failure.
    pub call_timeout: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(120),
            call_timeout: None,
        }
    }
}

/// Observability counters; not consulted for decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub timeouts: u64,
    pub total_latency_ms: u64,
}

impl BreakerMetrics {
    pub fn average_latency_ms(&self) -> f64 {
        let completed = self.successes + self.failures;
        if completed == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / completed as f64
        }
    }
}

/// Fail-fast wrapper around one named outward dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: CircuitState,
    /// Failure instants inside the sliding window.
    failures: VecDeque<Instant>,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    metrics: BreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            consecutive_successes: 0,
            opened_at: None,
            metrics: BreakerMetrics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying the Open → HalfOpen timer.
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                // Rejections continue through the reset instant itself.
                if Instant::now().duration_since(opened_at) > self.config.reset_timeout {
                    debug!(breaker = %self.name, "circuit half-open, probing");
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                }
            }
        }
        self.state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        self.metrics
    }

    /// Time until the next half-open probe, when the circuit is open.
    pub fn next_reset_in(&self) -> Option<Duration> {
        let opened_at = self.opened_at?;
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = Instant::now().duration_since(opened_at);
        Some(self.config.reset_timeout.saturating_sub(elapsed))
    }

    fn prune_window(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) > self.config.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, latency: Duration) {
        self.metrics.total_calls += 1;
        self.metrics.successes += 1;
        self.metrics.total_latency_ms += latency.as_millis() as u64;

        match self.state {
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    debug!(breaker = %self.name, "circuit closed");
                    self.state = CircuitState::Closed;
                    self.failures.clear();
                    self.opened_at = None;
                    self.consecutive_successes = 0;
                }
            }
            CircuitState::Closed => self.prune_window(),
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, latency: Duration) {
        self.metrics.total_calls += 1;
        self.metrics.failures += 1;
        self.metrics.total_latency_ms += latency.as_millis() as u64;
        self.note_failure();
    }

    fn record_timeout(&mut self, after: Duration) {
        self.metrics.total_calls += 1;
        self.metrics.failures += 1;
        self.metrics.timeouts += 1;
        self.metrics.total_latency_ms += after.as_millis() as u64;
        self.note_failure();
    }

    fn note_failure(&mut self) {
        let now = Instant::now();
        self.failures.push_back(now);
        self.prune_window();

        match self.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = self.failures.len(),
                        "failure threshold reached, circuit opened"
                    );
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn reject<E>(&mut self) -> BreakerError<E> {
        self.metrics.total_calls += 1;
        self.metrics.rejections += 1;
        BreakerError::Rejected {
            retry_in: self.next_reset_in().unwrap_or_default(),
        }
    }

    /// Run an async call through the breaker.
    pub async fn call<T, E, F>(&mut self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if self.state() == CircuitState::Open {
            return Err(self.reject());
        }

        let started = Instant::now();
        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    self.record_timeout(limit);
                    return Err(BreakerError::Timeout { after: limit });
                }
            },
            None => fut.await,
        };
        let latency = started.elapsed();

        match outcome {
            Ok(value) => {
                self.record_success(latency);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(latency);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Run a blocking call through the breaker. The call timeout does not
    /// apply here; synchronous callees enforce their own deadlines.
    pub fn call_sync<T, E>(
        &mut self,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, BreakerError<E>> {
        if self.state() == CircuitState::Open {
            return Err(self.reject());
        }
        let started = Instant::now();
        match f() {
            Ok(value) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Err(e) => {
                self.record_failure(started.elapsed());
                Err(BreakerError::Inner(e))
            }
        }
    }
}

/// Breakers keyed by dependency name, created on first use.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    default_config: BreakerConfig,
    breakers: HashMap<String, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: HashMap::new(),
        }
    }

    pub fn get(&mut self, name: &str) -> &mut CircuitBreaker {
        if !self.breakers.contains_key(name) {
            self.breakers.insert(
                name.to_string(),
                CircuitBreaker::new(name, self.default_config.clone()),
            );
        }
        self.breakers.get_mut(name).expect("just inserted")
    }

    pub fn names(&self) -> Vec<&str> {
        self.breakers.keys().map(String::as_str).collect()
    }
}
