//! Retry pattern implementation
//!
//! A [`RetryHandler`] re-invokes an operation up to `max_attempts` times,
//! sleeping between attempts according to its [`BackoffStrategy`]. Faults are
//! checked against the non-retryable set first, then an optional predicate,
//! then the retryable set.

use anyhow::{bail, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Fault, FaultKind, FaultSet, ResilienceError, ResilienceResult};
use crate::logging::{log_retries_exhausted, log_retry_attempt};

/// Number of recent attempt durations kept for status reporting
const DURATION_WINDOW: usize = 100;

/// Jitter applied to a delay, as a fraction of it
const JITTER_FRACTION: f64 = 0.2;

/// How the delay between attempts grows
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * multiplier^(attempt - 1)`
    Exponential,
    /// Exponential with a random ±20% perturbation
    ExponentialWithJitter,
}

/// Caller-supplied retryability check
#[derive(Clone)]
pub struct RetryPredicate(Arc<dyn Fn(&Fault) -> bool + Send + Sync>);

impl RetryPredicate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Fault) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    pub fn matches(&self, fault: &Fault) -> bool {
        (self.0)(fault)
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

/// Retry configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any computed delay in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor for exponential backoff
    pub backoff_multiplier: f64,
    /// Apply ±20% jitter regardless of strategy
    pub jitter: bool,
    pub strategy: BackoffStrategy,
    pub retryable_faults: FaultSet,
    /// Faults that abort the retry loop immediately; checked first
    pub non_retryable_faults: FaultSet,
    /// Overrides `retryable_faults` when set
    #[serde(skip)]
    pub predicate: Option<RetryPredicate>,
    /// Timeout for each individual attempt in milliseconds
    pub attempt_timeout_ms: Option<u64>,
    /// Budget for the whole operation including delays in milliseconds
    pub total_timeout_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: false,
            strategy: BackoffStrategy::ExponentialWithJitter,
            retryable_faults: FaultSet::of([
                FaultKind::Network,
                FaultKind::Timeout,
                FaultKind::ResourceExhausted,
                FaultKind::Io,
            ]),
            non_retryable_faults: FaultSet::of([
                FaultKind::PermissionDenied,
                FaultKind::InvalidArgument,
                FaultKind::InvalidType,
                FaultKind::MissingKey,
                FaultKind::MissingAttribute,
                FaultKind::CircuitOpen,
            ]),
            predicate: None,
            attempt_timeout_ms: None,
            total_timeout_ms: None,
        }
    }
}

impl RetryConfig {
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Fault) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(RetryPredicate::new(predicate));
        self
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            bail!("max_attempts must be at least 1");
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0) {
            bail!("backoff_multiplier must be a positive number");
        }
        if self.max_delay_ms < self.base_delay_ms {
            bail!(
                "max_delay_ms ({}) is smaller than base_delay_ms ({})",
                self.max_delay_ms,
                self.base_delay_ms
            );
        }
        if self.attempt_timeout_ms == Some(0) || self.total_timeout_ms == Some(0) {
            bail!("timeouts must be positive when set");
        }
        Ok(())
    }

    /// Delay to wait after the given (1-based) attempt failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay_ms as f64;
        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base * self.backoff_multiplier.powi(exponent)
            }
        };

        let delay_ms = if self.jitter || self.strategy == BackoffStrategy::ExponentialWithJitter {
            let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
            raw * factor
        } else {
            raw
        };

        let clamped = if delay_ms.is_nan() {
            self.max_delay_ms as f64
        } else {
            delay_ms.clamp(0.0, self.max_delay_ms as f64)
        };
        Duration::from_secs_f64(clamped / 1000.0)
    }
}

/// Retry handler metrics
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RetryMetrics {
    /// Every invocation of an operation
    pub total_attempts: u64,
    /// Operations that eventually succeeded
    pub total_successes: u64,
    /// Operations that gave up
    pub total_failures: u64,
    /// Time spent sleeping between attempts in milliseconds
    pub total_delay_ms: u64,
    /// Durations of the most recent attempts in milliseconds
    pub recent_attempt_durations_ms: VecDeque<u64>,
    /// Occurrences per fault type name
    pub fault_counts: HashMap<String, u64>,
}

impl RetryMetrics {
    fn record_attempt(&mut self, duration: Duration) {
        self.total_attempts += 1;
        self.recent_attempt_durations_ms
            .push_back(duration.as_millis() as u64);
        while self.recent_attempt_durations_ms.len() > DURATION_WINDOW {
            self.recent_attempt_durations_ms.pop_front();
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            1.0
        } else {
            self.total_successes as f64 / total as f64
        }
    }

    pub fn average_attempt_duration_ms(&self) -> f64 {
        if self.recent_attempt_durations_ms.is_empty() {
            0.0
        } else {
            self.recent_attempt_durations_ms.iter().sum::<u64>() as f64
                / self.recent_attempt_durations_ms.len() as f64
        }
    }
}

/// Point-in-time view of a retry handler
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryStatus {
    pub name: String,
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub total_delay_ms: u64,
    pub average_attempt_duration_ms: f64,
    pub fault_counts: HashMap<String, u64>,
}

/// Result of a successful retried operation
#[derive(Clone, Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Attempts used, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
}

enum AttemptError {
    Failed(Fault),
    DeadlineExceeded,
}

/// Retry handler implementation
#[derive(Clone)]
pub struct RetryHandler {
    name: String,
    config: Arc<RetryConfig>,
    metrics: Arc<Mutex<RetryMetrics>>,
}

impl RetryHandler {
    /// Create a new retry handler
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            metrics: Arc::new(Mutex::new(RetryMetrics::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to wait after the given (1-based) attempt failed
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.config.delay_for_attempt(attempt)
    }

    /// Whether a fault should be retried under this handler's configuration
    pub fn is_retryable(&self, fault: &Fault) -> bool {
        if self.config.non_retryable_faults.contains(fault.kind()) {
            return false;
        }
        match &self.config.predicate {
            Some(predicate) => predicate.matches(fault),
            None => self.config.retryable_faults.contains(fault.kind()),
        }
    }

    /// Execute an operation with retry, returning its value
    pub async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        self.execute_with_report(operation)
            .await
            .map(|outcome| outcome.value)
    }

    /// Execute an operation with retry, reporting how many attempts it took
    pub async fn execute_with_report<F, Fut, T>(
        &self,
        mut operation: F,
    ) -> ResilienceResult<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let start = Instant::now();
        let deadline = self.config.total_timeout().map(|budget| start + budget);
        let mut last_fault: Option<Fault> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(self.budget_exceeded(start, attempt - 1, last_fault).await);
            }

            let attempt_start = Instant::now();
            let result = self.run_attempt(&mut operation, deadline).await;
            let attempt_duration = attempt_start.elapsed();

            let fault = match result {
                Ok(value) => {
                    let mut metrics = self.metrics.lock().await;
                    metrics.record_attempt(attempt_duration);
                    metrics.total_successes += 1;
                    if attempt > 1 {
                        debug!(
                            "Retry handler {} succeeded after {} attempts",
                            self.name, attempt
                        );
                    }
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    });
                }
                Err(AttemptError::DeadlineExceeded) => {
                    self.metrics.lock().await.record_attempt(attempt_duration);
                    return Err(self.budget_exceeded(start, attempt, last_fault).await);
                }
                Err(AttemptError::Failed(fault)) => fault,
            };

            {
                let mut metrics = self.metrics.lock().await;
                metrics.record_attempt(attempt_duration);
                *metrics
                    .fault_counts
                    .entry(fault.type_name().to_string())
                    .or_insert(0) += 1;
            }

            if !self.is_retryable(&fault) {
                self.metrics.lock().await.total_failures += 1;
                warn!(
                    "Retry handler {} encountered non-retryable fault: {}",
                    self.name, fault
                );
                return Err(ResilienceError::Fault(fault));
            }

            if attempt >= max_attempts {
                self.metrics.lock().await.total_failures += 1;
                log_retries_exhausted(&self.name, attempt, &fault.to_string());
                return Err(ResilienceError::RetriesExhausted {
                    name: self.name.clone(),
                    attempts: attempt,
                    last: fault,
                });
            }

            let mut delay = self.calculate_delay(attempt);
            if let Some(deadline) = deadline {
                delay = delay.min(deadline.saturating_duration_since(Instant::now()));
            }
            log_retry_attempt(&self.name, attempt, max_attempts, delay, &fault.to_string());
            self.metrics.lock().await.total_delay_ms += delay.as_millis() as u64;
            last_fault = Some(fault);

            tokio::time::sleep(delay).await;
        }
    }

    /// Run one attempt bounded by the per-attempt timeout and the overall deadline
    async fn run_attempt<F, Fut, T>(
        &self,
        operation: &mut F,
        deadline: Option<Instant>,
    ) -> Result<T, AttemptError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let attempt_deadline = match (self.config.attempt_timeout(), deadline) {
            (Some(timeout), Some(deadline)) => Some((Instant::now() + timeout).min(deadline)),
            (Some(timeout), None) => Some(Instant::now() + timeout),
            (None, deadline) => deadline,
        };

        let future = operation();
        let Some(at) = attempt_deadline else {
            return future.await.map_err(AttemptError::Failed);
        };

        match tokio::time::timeout_at(at, future).await {
            Ok(result) => result.map_err(AttemptError::Failed),
            Err(_) if deadline.is_some_and(|deadline| Instant::now() >= deadline) => {
                Err(AttemptError::DeadlineExceeded)
            }
            Err(_) => Err(AttemptError::Failed(Fault::timeout(format!(
                "attempt timed out after {}ms",
                self.config.attempt_timeout_ms.unwrap_or_default()
            )))),
        }
    }

    async fn budget_exceeded(
        &self,
        start: Instant,
        attempts: u32,
        last: Option<Fault>,
    ) -> ResilienceError {
        self.metrics.lock().await.total_failures += 1;
        let elapsed = start.elapsed();
        warn!(
            "Retry handler {} exceeded its {}ms budget after {} attempts",
            self.name,
            self.config.total_timeout_ms.unwrap_or_default(),
            attempts
        );
        ResilienceError::RetryTimeout {
            name: self.name.clone(),
            elapsed,
            attempts,
            last,
        }
    }

    pub async fn metrics(&self) -> RetryMetrics {
        self.metrics.lock().await.clone()
    }

    /// Reset metrics
    pub async fn reset_metrics(&self) {
        *self.metrics.lock().await = RetryMetrics::default();
        debug!("Retry handler {} reset metrics", self.name);
    }

    pub async fn status(&self) -> RetryStatus {
        let metrics = self.metrics.lock().await;
        RetryStatus {
            name: self.name.clone(),
            max_attempts: self.config.max_attempts,
            strategy: self.config.strategy,
            total_attempts: metrics.total_attempts,
            total_successes: metrics.total_successes,
            total_failures: metrics.total_failures,
            success_rate: metrics.success_rate(),
            total_delay_ms: metrics.total_delay_ms,
            average_attempt_duration_ms: metrics.average_attempt_duration_ms(),
            fault_counts: metrics.fault_counts.clone(),
        }
    }
}
