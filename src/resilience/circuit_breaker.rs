//! Circuit Breaker implementation
//!
//! Each breaker guards one logical dependency. It counts consecutive successes
//! and failures of the calls it protects and moves between `Closed`, `Open`
//! and `HalfOpen` accordingly. Only the admission check and the bookkeeping
//! after a call take the breaker's lock; the protected operation itself runs
//! unlocked so concurrent callers only contend on the cheap state check.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Fault, FaultSet, ResilienceError, ResilienceResult};
use crate::logging::log_state_transition;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests are allowed
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Probing whether the dependency is healthy again
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Unique name of the protected dependency
    pub name: String,
    /// Number of consecutive counted failures before opening the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit may be probed, in milliseconds
    pub recovery_timeout_ms: u64,
    /// Consecutive successes required in half-open state to close the circuit
    pub success_threshold: u32,
    /// Timeout applied to every protected call, in milliseconds
    pub call_timeout_ms: u64,
    /// Fault kinds that count as failures
    pub counted_faults: FaultSet,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 3,
            call_timeout_ms: 30_000,
            counted_faults: FaultSet::Any,
        }
    }
}

impl CircuitBreakerConfig {
    /// Default configuration under the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Reject configurations the state machine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("circuit breaker name must not be empty");
        }
        if self.failure_threshold < 1 {
            bail!("circuit breaker '{}': failure_threshold must be at least 1", self.name);
        }
        if self.success_threshold < 1 {
            bail!("circuit breaker '{}': success_threshold must be at least 1", self.name);
        }
        if self.call_timeout_ms == 0 {
            bail!("circuit breaker '{}': call_timeout_ms must be positive", self.name);
        }
        Ok(())
    }
}

/// A recorded state change
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Condition that triggered the change
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Circuit breaker metrics
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct CircuitBreakerMetrics {
    /// Requests seen, including rejected ones
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Requests that failed with a counted fault or timed out
    pub failed_requests: u64,
    /// Requests rejected while the circuit was open
    pub rejected_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    /// Append-only log of state changes
    pub state_transitions: Vec<StateTransition>,
    /// Number of times the circuit moved to half-open to probe recovery
    pub recovery_attempts: u64,
}

impl CircuitBreakerMetrics {
    /// Success rate (0.0 - 1.0) over all requests; 1.0 before any request
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Point-in-time view of a breaker, for health reporting
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub success_rate: f64,
    /// Whether a call made now would be attempted
    pub can_execute: bool,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub recovery_attempts: u64,
    /// Milliseconds spent in the current state
    pub time_in_state_ms: u64,
}

struct BreakerInner {
    state: CircuitState,
    metrics: CircuitBreakerMetrics,
    last_failure_at: Option<Instant>,
    state_since: Instant,
}

impl BreakerInner {
    fn recovery_elapsed(&self, recovery_timeout: Duration) -> bool {
        let since = self.last_failure_at.unwrap_or(self.state_since);
        since.elapsed() >= recovery_timeout
    }

    fn can_execute(&self, recovery_timeout: Duration) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.recovery_elapsed(recovery_timeout),
        }
    }
}

/// Circuit breaker implementation
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                metrics: CircuitBreakerMetrics::default(),
                last_failure_at: None,
                state_since: Instant::now(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation under circuit breaker protection
    ///
    /// Fails fast with [`ResilienceError::CircuitOpen`] while the circuit is open.
    /// Faults outside `counted_faults` are returned unchanged and leave the
    /// breaker untouched.
    pub async fn call<F, Fut, T>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        self.acquire_permission().await?;

        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(fault)) => {
                if self.config.counted_faults.contains(fault.kind()) {
                    self.record_failure(&fault.to_string()).await;
                } else {
                    debug!(
                        "Circuit breaker {} ignoring uncounted fault {}",
                        self.config.name,
                        fault.type_name()
                    );
                }
                Err(ResilienceError::Fault(fault))
            }
            Err(_) => {
                // The in-flight call is dropped here; only the metrics remember it.
                self.record_failure(&format!("call timed out after {}ms", self.config.call_timeout_ms))
                    .await;
                Err(ResilienceError::CallTimeout {
                    name: self.config.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Decide whether a call may proceed, probing recovery when the timeout elapsed
    async fn acquire_permission(&self) -> ResilienceResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let recovery_timeout = self.config.recovery_timeout();
        if inner.recovery_elapsed(recovery_timeout) {
            self.transition(&mut inner, CircuitState::HalfOpen, "recovery timeout elapsed");
            return Ok(());
        }

        inner.metrics.total_requests += 1;
        inner.metrics.rejected_requests += 1;
        let since = inner.last_failure_at.unwrap_or(inner.state_since);
        let retry_after = recovery_timeout.saturating_sub(since.elapsed());
        debug!(
            "Circuit breaker {} rejected call, retry after {}ms",
            self.config.name,
            retry_after.as_millis()
        );
        Err(ResilienceError::CircuitOpen {
            name: self.config.name.clone(),
            retry_after,
        })
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        let metrics = &mut inner.metrics;
        metrics.total_requests += 1;
        metrics.successful_requests += 1;
        metrics.consecutive_failures = 0;
        metrics.consecutive_successes += 1;
        metrics.last_success_time = Some(Utc::now());

        if inner.state == CircuitState::HalfOpen
            && inner.metrics.consecutive_successes >= self.config.success_threshold
        {
            let reason = format!(
                "{} consecutive successes in half-open state",
                inner.metrics.consecutive_successes
            );
            self.transition(&mut inner, CircuitState::Closed, &reason);
        }
    }

    async fn record_failure(&self, cause: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(Instant::now());
        let metrics = &mut inner.metrics;
        metrics.total_requests += 1;
        metrics.failed_requests += 1;
        metrics.consecutive_successes = 0;
        metrics.consecutive_failures += 1;
        metrics.last_failure_time = Some(Utc::now());

        let failures = inner.metrics.consecutive_failures;
        let state = inner.state;
        match state {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                let reason = format!("{} consecutive failures, last: {}", failures, cause);
                self.transition(&mut inner, CircuitState::Open, &reason);
            }
            CircuitState::HalfOpen => {
                let reason = format!("failure while half-open: {}", cause);
                self.transition(&mut inner, CircuitState::Open, &reason);
            }
            _ => {}
        }
    }

    /// Apply a state change; caller holds the lock
    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.state_since = Instant::now();
        match to {
            CircuitState::HalfOpen => {
                inner.metrics.consecutive_successes = 0;
                inner.metrics.recovery_attempts += 1;
            }
            CircuitState::Closed => inner.metrics.consecutive_failures = 0,
            CircuitState::Open => {}
        }
        inner.metrics.state_transitions.push(StateTransition {
            from,
            to,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });

        log_state_transition(&self.config.name, &from, &to, reason);
    }

    /// Force the circuit closed and zero both consecutive counters
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Closed, "manual reset");
        inner.metrics.consecutive_failures = 0;
        inner.metrics.consecutive_successes = 0;
        inner.last_failure_at = None;
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        self.inner.lock().await.metrics.clone()
    }

    pub async fn transitions(&self) -> Vec<StateTransition> {
        self.inner.lock().await.metrics.state_transitions.clone()
    }

    /// Whether a call made now would be attempted rather than rejected
    pub async fn can_execute(&self) -> bool {
        self.inner
            .lock()
            .await
            .can_execute(self.config.recovery_timeout())
    }

    pub async fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock().await;
        let metrics = &inner.metrics;
        CircuitBreakerStatus {
            name: self.config.name.clone(),
            state: inner.state,
            total_requests: metrics.total_requests,
            successful_requests: metrics.successful_requests,
            failed_requests: metrics.failed_requests,
            rejected_requests: metrics.rejected_requests,
            consecutive_failures: metrics.consecutive_failures,
            consecutive_successes: metrics.consecutive_successes,
            success_rate: metrics.success_rate(),
            can_execute: inner.can_execute(self.config.recovery_timeout()),
            last_failure_time: metrics.last_failure_time,
            last_success_time: metrics.last_success_time,
            recovery_attempts: metrics.recovery_attempts,
            time_in_state_ms: inner.state_since.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_thresholds() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::named("payments")
        };
        assert!(config.validate().is_err());
        assert!(CircuitBreakerConfig::named("payments").validate().is_ok());
    }

    #[test]
    fn success_rate_defaults_to_one() {
        assert_eq!(CircuitBreakerMetrics::default().success_rate(), 1.0);
    }

    #[tokio::test]
    async fn transitions_are_logged_with_reason() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::named("licensing")
        });

        let _ = breaker
            .call(|| async { Err::<(), _>(Fault::network("refused")) })
            .await;

        let transitions = breaker.transitions().await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, CircuitState::Closed);
        assert_eq!(transitions[0].to, CircuitState::Open);
        assert!(transitions[0].reason.contains("NetworkError: refused"));
    }
}
