//! Testing tools for the fault-tolerance layer
//!
//! Scripted operations fail a fixed number of times before succeeding, and the
//! chaos injector wraps real operations with seeded random faults and latency.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::{Fault, FaultKind, ResilienceError};

/// Operation that fails a set number of times, then succeeds forever
#[derive(Clone)]
pub struct ScriptedOperation<T> {
    failures_before_success: u32,
    fault: Fault,
    value: T,
    latency: Duration,
    calls: Arc<AtomicU32>,
}

impl<T: Clone> ScriptedOperation<T> {
    pub fn succeeding(value: T) -> Self {
        Self::failing_times(0, Fault::network("unused"), value)
    }

    pub fn failing_times(failures: u32, fault: Fault, value: T) -> Self {
        Self {
            failures_before_success: failures,
            fault,
            value,
            latency: Duration::ZERO,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn always_failing(fault: Fault, value: T) -> Self {
        Self::failing_times(u32::MAX, fault, value)
    }

    /// Sleep this long inside every invocation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn invoke(&self) -> Result<T, Fault> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if call < self.failures_before_success {
            Err(self.fault.clone())
        } else {
            Ok(self.value.clone())
        }
    }

    /// Number of times the operation was invoked
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Chaos testing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Probability (0.0 - 1.0) of replacing a call with a fault
    pub failure_rate: f64,
    /// Kind of the injected fault
    pub fault_kind: FaultKind,
    /// Latency added before every call in milliseconds
    pub latency_ms: u64,
    /// Seed for reproducible runs
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.2,
            fault_kind: FaultKind::Network,
            latency_ms: 0,
            seed: 42,
        }
    }
}

/// Wraps operations with seeded random faults
pub struct ChaosInjector {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl ChaosInjector {
    pub fn new(config: ChaosConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng: Mutex::new(rng),
            injected: AtomicU64::new(0),
        }
    }

    /// Run `operation`, or fail in its place with the configured probability
    pub async fn wrap<F, Fut, T>(&self, operation: F) -> Result<T, Fault>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let inject = self.rng.lock().gen_bool(self.config.failure_rate.clamp(0.0, 1.0));
        if inject {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(Fault::new(self.config.fault_kind.clone(), "injected chaos fault"));
        }
        operation().await
    }

    /// Number of faults injected so far
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }
}

/// Summary of a breaker trial run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerTrialReport {
    pub breaker: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub state_transitions: usize,
    pub final_state: CircuitState,
}

/// Drive `requests` sequential calls through a breaker under chaos
pub async fn run_breaker_trial(
    breaker: &CircuitBreaker,
    injector: &ChaosInjector,
    requests: u64,
) -> BreakerTrialReport {
    let mut report = BreakerTrialReport {
        breaker: breaker.name().to_string(),
        requests,
        successes: 0,
        failures: 0,
        rejected: 0,
        state_transitions: 0,
        final_state: CircuitState::Closed,
    };

    for _ in 0..requests {
        let outcome = breaker
            .call(|| injector.wrap(|| async { Ok::<_, Fault>(()) }))
            .await;
        match outcome {
            Ok(()) => report.successes += 1,
            Err(ResilienceError::CircuitOpen { .. }) => report.rejected += 1,
            Err(_) => report.failures += 1,
        }
    }

    report.state_transitions = breaker.transitions().await.len();
    report.final_state = breaker.state().await;
    report
}
