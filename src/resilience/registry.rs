//! Named registries of breakers and retry handlers
//!
//! A registry hands out one shared instance per name so the same logical
//! dependency always reuses the same state. Lookups take a read lock; the
//! write lock is only taken the first time a name is seen.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
use super::retry::{RetryConfig, RetryHandler, RetryStatus};

/// Success rate at or above which a retry handler counts as healthy
const RETRY_HEALTHY_RATE: f64 = 0.9;
/// Success rate below which a retry handler counts as failed
const RETRY_FAILED_RATE: f64 = 0.5;

/// Aggregate health level
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

impl HealthLevel {
    fn from_counts(total: usize, degraded: usize, failed: usize) -> Self {
        if failed == 0 && degraded == 0 {
            HealthLevel::Healthy
        } else if failed * 2 > total {
            HealthLevel::Critical
        } else {
            HealthLevel::Degraded
        }
    }

    /// The worse of two levels
    pub fn worst(self, other: HealthLevel) -> HealthLevel {
        match (self, other) {
            (HealthLevel::Critical, _) | (_, HealthLevel::Critical) => HealthLevel::Critical,
            (HealthLevel::Degraded, _) | (_, HealthLevel::Degraded) => HealthLevel::Degraded,
            _ => HealthLevel::Healthy,
        }
    }
}

/// Health summary of every instance in a registry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryHealth<S> {
    pub overall_health: HealthLevel,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub instances: Vec<S>,
}

impl<S> RegistryHealth<S> {
    fn summarize(instances: Vec<S>, level: impl Fn(&S) -> HealthLevel) -> Self {
        let (mut healthy, mut degraded, mut failed) = (0, 0, 0);
        for instance in &instances {
            match level(instance) {
                HealthLevel::Healthy => healthy += 1,
                HealthLevel::Degraded => degraded += 1,
                HealthLevel::Critical => failed += 1,
            }
        }
        Self {
            overall_health: HealthLevel::from_counts(instances.len(), degraded, failed),
            total: instances.len(),
            healthy,
            degraded,
            failed,
            instances,
        }
    }
}

/// Registry of circuit breakers keyed by dependency name
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    default_config: Arc<CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_default_config(CircuitBreakerConfig::default())
    }

    /// Registry whose new breakers start from `config` unless one is supplied
    pub fn with_default_config(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config: Arc::new(config),
        }
    }

    /// Get the breaker for `name`, creating it on first use
    ///
    /// `config` only applies when the breaker does not exist yet.
    pub async fn get_or_create(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut config = config.unwrap_or_else(|| self.default_config.as_ref().clone());
                config.name = name.to_string();
                info!(
                    "Registered circuit breaker {} (failure_threshold: {}, recovery_timeout_ms: {})",
                    name, config.failure_threshold, config.recovery_timeout_ms
                );
                CircuitBreaker::new(config)
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Reset every registered breaker to closed
    pub async fn reset_all(&self) {
        let breakers: Vec<CircuitBreaker> = self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    pub async fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let breakers: Vec<CircuitBreaker> = self.breakers.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            statuses.push(breaker.status().await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Closed breakers are healthy, half-open degraded, open failed
    pub async fn health(&self) -> RegistryHealth<CircuitBreakerStatus> {
        RegistryHealth::summarize(self.statuses().await, |status| match status.state {
            CircuitState::Closed => HealthLevel::Healthy,
            CircuitState::HalfOpen => HealthLevel::Degraded,
            CircuitState::Open => HealthLevel::Critical,
        })
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of retry handlers keyed by operation name
#[derive(Clone)]
pub struct RetryRegistry {
    handlers: Arc<RwLock<HashMap<String, RetryHandler>>>,
    default_config: Arc<RetryConfig>,
}

impl RetryRegistry {
    pub fn new() -> Self {
        Self::with_default_config(RetryConfig::default())
    }

    pub fn with_default_config(config: RetryConfig) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            default_config: Arc::new(config),
        }
    }

    /// Get the handler for `name`, creating it on first use
    ///
    /// `config` only applies when the handler does not exist yet.
    pub async fn get_or_create(&self, name: &str, config: Option<RetryConfig>) -> RetryHandler {
        if let Some(handler) = self.handlers.read().await.get(name) {
            return handler.clone();
        }

        let mut handlers = self.handlers.write().await;
        handlers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = config.unwrap_or_else(|| self.default_config.as_ref().clone());
                info!(
                    "Registered retry handler {} (max_attempts: {}, strategy: {:?})",
                    name, config.max_attempts, config.strategy
                );
                RetryHandler::new(name, config)
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<RetryHandler> {
        self.handlers.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn statuses(&self) -> Vec<RetryStatus> {
        let handlers: Vec<RetryHandler> = self.handlers.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(handlers.len());
        for handler in handlers {
            statuses.push(handler.status().await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Classify handlers by the success rate of the operations they ran
    pub async fn health(&self) -> RegistryHealth<RetryStatus> {
        RegistryHealth::summarize(self.statuses().await, |status| {
            if status.success_rate >= RETRY_HEALTHY_RATE {
                HealthLevel::Healthy
            } else if status.success_rate >= RETRY_FAILED_RATE {
                HealthLevel::Degraded
            } else {
                HealthLevel::Critical
            }
        })
    }
}

impl Default for RetryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
