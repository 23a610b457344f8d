//! Error recovery orchestration
//!
//! [`ErrorRecoverySystem`] classifies a fault and dispatches the first
//! recommended action that has a registered strategy. A strategy that returns
//! a result ends the search, whether it succeeded or not; only a strategy that
//! errors out hands over to the next action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::warn;

use super::classifier::{
    ErrorCategory, ErrorClassification, ErrorClassifier, ErrorSeverity, RecoveryAction,
};
use super::strategies::{
    timed_execute, DegradeStrategy, FallbackStrategy, NotifyStrategy, RecoveryContext,
    RecoveryResult, RecoveryStrategy, RetryStrategy,
};
use crate::error::Fault;
use crate::logging::log_recovery_attempt;

/// Default number of recovery attempts kept for diagnostics
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Number of attempts included in a status report
const STATUS_RECENT_ATTEMPTS: usize = 10;

/// Diagnostic record of one recovery attempt
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub timestamp: DateTime<Utc>,
    pub fault_type: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub action: RecoveryAction,
    pub success: bool,
    pub duration_ms: u64,
    pub confidence: f64,
}

/// Point-in-time view of the recovery system
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryStatus {
    pub registered_strategies: Vec<RecoveryAction>,
    /// Attempts currently held in the history window
    pub total_attempts: usize,
    pub successful_attempts: usize,
    pub success_rate: f64,
    pub attempts_by_category: HashMap<ErrorCategory, usize>,
    pub classifier_cache_size: usize,
    pub recent_attempts: Vec<RecoveryAttempt>,
}

/// Classifies faults and runs recovery strategies
pub struct ErrorRecoverySystem {
    classifier: ErrorClassifier,
    strategies: HashMap<RecoveryAction, Arc<dyn RecoveryStrategy>>,
    history: Mutex<VecDeque<RecoveryAttempt>>,
    history_limit: usize,
}

impl ErrorRecoverySystem {
    /// Recovery system with the built-in classifier and strategies
    pub fn new() -> Self {
        Self::with_builtin_strategies(ErrorClassifier::new())
    }

    /// Recovery system using `classifier` with the built-in strategies registered
    pub fn with_builtin_strategies(classifier: ErrorClassifier) -> Self {
        let mut system = Self::with_classifier(classifier);
        system.register_strategy(RecoveryAction::Retry, Arc::new(RetryStrategy));
        system.register_strategy(RecoveryAction::Fallback, Arc::new(FallbackStrategy));
        system.register_strategy(RecoveryAction::Degrade, Arc::new(DegradeStrategy));
        system.register_strategy(RecoveryAction::Notify, Arc::new(NotifyStrategy));
        system
    }

    /// Recovery system with no strategies registered
    pub fn with_classifier(classifier: ErrorClassifier) -> Self {
        Self {
            classifier,
            strategies: HashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Register or replace the strategy for an action
    pub fn register_strategy(&mut self, action: RecoveryAction, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.insert(action, strategy);
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn classify(&self, fault: &Fault, context: &RecoveryContext) -> ErrorClassification {
        self.classifier.classify(fault, &context.values)
    }

    /// Classify a fault and run the first applicable recovery strategy
    pub async fn handle_error(&self, fault: &Fault, context: &RecoveryContext) -> RecoveryResult {
        let start = Instant::now();
        let classification = self.classify(fault, context);

        if !classification.is_recoverable {
            let mut result = RecoveryResult::failed(RecoveryAction::FailFast, classification.reason.clone());
            result.duration = start.elapsed();
            self.record(fault, &classification, &result).await;
            return annotate(result, &classification);
        }

        for action in &classification.recovery_actions {
            let Some(strategy) = self.strategies.get(action) else {
                continue;
            };

            match timed_execute(strategy.as_ref(), fault, &classification, context).await {
                Ok(result) => {
                    self.record(fault, &classification, &result).await;
                    return annotate(result, &classification);
                }
                Err(strategy_fault) => {
                    warn!(
                        "Recovery strategy {} for {} raised {}, trying next action",
                        action,
                        fault.type_name(),
                        strategy_fault
                    );
                    let mut failed = RecoveryResult::failed(*action, strategy_fault.to_string());
                    failed.duration = start.elapsed();
                    self.record(fault, &classification, &failed).await;
                }
            }
        }

        let mut result = RecoveryResult::failed(RecoveryAction::FailFast, "all recovery strategies failed");
        result.duration = start.elapsed();
        self.record(fault, &classification, &result).await;
        annotate(result, &classification)
    }

    async fn record(&self, fault: &Fault, classification: &ErrorClassification, result: &RecoveryResult) {
        log_recovery_attempt(
            &classification.category,
            &result.action_taken,
            result.success,
            result.duration,
        );

        let mut history = self.history.lock().await;
        history.push_back(RecoveryAttempt {
            timestamp: Utc::now(),
            fault_type: fault.type_name().to_string(),
            category: classification.category,
            severity: classification.severity,
            action: result.action_taken,
            success: result.success,
            duration_ms: result.duration.as_millis() as u64,
            confidence: classification.confidence,
        });
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Recovery attempts currently held, oldest first
    pub async fn history(&self) -> Vec<RecoveryAttempt> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn status(&self) -> RecoveryStatus {
        let history = self.history.lock().await;
        let successful_attempts = history.iter().filter(|attempt| attempt.success).count();
        let mut attempts_by_category = HashMap::new();
        for attempt in history.iter() {
            *attempts_by_category.entry(attempt.category).or_insert(0) += 1;
        }

        let mut registered_strategies: Vec<RecoveryAction> = self.strategies.keys().copied().collect();
        registered_strategies.sort_by_key(|action| action.to_string());

        RecoveryStatus {
            registered_strategies,
            total_attempts: history.len(),
            successful_attempts,
            success_rate: if history.is_empty() {
                1.0
            } else {
                successful_attempts as f64 / history.len() as f64
            },
            attempts_by_category,
            classifier_cache_size: self.classifier.cache_len(),
            recent_attempts: history
                .iter()
                .rev()
                .take(STATUS_RECENT_ATTEMPTS)
                .rev()
                .cloned()
                .collect(),
        }
    }
}

impl Default for ErrorRecoverySystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy the classification verdict into the result context
fn annotate(result: RecoveryResult, classification: &ErrorClassification) -> RecoveryResult {
    result
        .with_context("category", classification.category.to_string())
        .with_context("confidence", classification.confidence)
}
