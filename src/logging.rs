use chrono::Local;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::resilience::{CircuitState, ErrorCategory, RecoveryAction};

static INIT: Once = Once::new();

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Initialize the logging system
///
/// Honours `RUST_LOG`; defaults to `info`. Safe to call more than once.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // Another subscriber may already be installed by the host application.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(LocalTimer)
            .with_target(true)
            .try_init();
    });
}

/// Log a circuit breaker state transition
pub fn log_state_transition(breaker: &str, from: &CircuitState, to: &CircuitState, reason: &str) {
    match to {
        CircuitState::Open => warn!(
            "Circuit breaker {} transitioned from {} to {}: {}",
            breaker, from, to, reason
        ),
        _ => info!(
            "Circuit breaker {} transitioned from {} to {}: {}",
            breaker, from, to, reason
        ),
    }
}

/// Log a failed attempt that will be retried
pub fn log_retry_attempt(handler: &str, attempt: u32, max_attempts: u32, delay: Duration, fault: &str) {
    debug!(
        "Retry handler {} failed attempt {}/{} ({}), retrying in {}ms",
        handler,
        attempt,
        max_attempts,
        fault,
        delay.as_millis()
    );
}

/// Log a retry loop that ran out of attempts
pub fn log_retries_exhausted(handler: &str, attempts: u32, fault: &str) {
    warn!(
        "Retry handler {} exhausted {} attempts, last fault: {}",
        handler, attempts, fault
    );
}

/// Log the outcome of one recovery attempt
pub fn log_recovery_attempt(
    category: &ErrorCategory,
    action: &RecoveryAction,
    success: bool,
    duration: Duration,
) {
    if success {
        info!(
            "Recovery for {} error via {} succeeded in {}ms",
            category,
            action,
            duration.as_millis()
        );
    } else {
        warn!(
            "Recovery for {} error via {} failed after {}ms",
            category,
            action,
            duration.as_millis()
        );
    }
}
