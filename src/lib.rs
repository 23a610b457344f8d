//! Fault-tolerance layer for calls to unreliable dependencies.
//!
//! Circuit breakers fail fast once a dependency is unhealthy, retry handlers
//! re-attempt transient failures with backoff, and the error recovery system
//! classifies faults and dispatches recovery strategies. See [`resilience`].

pub mod config;
pub mod error;
pub mod logging;
pub mod resilience;

pub use config::{RecoverySettings, ResilienceConfig};
pub use error::{Fault, FaultKind, FaultSet, ResilienceError, ResilienceResult};
pub use resilience::ResilienceManager;
