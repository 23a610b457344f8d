//! Fault model and layer errors.
//!
//! A [`Fault`] is what a protected operation fails with. Its [`FaultKind`] plays
//! the role of an exception type: breakers, retry handlers and the classifier all
//! match on kinds, and kinds form a shallow hierarchy so that configuring
//! `Network` also covers `ConnectionRefused`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Type of a fault
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Generic connection failure
    Network,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    /// Operation did not finish in time
    Timeout,
    /// Caller lacks the rights for the operation
    PermissionDenied,
    /// Memory, disk, quota or similar exhaustion
    ResourceExhausted,
    /// A required file or configuration entry is missing
    NotFound,
    /// Argument had the right type but an invalid value
    InvalidArgument,
    /// Argument had the wrong type
    InvalidType,
    /// Lookup of a key that does not exist
    MissingKey,
    /// Access to a field or attribute that does not exist
    MissingAttribute,
    /// Generic operating-system level failure
    Io,
    /// Rejected by an open circuit breaker
    CircuitOpen,
    /// Bug or invariant violation in the caller
    Internal,
    /// Caller-defined fault type
    Custom(String),
}

impl FaultKind {
    /// Stable type name of this kind
    pub fn name(&self) -> &str {
        match self {
            FaultKind::Network => "NetworkError",
            FaultKind::ConnectionRefused => "ConnectionRefusedError",
            FaultKind::ConnectionReset => "ConnectionResetError",
            FaultKind::ConnectionAborted => "ConnectionAbortedError",
            FaultKind::Timeout => "TimeoutError",
            FaultKind::PermissionDenied => "PermissionError",
            FaultKind::ResourceExhausted => "ResourceExhaustedError",
            FaultKind::NotFound => "NotFoundError",
            FaultKind::InvalidArgument => "InvalidArgumentError",
            FaultKind::InvalidType => "InvalidTypeError",
            FaultKind::MissingKey => "MissingKeyError",
            FaultKind::MissingAttribute => "MissingAttributeError",
            FaultKind::Io => "IoError",
            FaultKind::CircuitOpen => "CircuitOpenError",
            FaultKind::Internal => "InternalError",
            FaultKind::Custom(name) => name,
        }
    }

    /// Direct parent kind in the fault hierarchy
    pub fn parent(&self) -> Option<FaultKind> {
        match self {
            FaultKind::ConnectionRefused
            | FaultKind::ConnectionReset
            | FaultKind::ConnectionAborted => Some(FaultKind::Network),
            FaultKind::Network
            | FaultKind::Timeout
            | FaultKind::PermissionDenied
            | FaultKind::NotFound => Some(FaultKind::Io),
            _ => None,
        }
    }

    /// Whether this kind is `other` or one of its descendants
    pub fn is_a(&self, other: &FaultKind) -> bool {
        let mut current = Some(self.clone());
        while let Some(kind) = current {
            if &kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of fault kinds, matched with hierarchy semantics
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSet {
    /// Every fault matches
    Any,
    /// Only the listed kinds (and their descendants) match
    Only(HashSet<FaultKind>),
}

impl FaultSet {
    /// Set matching nothing
    pub fn none() -> Self {
        FaultSet::Only(HashSet::new())
    }

    /// Set matching the given kinds
    pub fn of<I: IntoIterator<Item = FaultKind>>(kinds: I) -> Self {
        FaultSet::Only(kinds.into_iter().collect())
    }

    pub fn contains(&self, kind: &FaultKind) -> bool {
        match self {
            FaultSet::Any => true,
            FaultSet::Only(kinds) => kinds.iter().any(|k| kind.is_a(k)),
        }
    }
}

impl Default for FaultSet {
    fn default() -> Self {
        FaultSet::Any
    }
}

/// A failure reported by a protected operation
#[derive(Clone, Debug)]
pub struct Fault {
    kind: FaultKind,
    message: String,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(FaultKind::PermissionDenied, message)
    }

    pub fn custom(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Custom(type_name.into()), message)
    }

    /// Attach the underlying error that caused this fault
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn kind(&self) -> &FaultKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn type_name(&self) -> &str {
        self.kind.name()
    }

    /// Recover the layer error this fault was converted from, if any
    pub fn into_resilience_error(self) -> ResilienceError {
        if let Some(err) = self
            .source
            .as_ref()
            .and_then(|source| source.downcast_ref::<ResilienceError>())
        {
            return err.clone();
        }
        ResilienceError::Fault(self)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

impl StdError for Fault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Fault {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => FaultKind::ConnectionRefused,
            ErrorKind::ConnectionReset => FaultKind::ConnectionReset,
            ErrorKind::ConnectionAborted => FaultKind::ConnectionAborted,
            ErrorKind::NotConnected | ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable => {
                FaultKind::Network
            }
            ErrorKind::TimedOut | ErrorKind::WouldBlock => FaultKind::Timeout,
            ErrorKind::PermissionDenied => FaultKind::PermissionDenied,
            ErrorKind::NotFound => FaultKind::NotFound,
            ErrorKind::OutOfMemory => FaultKind::ResourceExhausted,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => FaultKind::InvalidArgument,
            _ => FaultKind::Io,
        };
        Fault::new(kind, err.to_string()).with_source(err)
    }
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        if let Some(fault) = err.downcast_ref::<Fault>() {
            return fault.clone();
        }
        let message = err.to_string();
        let source: Box<dyn StdError + Send + Sync> = err.into();
        Self {
            kind: FaultKind::Internal,
            message,
            source: Some(Arc::from(source)),
        }
    }
}

/// Errors raised by the fault-tolerance layer itself
#[derive(Clone, Debug, Error)]
pub enum ResilienceError {
    /// Breaker rejected the call without invoking the operation
    #[error("circuit breaker '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// Protected call exceeded the breaker's per-call timeout
    #[error("call through circuit breaker '{name}' timed out after {timeout:?}")]
    CallTimeout { name: String, timeout: Duration },

    #[error("retries exhausted for '{name}' after {attempts} attempts: {last}")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        #[source]
        last: Fault,
    },

    /// Whole-operation retry budget ran out
    #[error("retry budget for '{name}' exceeded after {elapsed:?} ({attempts} attempts)")]
    RetryTimeout {
        name: String,
        elapsed: Duration,
        attempts: u32,
        #[source]
        last: Option<Fault>,
    },

    #[error("all recovery strategies failed: {message}")]
    RecoveryFailed {
        message: String,
        #[source]
        fault: Fault,
    },

    /// Fault propagated unchanged from the protected operation
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl ResilienceError {
    /// The original operation fault behind this error, if one exists
    pub fn root_fault(&self) -> Option<&Fault> {
        match self {
            ResilienceError::RetriesExhausted { last, .. } => Some(last),
            ResilienceError::RetryTimeout { last, .. } => last.as_ref(),
            ResilienceError::RecoveryFailed { fault, .. } => Some(fault),
            ResilienceError::Fault(fault) => Some(fault),
            ResilienceError::CircuitOpen { .. } | ResilienceError::CallTimeout { .. } => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

impl From<ResilienceError> for Fault {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::Fault(fault) => fault,
            ResilienceError::CircuitOpen { .. } => {
                Fault::new(FaultKind::CircuitOpen, err.to_string()).with_source(err)
            }
            ResilienceError::CallTimeout { .. } | ResilienceError::RetryTimeout { .. } => {
                Fault::new(FaultKind::Timeout, err.to_string()).with_source(err)
            }
            ResilienceError::RetriesExhausted { ref last, .. }
            | ResilienceError::RecoveryFailed { fault: ref last, .. } => {
                let kind = last.kind().clone();
                Fault::new(kind, err.to_string()).with_source(err)
            }
        }
    }
}

pub type ResilienceResult<T> = std::result::Result<T, ResilienceError>;
