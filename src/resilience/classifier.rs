//! Error classification
//!
//! Maps a [`Fault`] to an [`ErrorClassification`]: category, severity,
//! recoverability and an ordered list of recovery actions. Rules are checked
//! top to bottom; when none matches, a keyword scan over the fault's type name
//! and message picks a lower-confidence answer. Results are cached by fault
//! type and message prefix.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Fault, FaultKind};

/// Default number of cached classifications before eviction
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Characters of the fault message that take part in the cache key
const CACHE_KEY_MESSAGE_CHARS: usize = 100;

const NETWORK_KEYWORDS: &[&str] = &[
    "connection",
    "network",
    "socket",
    "unreachable",
    "dns",
    "refused",
    "timed out",
    "timeout",
];
const RESOURCE_KEYWORDS: &[&str] = &[
    "memory",
    "disk",
    "quota",
    "exhausted",
    "capacity",
    "too many",
    "rate limit",
];
const AUTH_KEYWORDS: &[&str] = &[
    "auth",
    "permission",
    "forbidden",
    "unauthorized",
    "credential",
    "access denied",
    "token",
];

/// Error category
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Configuration,
    Authentication,
    Network,
    Resource,
    BusinessLogic,
    System,
    External,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Network => "network",
            ErrorCategory::Resource => "resource",
            ErrorCategory::BusinessLogic => "business_logic",
            ErrorCategory::System => "system",
            ErrorCategory::External => "external",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Error severity, most severe first
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

/// Recovery action a classification can recommend
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Degrade,
    Restart,
    Notify,
    FailFast,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::Degrade => "degrade",
            RecoveryAction::Restart => "restart",
            RecoveryAction::Notify => "notify",
            RecoveryAction::FailFast => "fail_fast",
        };
        f.write_str(name)
    }
}

/// Classification of a single fault
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub is_recoverable: bool,
    /// Recovery actions in order of preference
    pub recovery_actions: Vec<RecoveryAction>,
    /// Certainty of this classification (0.0 - 1.0)
    pub confidence: f64,
    pub recommended_retries: u32,
    pub recommended_backoff_secs: f64,
    pub context: HashMap<String, Value>,
    pub reason: String,
}

impl ErrorClassification {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        is_recoverable: bool,
        recovery_actions: Vec<RecoveryAction>,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            is_recoverable,
            recovery_actions,
            confidence: confidence.clamp(0.0, 1.0),
            recommended_retries: 0,
            recommended_backoff_secs: 0.0,
            context: HashMap::new(),
            reason: reason.into(),
        }
    }

    pub fn with_retry_hint(mut self, retries: u32, backoff_secs: f64) -> Self {
        self.recommended_retries = retries;
        self.recommended_backoff_secs = backoff_secs;
        self
    }
}

type RulePredicate = Arc<dyn Fn(&Fault) -> bool + Send + Sync>;

/// One entry of the classification table
#[derive(Clone)]
pub struct ClassificationRule {
    name: String,
    kinds: Vec<FaultKind>,
    predicate: Option<RulePredicate>,
    classification: ErrorClassification,
}

impl ClassificationRule {
    /// Rule matching any of `kinds` (or their descendants)
    pub fn new(
        name: impl Into<String>,
        kinds: impl IntoIterator<Item = FaultKind>,
        classification: ErrorClassification,
    ) -> Self {
        Self {
            name: name.into(),
            kinds: kinds.into_iter().collect(),
            predicate: None,
            classification,
        }
    }

    /// Narrow the rule with a check on the fault itself
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Fault) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, fault: &Fault) -> bool {
        self.kinds.iter().any(|kind| fault.kind().is_a(kind))
            && self.predicate.as_ref().map_or(true, |predicate| predicate(fault))
    }
}

impl fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("name", &self.name)
            .field("kinds", &self.kinds)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

type CacheKey = (FaultKind, String);

#[derive(Default)]
struct ClassificationCache {
    entries: HashMap<CacheKey, ErrorClassification>,
    order: VecDeque<CacheKey>,
}

impl ClassificationCache {
    fn insert(&mut self, key: CacheKey, classification: ErrorClassification, capacity: usize) {
        if self.entries.insert(key.clone(), classification).is_none() {
            self.order.push_back(key);
        }
        if self.entries.len() > capacity {
            let evict = self.order.len() / 2;
            for key in self.order.drain(..evict) {
                self.entries.remove(&key);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Rule-table error classifier with a bounded result cache
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
    cache: Mutex<ClassificationCache>,
    cache_capacity: usize,
}

impl ErrorClassifier {
    /// Classifier with the built-in rule table
    pub fn new() -> Self {
        let mut classifier = Self::empty();
        classifier.rules = builtin_rules();
        classifier
    }

    /// Classifier with no rules; only the keyword heuristics apply
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            cache: Mutex::new(ClassificationCache::default()),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    /// Append a rule after the existing ones
    pub fn add_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
        self.cache.lock().clear();
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify a fault, attaching `context` to the result
    pub fn classify(&self, fault: &Fault, context: &HashMap<String, Value>) -> ErrorClassification {
        let key: CacheKey = (
            fault.kind().clone(),
            fault.message().chars().take(CACHE_KEY_MESSAGE_CHARS).collect(),
        );

        let cached = self.cache.lock().entries.get(&key).cloned();
        let mut classification = match cached {
            Some(classification) => classification,
            None => {
                let classification = self.classify_uncached(fault);
                debug!(
                    "Classified {} as {} ({:?}, confidence {:.2}): {}",
                    fault.type_name(),
                    classification.category,
                    classification.severity,
                    classification.confidence,
                    classification.reason
                );
                self.cache
                    .lock()
                    .insert(key, classification.clone(), self.cache_capacity);
                classification
            }
        };

        classification.context = context.clone();
        classification
            .context
            .insert("fault_type".to_string(), Value::from(fault.type_name()));
        classification
    }

    fn classify_uncached(&self, fault: &Fault) -> ErrorClassification {
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(fault)) {
            return rule.classification.clone();
        }
        classify_by_keywords(fault)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_by_keywords(fault: &Fault) -> ErrorClassification {
    let text = format!("{} {}", fault.type_name(), fault.message()).to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|keyword| text.contains(keyword));

    if mentions(NETWORK_KEYWORDS) {
        ErrorClassification::new(
            ErrorCategory::Network,
            ErrorSeverity::Medium,
            true,
            vec![RecoveryAction::Retry, RecoveryAction::Fallback],
            0.7,
            "Fault text suggests a network problem",
        )
        .with_retry_hint(3, 2.0)
    } else if mentions(RESOURCE_KEYWORDS) {
        ErrorClassification::new(
            ErrorCategory::Resource,
            ErrorSeverity::High,
            true,
            vec![RecoveryAction::Retry, RecoveryAction::Degrade],
            0.6,
            "Fault text suggests resource exhaustion",
        )
        .with_retry_hint(2, 5.0)
    } else if mentions(AUTH_KEYWORDS) {
        ErrorClassification::new(
            ErrorCategory::Authentication,
            ErrorSeverity::High,
            false,
            vec![RecoveryAction::Notify, RecoveryAction::FailFast],
            0.6,
            "Fault text suggests an authentication problem",
        )
    } else {
        ErrorClassification::new(
            ErrorCategory::Unknown,
            ErrorSeverity::Medium,
            true,
            vec![RecoveryAction::Retry, RecoveryAction::Notify],
            0.5,
            format!("No rule matched {}", fault.type_name()),
        )
        .with_retry_hint(1, 1.0)
    }
}

fn builtin_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::new(
            "network",
            [FaultKind::Network],
            ErrorClassification::new(
                ErrorCategory::Network,
                ErrorSeverity::Medium,
                true,
                vec![RecoveryAction::Retry, RecoveryAction::Fallback],
                0.9,
                "Network connectivity fault",
            )
            .with_retry_hint(3, 2.0),
        ),
        ClassificationRule::new(
            "timeout",
            [FaultKind::Timeout],
            ErrorClassification::new(
                ErrorCategory::Transient,
                ErrorSeverity::Medium,
                true,
                vec![RecoveryAction::Retry, RecoveryAction::Degrade],
                0.85,
                "Operation timed out",
            )
            .with_retry_hint(3, 1.0),
        ),
        ClassificationRule::new(
            "permission",
            [FaultKind::PermissionDenied],
            ErrorClassification::new(
                ErrorCategory::Authentication,
                ErrorSeverity::High,
                false,
                vec![RecoveryAction::Notify, RecoveryAction::FailFast],
                0.95,
                "Permission denied",
            ),
        ),
        ClassificationRule::new(
            "resource",
            [FaultKind::ResourceExhausted],
            ErrorClassification::new(
                ErrorCategory::Resource,
                ErrorSeverity::High,
                true,
                vec![
                    RecoveryAction::Retry,
                    RecoveryAction::Degrade,
                    RecoveryAction::Restart,
                ],
                0.8,
                "Resource exhausted",
            )
            .with_retry_hint(2, 5.0),
        ),
        ClassificationRule::new(
            "missing_configuration",
            [FaultKind::NotFound],
            ErrorClassification::new(
                ErrorCategory::Configuration,
                ErrorSeverity::Medium,
                true,
                vec![RecoveryAction::Fallback, RecoveryAction::Notify],
                0.8,
                "Required configuration or file is missing",
            ),
        ),
        ClassificationRule::new(
            "invalid_input",
            [FaultKind::InvalidArgument, FaultKind::InvalidType],
            ErrorClassification::new(
                ErrorCategory::BusinessLogic,
                ErrorSeverity::Medium,
                false,
                vec![RecoveryAction::Notify, RecoveryAction::FailFast],
                0.7,
                "Invalid input value or type",
            ),
        ),
        ClassificationRule::new(
            "missing_field",
            [FaultKind::MissingKey, FaultKind::MissingAttribute],
            ErrorClassification::new(
                ErrorCategory::Configuration,
                ErrorSeverity::Medium,
                false,
                vec![RecoveryAction::Notify, RecoveryAction::FailFast],
                0.7,
                "Missing key or attribute",
            ),
        ),
        ClassificationRule::new(
            "circuit_open",
            [FaultKind::CircuitOpen],
            ErrorClassification::new(
                ErrorCategory::External,
                ErrorSeverity::Medium,
                true,
                vec![RecoveryAction::Fallback, RecoveryAction::Degrade],
                0.9,
                "Dependency circuit is open",
            ),
        ),
    ]
}
