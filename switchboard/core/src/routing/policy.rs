//! Routing Policy
//!
//! Declarative rules mapping a request's task type, size and risk to the set
//! of adapters allowed to serve it.
//!
//! # Matching
//!
//! ```text
//! 1. Rules are tried in order; the first whose predicates all hold wins
//! 2. An empty rule set behaves as one catch-all rule over every adapter
//! 3. A non-empty rule set with no match fails closed (NoEligibleAdapter)
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::{RiskLevel, TaskClass};
use crate::consensus::Strategy;
use crate::protocol::{AdapterId, ErrorCode};

// ============================================================================
// Route Query
// ============================================================================

/// The request attributes rules are matched against
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RouteQuery {
    /// Task type
    pub task_class: TaskClass,
    /// Request size in tokens
    pub size_tokens: u64,
    /// Declared risk
    pub risk: RiskLevel,
}

impl RouteQuery {
    /// Create a query
    #[must_use]
    pub fn new(task_class: TaskClass, size_tokens: u64, risk: RiskLevel) -> Self {
        Self {
            task_class,
            size_tokens,
            risk,
        }
    }
}

// ============================================================================
// Policy Rule
// ============================================================================

/// One routing rule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule name, reported in plans and telemetry
    pub name: String,

    /// Task types this rule covers (empty = any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_types: Vec<TaskClass>,

    /// Smallest request size in tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size_tokens: Option<u64>,

    /// Largest request size in tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_tokens: Option<u64>,

    /// Highest risk this rule accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_risk: Option<RiskLevel>,

    /// Adapters allowed to serve (empty = every advertised adapter)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eligible_adapters: Vec<AdapterId>,

    /// Adapter to escalate to when consensus is weak
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_adapter: Option<AdapterId>,

    /// Candidates estimated above this are dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_ceiling_usd: Option<f64>,

    /// Reconciliation strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Quality the primary must be predicted to reach
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_target: Option<f64>,
}

impl PolicyRule {
    /// Catch-all rule with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_types: Vec::new(),
            min_size_tokens: None,
            max_size_tokens: None,
            max_risk: None,
            eligible_adapters: Vec::new(),
            escalation_adapter: None,
            budget_ceiling_usd: None,
            strategy: Strategy::default(),
            quality_target: None,
        }
    }

    /// Restrict to task types
    #[must_use]
    pub fn for_tasks(mut self, tasks: impl IntoIterator<Item = TaskClass>) -> Self {
        self.task_types = tasks.into_iter().collect();
        self
    }

    /// Restrict by size
    #[must_use]
    pub fn with_size(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_size_tokens = min;
        self.max_size_tokens = max;
        self
    }

    /// Restrict by risk
    #[must_use]
    pub fn with_max_risk(mut self, risk: RiskLevel) -> Self {
        self.max_risk = Some(risk);
        self
    }

    /// Set the eligible adapters
    #[must_use]
    pub fn with_adapters<I, A>(mut self, adapters: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AdapterId>,
    {
        self.eligible_adapters = adapters.into_iter().map(Into::into).collect();
        self
    }

    /// Set the escalation adapter
    #[must_use]
    pub fn with_escalation(mut self, adapter: impl Into<AdapterId>) -> Self {
        self.escalation_adapter = Some(adapter.into());
        self
    }

    /// Set the budget ceiling
    #[must_use]
    pub fn with_budget_ceiling(mut self, usd: f64) -> Self {
        self.budget_ceiling_usd = Some(usd);
        self
    }

    /// Set the reconciliation strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the quality target
    #[must_use]
    pub fn with_quality_target(mut self, target: f64) -> Self {
        self.quality_target = Some(target);
        self
    }

    /// Whether every predicate holds for `query`
    #[must_use]
    pub fn matches(&self, query: &RouteQuery) -> bool {
        if !self.task_types.is_empty() && !self.task_types.contains(&query.task_class) {
            return false;
        }
        if self.min_size_tokens.is_some_and(|min| query.size_tokens < min) {
            return false;
        }
        if self.max_size_tokens.is_some_and(|max| query.size_tokens > max) {
            return false;
        }
        if self.max_risk.is_some_and(|max| query.risk > max) {
            return false;
        }
        true
    }

    /// Whether `adapter` may serve requests matched by this rule
    #[must_use]
    pub fn allows(&self, adapter: &AdapterId) -> bool {
        self.eligible_adapters.is_empty() || self.eligible_adapters.contains(adapter)
    }
}

// ============================================================================
// Policy Set
// ============================================================================

/// Ordered rule list
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    rules: Vec<PolicyRule>,
}

impl PolicySet {
    /// Wrap rules in match order
    #[must_use]
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Rules in match order
    #[must_use]
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Replace every rule
    pub fn replace(&mut self, rules: Vec<PolicyRule>) {
        self.rules = rules;
    }

    /// First matching rule
    ///
    /// # Errors
    ///
    /// `NoEligibleAdapter` when rules exist but none matches.
    pub fn resolve(&self, query: &RouteQuery) -> Result<PolicyRule, RoutingError> {
        if self.rules.is_empty() {
            return Ok(PolicyRule::new("default"));
        }
        self.rules
            .iter()
            .find(|rule| rule.matches(query))
            .cloned()
            .ok_or_else(|| RoutingError::NoEligibleAdapter {
                task_class: query.task_class,
                reason: "no policy rule matches".to_string(),
            })
    }
}

// ============================================================================
// Routing Errors
// ============================================================================

/// Routing errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoutingError {
    /// Nothing can serve the request
    #[error("no eligible adapter for {task_class}: {reason}")]
    NoEligibleAdapter {
        /// Task type of the request
        task_class: TaskClass,
        /// Diagnostic detail
        reason: String,
    },

    /// Adapter is not in the routing table
    #[error("unknown adapter {0}")]
    UnknownAdapter(AdapterId),
}

impl RoutingError {
    /// Wire code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoEligibleAdapter { .. } | Self::UnknownAdapter(_) => ErrorCode::NoEligibleAdapter,
        }
    }
}
