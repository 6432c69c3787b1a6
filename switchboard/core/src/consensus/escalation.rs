//! Escalation
//!
//! Decides when a reconciled result is too weak to deliver and bounds how
//! many extra adapter calls a stream may spend fixing it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::agreement::AgreementMetric;
use super::strategy::{reconcile, Contribution, ConsensusResult, Strategy};
use super::ConsensusError;
use crate::protocol::AdapterId;

/// Escalation tunables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Escalate when the answer's confidence is below this
    pub min_confidence: f32,
    /// Escalate when agreement across contributors is below this
    pub agreement_threshold: f64,
    /// Escalations (and re-selections) allowed per stream
    pub max_escalations: u32,
    /// Agreement metric
    pub agreement_metric: AgreementMetric,
    /// Claim similarity counted as the same claim
    pub claim_match_threshold: f64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            agreement_threshold: 0.5,
            max_escalations: 1,
            agreement_metric: AgreementMetric::TokenJaccard,
            claim_match_threshold: 0.6,
        }
    }
}

/// Why a result needs escalation
#[derive(Clone, Debug, PartialEq)]
pub enum EscalationTrigger {
    /// A contributor's own validation failed
    ValidationFailed {
        /// Adapter that reported it
        adapter: AdapterId,
        /// Its reason
        reason: String,
    },
    /// Contributors disagree
    Disagreement {
        /// Measured agreement
        agreement: f64,
        /// Configured threshold
        threshold: f64,
    },
    /// The answer is not confident enough
    LowConfidence {
        /// Answer confidence
        confidence: f32,
        /// Configured threshold
        threshold: f32,
    },
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationFailed { adapter, reason } => {
                write!(f, "validation failed on {adapter}: {reason}")
            }
            Self::Disagreement {
                agreement,
                threshold,
            } => write!(f, "agreement {agreement:.2} below {threshold:.2}"),
            Self::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "confidence {confidence:.2} below {threshold:.2}"),
        }
    }
}

/// Per-stream escalation allowance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscalationBudget {
    max: u32,
    used: u32,
}

impl EscalationBudget {
    /// Budget of `max` escalations
    #[must_use]
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Take one escalation if any is left
    pub fn try_consume(&mut self) -> bool {
        if self.used < self.max {
            self.used += 1;
            true
        } else {
            false
        }
    }

    /// Escalations taken
    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Escalations left
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max - self.used
    }
}

/// Reconciliation plus escalation decisions
#[derive(Clone, Debug, Default)]
pub struct ConsensusEngine {
    config: EscalationConfig,
}

impl ConsensusEngine {
    /// Engine with `config`
    #[must_use]
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Fresh per-stream budget
    #[must_use]
    pub fn budget(&self) -> EscalationBudget {
        EscalationBudget::new(self.config.max_escalations)
    }

    /// Reconcile with the configured agreement metric
    ///
    /// # Errors
    ///
    /// `NoConsensus` when `contributions` is empty.
    pub fn reconcile(
        &self,
        strategy: &Strategy,
        contributions: &[Contribution],
    ) -> Result<ConsensusResult, ConsensusError> {
        reconcile(
            strategy,
            self.config.agreement_metric,
            self.config.claim_match_threshold,
            contributions,
        )
    }

    /// First trigger that fires for `result`, if any
    ///
    /// Checked in order: validation failure, disagreement, low confidence.
    #[must_use]
    pub fn evaluate(&self, result: &ConsensusResult) -> Option<EscalationTrigger> {
        if let Some((adapter, reason)) = result.validation_failures.first() {
            return Some(EscalationTrigger::ValidationFailed {
                adapter: adapter.clone(),
                reason: reason.clone(),
            });
        }
        if result.agreement < self.config.agreement_threshold {
            return Some(EscalationTrigger::Disagreement {
                agreement: result.agreement,
                threshold: self.config.agreement_threshold,
            });
        }
        if result.confidence < self.config.min_confidence {
            return Some(EscalationTrigger::LowConfidence {
                confidence: result.confidence,
                threshold: self.config.min_confidence,
            });
        }
        None
    }
}
