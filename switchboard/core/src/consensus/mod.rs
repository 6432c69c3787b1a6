//! Consensus & Escalation
//!
//! Reconciles fan-out responses into one answer with per-finding provenance
//! and an agreement score, and decides when a higher-tier adapter must be
//! consulted.

mod agreement;
mod escalation;
mod strategy;

use thiserror::Error;

use crate::protocol::ErrorCode;

pub use agreement::{agreement, jaccard, split_claims, tokenize, AgreementMetric, Claim, Severity};
pub use escalation::{ConsensusEngine, EscalationBudget, EscalationConfig, EscalationTrigger};
pub use strategy::{reconcile, Contribution, ConsensusResult, Finding, Strategy};

/// Consensus errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    /// No contributor succeeded
    #[error("no consensus: {reason}")]
    NoConsensus {
        /// Diagnostic detail
        reason: String,
    },
}

impl ConsensusError {
    /// Wire code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoConsensus { .. } => ErrorCode::NoConsensus,
        }
    }
}
