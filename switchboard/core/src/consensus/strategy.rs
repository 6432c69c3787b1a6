//! Reconciliation strategies
//!
//! A closed set of strategies picked per policy rule. Each one turns the
//! contributions of one request into findings with provenance; the answer
//! text is chosen the same way for all of them except champion/challenger.

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::agreement::{agreement, split_claims, AgreementMetric, Claim, Severity};
use super::ConsensusError;
use crate::protocol::{AdapterId, FindingSummary, ResultEnvelope};

/// How contributions are reconciled
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// Merge every finding above the thresholds; ties break on win rate
    UnionTieBreak {
        /// Findings below this confidence are dropped
        #[serde(default)]
        min_confidence: f32,
        /// Findings below this severity are dropped
        #[serde(default)]
        min_severity: Severity,
    },
    /// High-impact findings need a second, independent contributor
    TwoPhaseCommit {
        /// Severity at or above which confirmation is required
        #[serde(default = "default_impact_severity")]
        impact_severity: Severity,
    },
    /// Take the cheapest acceptable answer
    ChampionChallenger {
        /// Confidence an answer needs to be acceptable
        #[serde(default = "default_acceptable_confidence")]
        acceptable_confidence: f32,
    },
}

fn default_impact_severity() -> Severity {
    Severity::High
}

fn default_acceptable_confidence() -> f32 {
    0.6
}

impl Default for Strategy {
    fn default() -> Self {
        Self::ChampionChallenger {
            acceptable_confidence: default_acceptable_confidence(),
        }
    }
}

impl Strategy {
    /// Stable name reported in results
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnionTieBreak { .. } => "union_tie_break",
            Self::TwoPhaseCommit { .. } => "two_phase_commit",
            Self::ChampionChallenger { .. } => "champion_challenger",
        }
    }
}

// ============================================================================
// Inputs and outputs
// ============================================================================

/// One adapter's completed response
#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    /// Producer
    pub adapter: AdapterId,
    /// Full response text
    pub content: String,
    /// Last confidence the adapter reported
    pub confidence: f32,
    /// Actual cost
    pub usd: f64,
    /// Actual tokens
    pub tokens: u64,
    /// Historical win rate of the producer
    pub win_rate: f64,
    /// Validation failure the adapter signalled, if any
    pub validation_failure: Option<String>,
    /// Wall time of the call
    pub latency: Duration,
}

impl Contribution {
    /// Contribution with neutral defaults for the bookkeeping fields
    pub fn new(adapter: impl Into<AdapterId>, content: impl Into<String>, confidence: f32) -> Self {
        Self {
            adapter: adapter.into(),
            content: content.into(),
            confidence,
            usd: 0.0,
            tokens: 0,
            win_rate: 0.5,
            validation_failure: None,
            latency: Duration::ZERO,
        }
    }

    /// Set the cost
    #[must_use]
    pub fn with_cost(mut self, usd: f64, tokens: u64) -> Self {
        self.usd = usd;
        self.tokens = tokens;
        self
    }

    /// Set the win rate
    #[must_use]
    pub fn with_win_rate(mut self, win_rate: f64) -> Self {
        self.win_rate = win_rate;
        self
    }

    /// Mark as failing validation
    #[must_use]
    pub fn with_validation_failure(mut self, reason: impl Into<String>) -> Self {
        self.validation_failure = Some(reason.into());
        self
    }
}

/// An accepted finding
#[derive(Clone, Debug, PartialEq)]
pub struct Finding {
    /// Claim text (first contributor's wording)
    pub text: String,
    /// Highest severity any contributor gave it
    pub severity: Severity,
    /// Highest contributor confidence
    pub confidence: f32,
    /// Contributors that made the claim
    pub provenance: Vec<AdapterId>,
}

/// Reconciled output of one request
#[derive(Clone, Debug, PartialEq)]
pub struct ConsensusResult {
    /// Strategy name
    pub strategy: String,
    /// Answer text
    pub answer: String,
    /// Contributor whose text is the answer
    pub answer_adapter: AdapterId,
    /// Confidence of the answer
    pub confidence: f32,
    /// Agreement across contributors
    pub agreement: f64,
    /// Accepted findings
    pub findings: Vec<Finding>,
    /// Every contributor, in input order
    pub contributors: Vec<AdapterId>,
    /// Validation failures reported by contributors
    pub validation_failures: Vec<(AdapterId, String)>,
    /// Whether an escalation contributed
    pub escalated: bool,
}

impl ConsensusResult {
    /// Wire form sent with the closing frame
    #[must_use]
    pub fn to_envelope(&self) -> ResultEnvelope {
        ResultEnvelope {
            strategy: self.strategy.clone(),
            confidence: self.confidence,
            agreement: self.agreement as f32,
            escalated: self.escalated,
            findings: self
                .findings
                .iter()
                .map(|f| FindingSummary {
                    text: f.text.clone(),
                    confidence: f.confidence,
                    provenance: f.provenance.clone(),
                })
                .collect(),
            contributors: self.contributors.clone(),
        }
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Reconcile `contributions` with `strategy`
///
/// # Errors
///
/// `NoConsensus` when there is no contribution.
pub fn reconcile(
    strategy: &Strategy,
    metric: AgreementMetric,
    claim_match_threshold: f64,
    contributions: &[Contribution],
) -> Result<ConsensusResult, ConsensusError> {
    if contributions.is_empty() {
        return Err(ConsensusError::NoConsensus {
            reason: "no adapter produced a response".to_string(),
        });
    }

    let contents: Vec<&str> = contributions.iter().map(|c| c.content.as_str()).collect();
    let agreement = agreement(metric, claim_match_threshold, &contents);
    let groups = group_claims(contributions, claim_match_threshold);

    let (answer, findings) = match strategy {
        Strategy::UnionTieBreak {
            min_confidence,
            min_severity,
        } => {
            let findings: Vec<Group> = groups
                .into_iter()
                .filter(|g| g.finding.confidence >= *min_confidence && g.finding.severity >= *min_severity)
                .collect();
            (best_contribution(contributions), findings)
        }
        Strategy::TwoPhaseCommit { impact_severity } => {
            let findings: Vec<Group> = groups
                .into_iter()
                .filter(|g| g.finding.severity < *impact_severity || g.finding.provenance.len() >= 2)
                .collect();
            (best_contribution(contributions), findings)
        }
        Strategy::ChampionChallenger {
            acceptable_confidence,
        } => {
            let champion = champion(contributions, *acceptable_confidence);
            let findings: Vec<Group> = groups
                .into_iter()
                .filter(|g| g.finding.provenance.contains(&champion.adapter))
                .collect();
            (champion, findings)
        }
    };

    let mut findings = findings;
    findings.sort_by(|a, b| {
        b.finding
            .severity
            .cmp(&a.finding.severity)
            .then(b.finding.confidence.total_cmp(&a.finding.confidence))
            .then(b.best_win_rate.total_cmp(&a.best_win_rate))
    });

    Ok(ConsensusResult {
        strategy: strategy.name().to_string(),
        answer: answer.content.clone(),
        answer_adapter: answer.adapter.clone(),
        confidence: answer.confidence,
        agreement,
        findings: findings.into_iter().map(|g| g.finding).collect(),
        contributors: contributions.iter().map(|c| c.adapter.clone()).collect(),
        validation_failures: contributions
            .iter()
            .filter_map(|c| {
                c.validation_failure
                    .as_ref()
                    .map(|reason| (c.adapter.clone(), reason.clone()))
            })
            .collect(),
        escalated: false,
    })
}

/// Contributions that passed validation, or all of them if none did
fn candidates(contributions: &[Contribution]) -> Vec<&Contribution> {
    let valid: Vec<&Contribution> = contributions
        .iter()
        .filter(|c| c.validation_failure.is_none())
        .collect();
    if valid.is_empty() {
        contributions.iter().collect()
    } else {
        valid
    }
}

/// Highest confidence, then higher win rate, then lower cost
fn best_contribution(contributions: &[Contribution]) -> &Contribution {
    candidates(contributions)
        .into_iter()
        .max_by(|a, b| rank(a, b))
        .unwrap_or(&contributions[0])
}

fn rank(a: &Contribution, b: &Contribution) -> Ordering {
    a.confidence
        .total_cmp(&b.confidence)
        .then(a.win_rate.total_cmp(&b.win_rate))
        .then(b.usd.total_cmp(&a.usd))
}

/// Cheapest acceptable contribution, else the best one
fn champion(contributions: &[Contribution], acceptable: f32) -> &Contribution {
    candidates(contributions)
        .into_iter()
        .filter(|c| c.confidence >= acceptable)
        .min_by(|a, b| a.usd.total_cmp(&b.usd).then(rank(b, a)))
        .unwrap_or_else(|| best_contribution(contributions))
}

struct Group {
    representative: Claim,
    finding: Finding,
    best_win_rate: f64,
}

/// Cluster matching claims across contributors
fn group_claims(contributions: &[Contribution], threshold: f64) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for contribution in contributions {
        for claim in split_claims(&contribution.content) {
            let existing = groups
                .iter_mut()
                .find(|g| g.representative.similarity(&claim) >= threshold);
            match existing {
                Some(group) => {
                    let finding = &mut group.finding;
                    finding.severity = finding.severity.max(claim.severity);
                    finding.confidence = finding.confidence.max(contribution.confidence);
                    if !finding.provenance.contains(&contribution.adapter) {
                        finding.provenance.push(contribution.adapter.clone());
                    }
                    group.best_win_rate = group.best_win_rate.max(contribution.win_rate);
                }
                None => groups.push(Group {
                    finding: Finding {
                        text: claim.text.clone(),
                        severity: claim.severity,
                        confidence: contribution.confidence,
                        provenance: vec![contribution.adapter.clone()],
                    },
                    representative: claim,
                    best_win_rate: contribution.win_rate,
                }),
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn run(strategy: Strategy, contributions: &[Contribution]) -> ConsensusResult {
        reconcile(&strategy, AgreementMetric::TokenJaccard, 0.6, contributions).unwrap()
    }

    #[test]
    fn test_union_merges_with_provenance() {
        let result = run(
            Strategy::UnionTieBreak {
                min_confidence: 0.5,
                min_severity: Severity::Low,
            },
            &[
                Contribution::new("a", "[high] Token leaks into logs.\n[low] Unused import.", 0.9),
                Contribution::new("b", "[high] Token leaks into logs.\nMissing newline.", 0.7),
            ],
        );
        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.findings[0].text, "Token leaks into logs.");
        assert_eq!(
            result.findings[0].provenance,
            vec![AdapterId::new("a"), AdapterId::new("b")]
        );
        assert_eq!(result.findings[1].severity, Severity::Low);
        assert_eq!(result.answer_adapter, AdapterId::new("a"));
    }

    #[test]
    fn test_union_drops_low_confidence() {
        let result = run(
            Strategy::UnionTieBreak {
                min_confidence: 0.8,
                min_severity: Severity::Info,
            },
            &[
                Contribution::new("a", "Alpha finding.", 0.9),
                Contribution::new("b", "Beta finding elsewhere.", 0.3),
            ],
        );
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].provenance, vec![AdapterId::new("a")]);
    }

    #[test]
    fn test_two_phase_commit_needs_confirmation() {
        let result = run(
            Strategy::TwoPhaseCommit {
                impact_severity: Severity::High,
            },
            &[
                Contribution::new("a", "[critical] Remote code execution in parser.\n[high] Race in cache.", 0.9),
                Contribution::new("b", "[critical] Remote code execution in parser.", 0.8),
            ],
        );
        let texts: Vec<&str> = result.findings.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["Remote code execution in parser."]);
    }

    #[test]
    fn test_champion_is_cheapest_acceptable() {
        let result = run(
            Strategy::ChampionChallenger {
                acceptable_confidence: 0.6,
            },
            &[
                Contribution::new("pricey", "Detailed answer.", 0.95).with_cost(0.10, 500),
                Contribution::new("cheap", "Short answer.", 0.7).with_cost(0.01, 50),
                Contribution::new("cheapest", "Unsure answer.", 0.3).with_cost(0.001, 10),
            ],
        );
        assert_eq!(result.answer_adapter, AdapterId::new("cheap"));
        assert_eq!(result.answer, "Short answer.");
        assert_eq!(result.strategy, "champion_challenger");
    }

    #[test]
    fn test_ties_break_on_win_rate_then_cost() {
        let result = run(
            Strategy::UnionTieBreak {
                min_confidence: 0.0,
                min_severity: Severity::Info,
            },
            &[
                Contribution::new("a", "One.", 0.8).with_win_rate(0.4),
                Contribution::new("b", "Two.", 0.8).with_win_rate(0.7),
            ],
        );
        assert_eq!(result.answer_adapter, AdapterId::new("b"));
    }

    #[test]
    fn test_validation_failure_excluded_from_answer() {
        let result = run(
            Strategy::default(),
            &[
                Contribution::new("a", "Broken patch.", 0.95).with_validation_failure("tests failed"),
                Contribution::new("b", "Working patch.", 0.65),
            ],
        );
        assert_eq!(result.answer_adapter, AdapterId::new("b"));
        assert_eq!(result.validation_failures.len(), 1);
    }

    #[test]
    fn test_no_contributions_is_no_consensus() {
        let err = reconcile(&Strategy::default(), AgreementMetric::TokenJaccard, 0.6, &[]).unwrap_err();
        assert!(matches!(err, ConsensusError::NoConsensus { .. }));
    }
}
