//! Adapter Selection
//!
//! Turns a request into a [`Plan`]: the policy rule picks the eligible set,
//! the routing table filters it to healthy adapters, each adapter estimates
//! the call, and the bandit scores what is left.
//!
//! # Plan Roles
//!
//! ```text
//! Primary     cheapest candidate whose predicted quality reaches the
//!             quality target (highest predicted quality if none does)
//! Challenger  best predicted quality, if materially better than the primary
//!             at a bounded cost premium
//! Fallback    escalation adapter first, then the rest by predicted quality
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::bandit::{reward, Bandit, Features};
use super::config::{SelectionConfig, TaskClass};
use super::policy::{PolicyRule, PolicySet, RouteQuery, RoutingError};
use super::table::{AdapterEntry, CallOutcome, RoutingTable};
use crate::adapter::{AdapterRegistry, AdapterRequest, CostEstimate};
use crate::consensus::Strategy;
use crate::protocol::AdapterId;

// ============================================================================
// Plan
// ============================================================================

/// Role of an adapter in a plan
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRole {
    /// Always called
    Primary,
    /// Called alongside the primary
    Challenger,
    /// Called only on escalation or re-selection
    Fallback,
}

impl fmt::Display for PlanRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Primary => "primary",
            Self::Challenger => "challenger",
            Self::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// One adapter in a plan
#[derive(Clone, Debug, PartialEq)]
pub struct PlanEntry {
    /// Adapter
    pub adapter: AdapterId,
    /// Role
    pub role: PlanRole,
    /// The adapter's own estimate for this request
    pub estimate: CostEstimate,
    /// Exploitation estimate of answer quality
    pub predicted_quality: f64,
    /// Upper confidence bound used for ranking
    pub score: f64,
    /// Features the score was computed from
    pub features: Features,
}

/// Ranked adapters for one request
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    /// Task class of the request
    pub task_class: TaskClass,
    /// Name of the matching policy rule
    pub rule: String,
    /// Reconciliation strategy from the rule
    pub strategy: Strategy,
    /// Entries: primary first, then challenger, then fallbacks
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    /// The primary entry
    #[must_use]
    pub fn primary(&self) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.role == PlanRole::Primary)
    }

    /// The challenger entry, if any
    #[must_use]
    pub fn challenger(&self) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.role == PlanRole::Challenger)
    }

    /// Entries called up front (primary and challenger)
    pub fn fan_out(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.role != PlanRole::Fallback)
    }

    /// Fallback entries in order
    pub fn fallbacks(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.role == PlanRole::Fallback)
    }

    /// First fallback not yet used
    #[must_use]
    pub fn next_fallback(&self, used: &[AdapterId]) -> Option<&PlanEntry> {
        self.fallbacks().find(|e| !used.contains(&e.adapter))
    }

    /// Entry for `adapter`
    #[must_use]
    pub fn entry(&self, adapter: &AdapterId) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| &e.adapter == adapter)
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Outcome signals fed back after a request
#[derive(Clone, Debug, PartialEq)]
pub struct Feedback {
    /// Call result
    pub call: CallOutcome,
    /// Quality signal (the contribution's confidence)
    pub quality: f64,
    /// Agreement of the contribution with the final answer
    pub agreement: f64,
    /// Actual cost
    pub usd: f64,
}

/// Policy matching, candidate scoring and online learning
pub struct Selector {
    config: SelectionConfig,
    table: Arc<RoutingTable>,
    policy: RwLock<PolicySet>,
    bandit: Mutex<Bandit>,
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Scored {
    entry: AdapterEntry,
    estimate: CostEstimate,
    features: Features,
    predicted_quality: f64,
    score: f64,
}

impl Scored {
    fn into_plan_entry(self, role: PlanRole) -> PlanEntry {
        PlanEntry {
            adapter: self.entry.id,
            role,
            estimate: self.estimate,
            predicted_quality: self.predicted_quality,
            score: self.score,
            features: self.features,
        }
    }
}

impl Selector {
    /// Create a selector over `table` with the given rules
    #[must_use]
    pub fn new(config: SelectionConfig, table: Arc<RoutingTable>, policy: PolicySet) -> Self {
        let bandit = Bandit::new(config.clone());
        Self {
            config,
            table,
            policy: RwLock::new(policy),
            bandit: Mutex::new(bandit),
        }
    }

    /// Routing table
    #[must_use]
    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Replace the policy rules (`ROUTE_UPDATE`)
    pub async fn replace_rules(&self, rules: Vec<PolicyRule>) {
        let count = rules.len();
        self.policy.write().await.replace(rules);
        debug!(rules = count, "Policy rules replaced");
    }

    /// Current rules
    pub async fn rules(&self) -> Vec<PolicyRule> {
        self.policy.read().await.rules().to_vec()
    }

    /// Build a plan for `request`, skipping adapters in `exclude`
    ///
    /// # Errors
    ///
    /// `NoEligibleAdapter` when no rule matches, when the eligible set is
    /// empty or fully unhealthy, or when every candidate is over budget.
    pub async fn select(
        &self,
        request: &AdapterRequest,
        registry: &AdapterRegistry,
        exclude: &[AdapterId],
    ) -> Result<Plan, RoutingError> {
        let task = request.task_class;
        let size = request.size_tokens();
        let query = RouteQuery::new(task, size, request.risk);
        let rule = self.policy.read().await.resolve(&query)?;

        let usable = |entry: &AdapterEntry| {
            !exclude.contains(&entry.id)
                && entry.serves(task)
                && size < entry.capabilities.context_size
                && registry.get(&entry.id).is_some()
        };
        let entries = self.table.entries().await;
        let eligible: Vec<AdapterEntry> = entries
            .iter()
            .filter(|e| rule.allows(&e.id) && usable(*e))
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Err(RoutingError::NoEligibleAdapter {
                task_class: task,
                reason: format!("rule '{}' has no healthy adapter", rule.name),
            });
        }
        let escalation = rule
            .escalation_adapter
            .as_ref()
            .filter(|id| !eligible.iter().any(|e| &e.id == *id))
            .and_then(|id| entries.iter().find(|e| &e.id == id))
            .filter(|e| usable(*e))
            .cloned();

        let mut scored = self.score_all(request, registry, &rule, eligible).await;
        if scored.is_empty() {
            return Err(RoutingError::NoEligibleAdapter {
                task_class: task,
                reason: format!("every candidate of rule '{}' is over budget", rule.name),
            });
        }
        let escalation = match escalation {
            Some(entry) => self
                .score_all(request, registry, &rule, vec![entry])
                .await
                .pop(),
            None => None,
        };

        // Random order first so exact ties break randomly
        scored.shuffle(&mut rand::thread_rng());
        let plan = self.build_plan(&rule, task, scored, escalation);
        debug!(
            rule = %plan.rule,
            task = %task,
            primary = ?plan.primary().map(|e| e.adapter.as_str()),
            challenger = ?plan.challenger().map(|e| e.adapter.as_str()),
            entries = plan.entries.len(),
            "Plan built"
        );
        Ok(plan)
    }

    async fn score_all(
        &self,
        request: &AdapterRequest,
        registry: &AdapterRegistry,
        rule: &PolicyRule,
        candidates: Vec<AdapterEntry>,
    ) -> Vec<Scored> {
        let task = request.task_class;
        let size = request.size_tokens();
        let mut estimated = Vec::with_capacity(candidates.len());
        for entry in candidates {
            let Some(adapter) = registry.get(&entry.id) else {
                continue;
            };
            let estimate = match adapter.estimate(request).await {
                Ok(estimate) => estimate,
                Err(e) => {
                    warn!(adapter = %entry.id, error = %e, "Estimate failed, skipping candidate");
                    continue;
                }
            };
            if rule
                .budget_ceiling_usd
                .is_some_and(|ceiling| estimate.usd > ceiling)
            {
                debug!(adapter = %entry.id, usd = estimate.usd, "Over budget ceiling");
                continue;
            }
            estimated.push((entry, estimate));
        }

        let bandit = self.bandit.lock();
        estimated
            .into_iter()
            .map(|(entry, estimate)| {
                let features = Features::extract(&entry, task, size, &estimate);
                let arm = bandit.score(task, &entry.id, entry.capabilities.quality_prior, &features);
                Scored {
                    entry,
                    estimate,
                    features,
                    predicted_quality: arm.predicted_quality,
                    score: arm.upper(),
                }
            })
            .collect()
    }

    fn build_plan(
        &self,
        rule: &PolicyRule,
        task: TaskClass,
        mut scored: Vec<Scored>,
        escalation: Option<Scored>,
    ) -> Plan {
        let target = rule.quality_target.unwrap_or(self.config.quality_target);

        let primary_idx = scored
            .iter()
            .enumerate()
            .filter(|(_, s)| s.predicted_quality >= target)
            .min_by(|(_, a), (_, b)| {
                a.estimate
                    .usd
                    .total_cmp(&b.estimate.usd)
                    .then(b.score.total_cmp(&a.score))
            })
            .or_else(|| {
                scored.iter().enumerate().max_by(|(_, a), (_, b)| {
                    a.predicted_quality
                        .total_cmp(&b.predicted_quality)
                        .then(a.score.total_cmp(&b.score))
                })
            })
            .map_or(0, |(i, _)| i);
        let primary = scored.swap_remove(primary_idx);

        let min_quality = primary.predicted_quality + self.config.challenger_min_gain;
        let max_usd = primary.estimate.usd * self.config.challenger_max_cost_ratio;
        let challenger_idx = scored
            .iter()
            .enumerate()
            .filter(|(_, s)| s.predicted_quality >= min_quality && s.estimate.usd <= max_usd)
            .max_by(|(_, a), (_, b)| a.predicted_quality.total_cmp(&b.predicted_quality))
            .map(|(i, _)| i);
        let challenger = challenger_idx.map(|i| scored.swap_remove(i));

        scored.sort_by(|a, b| b.predicted_quality.total_cmp(&a.predicted_quality));

        let mut entries = vec![primary.into_plan_entry(PlanRole::Primary)];
        entries.extend(challenger.map(|c| c.into_plan_entry(PlanRole::Challenger)));
        if let Some(escalation) = escalation {
            entries.push(escalation.into_plan_entry(PlanRole::Fallback));
        } else if let Some(pos) = rule
            .escalation_adapter
            .as_ref()
            .and_then(|id| scored.iter().position(|s| &s.entry.id == id))
        {
            // Escalation adapter that is also eligible leads the fallbacks
            let preferred = scored.remove(pos);
            entries.push(preferred.into_plan_entry(PlanRole::Fallback));
        }
        entries.extend(scored.into_iter().map(|s| s.into_plan_entry(PlanRole::Fallback)));
        entries.truncate(self.config.top_k.max(1));

        Plan {
            task_class: task,
            rule: rule.name.clone(),
            strategy: rule.strategy.clone(),
            entries,
        }
    }

    /// Feed an observed outcome back into the table and the bandit
    pub async fn record_outcome(&self, task: TaskClass, entry: &PlanEntry, feedback: &Feedback) {
        self.table.record_outcome(&entry.adapter, &feedback.call).await;
        let value = if feedback.call.success {
            reward(feedback.quality, feedback.agreement, feedback.usd)
        } else {
            0.0
        };
        self.bandit
            .lock()
            .update(task, &entry.adapter, &entry.features, value);
    }

    /// Times the bandit arm for (`task`, `adapter`) was updated
    #[must_use]
    pub fn arm_pulls(&self, task: TaskClass, adapter: &AdapterId) -> u64 {
        self.bandit.lock().pulls(task, adapter)
    }
}
