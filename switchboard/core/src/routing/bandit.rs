//! Contextual Bandit
//!
//! Adapter scoring that learns online from observed outcomes.
//!
//! Every (task class, adapter) pair is a UCB1 arm. The arm's empirical mean
//! starts at the adapter's declared quality prior and moves toward observed
//! rewards. A linear model over request/adapter features adds context the
//! arm alone cannot see (a cheap adapter on a big prompt, a slow adapter on
//! a latency-sensitive task). One SGD step per outcome keeps the model
//! current without retraining.

use std::collections::HashMap;

use super::config::{SelectionConfig, TaskClass};
use super::table::AdapterEntry;
use crate::adapter::CostEstimate;
use crate::protocol::AdapterId;

/// Number of contextual features
pub const FEATURE_COUNT: usize = 5;

/// Starting weights of the contextual model, in [`Features::as_array`] order
pub const INITIAL_WEIGHTS: [f64; FEATURE_COUNT] = [0.35, 0.2, 0.15, 0.15, 0.15];

/// How many pseudo-observations the declared quality prior is worth
const PRIOR_WEIGHT: f64 = 2.0;

/// USD at which cost efficiency halves
const HALF_EFFICIENCY_USD: f64 = 0.01;

// ============================================================================
// Features
// ============================================================================

/// Request/adapter features, each in 0.0 - 1.0
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Features {
    /// Declared affinity for the task class
    pub capability_fit: f64,
    /// Historical win rate
    pub win_rate: f64,
    /// Cheaper is higher
    pub cost_efficiency: f64,
    /// Faster relative to the task's latency budget is higher
    pub latency_fit: f64,
    /// Context headroom left by the request
    pub context_fit: f64,
}

impl Features {
    /// Extract features for serving a request of `size_tokens` with `entry`
    #[must_use]
    pub fn extract(entry: &AdapterEntry, task: TaskClass, size_tokens: u64, estimate: &CostEstimate) -> Self {
        let budget_ms = task.latency_budget().as_millis() as f64;
        let p95 = entry.p95_latency_ms() as f64;
        let context = entry.capabilities.context_size;
        let context_fit = if context == 0 || size_tokens >= context {
            0.0
        } else {
            1.0 - size_tokens as f64 / context as f64
        };
        Self {
            capability_fit: entry.capabilities.affinity_for(task),
            win_rate: entry.win_rate(),
            cost_efficiency: cost_efficiency(estimate.usd),
            latency_fit: budget_ms / (budget_ms + p95),
            context_fit,
        }
    }

    /// Features as a vector
    #[must_use]
    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.capability_fit,
            self.win_rate,
            self.cost_efficiency,
            self.latency_fit,
            self.context_fit,
        ]
    }
}

/// Map a USD cost to 0.0 - 1.0, free = 1.0
#[must_use]
pub fn cost_efficiency(usd: f64) -> f64 {
    1.0 / (1.0 + usd.max(0.0) / HALF_EFFICIENCY_USD)
}

/// Reward of one outcome: quality dominates, agreement and cost refine it
#[must_use]
pub fn reward(quality: f64, agreement: f64, usd: f64) -> f64 {
    (0.5 * quality + 0.3 * agreement + 0.2 * cost_efficiency(usd)).clamp(0.0, 1.0)
}

// ============================================================================
// Bandit
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
struct Arm {
    pulls: u64,
    reward_sum: f64,
}

/// Score of one arm for one request
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArmScore {
    /// Exploitation estimate of answer quality
    pub predicted_quality: f64,
    /// UCB exploration bonus
    pub bonus: f64,
}

impl ArmScore {
    /// Upper confidence bound
    #[must_use]
    pub fn upper(&self) -> f64 {
        self.predicted_quality + self.bonus
    }
}

/// UCB1 arms blended with an online linear model
#[derive(Debug)]
pub struct Bandit {
    config: SelectionConfig,
    arms: HashMap<(TaskClass, AdapterId), Arm>,
    task_pulls: HashMap<TaskClass, u64>,
    weights: [f64; FEATURE_COUNT],
}

impl Bandit {
    /// Fresh bandit
    #[must_use]
    pub fn new(config: SelectionConfig) -> Self {
        Self {
            config,
            arms: HashMap::new(),
            task_pulls: HashMap::new(),
            weights: INITIAL_WEIGHTS,
        }
    }

    /// Current contextual weights
    #[must_use]
    pub fn weights(&self) -> [f64; FEATURE_COUNT] {
        self.weights
    }

    /// Times an arm was updated
    #[must_use]
    pub fn pulls(&self, task: TaskClass, adapter: &AdapterId) -> u64 {
        self.arms
            .get(&(task, adapter.clone()))
            .map_or(0, |arm| arm.pulls)
    }

    /// Contextual model output, clamped to 0.0 - 1.0
    #[must_use]
    pub fn contextual(&self, features: &Features) -> f64 {
        dot(&self.weights, &features.as_array()).clamp(0.0, 1.0)
    }

    /// Score `adapter` for `task`
    #[must_use]
    pub fn score(&self, task: TaskClass, adapter: &AdapterId, prior: f64, features: &Features) -> ArmScore {
        let arm = self
            .arms
            .get(&(task, adapter.clone()))
            .copied()
            .unwrap_or_default();
        let empirical =
            (arm.reward_sum + prior.clamp(0.0, 1.0) * PRIOR_WEIGHT) / (arm.pulls as f64 + PRIOR_WEIGHT);
        let blend = self.config.ucb_blend.clamp(0.0, 1.0);
        let predicted_quality = blend * empirical + (1.0 - blend) * self.contextual(features);

        let total = self.task_pulls.get(&task).copied().unwrap_or(0);
        let bonus = self.config.exploration
            * (2.0 * ((total + 1) as f64).ln() / (arm.pulls + 1) as f64).sqrt();

        ArmScore {
            predicted_quality,
            bonus,
        }
    }

    /// Learn from one outcome
    pub fn update(&mut self, task: TaskClass, adapter: &AdapterId, features: &Features, reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        let arm = self.arms.entry((task, adapter.clone())).or_default();
        arm.pulls += 1;
        arm.reward_sum += reward;
        *self.task_pulls.entry(task).or_default() += 1;

        let x = features.as_array();
        let error = reward - dot(&self.weights, &x);
        let rate = self.config.learning_rate;
        for (w, xi) in self.weights.iter_mut().zip(x) {
            *w += rate * error * xi;
        }
    }
}

fn dot(a: &[f64; FEATURE_COUNT], b: &[f64; FEATURE_COUNT]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(cost: f64) -> Features {
        Features {
            capability_fit: 0.6,
            win_rate: 0.5,
            cost_efficiency: cost,
            latency_fit: 0.8,
            context_fit: 0.9,
        }
    }

    #[test]
    fn test_prior_drives_cold_start() {
        let bandit = Bandit::new(SelectionConfig::default());
        let f = features(0.9);
        let good = bandit.score(TaskClass::General, &AdapterId::new("good"), 0.9, &f);
        let poor = bandit.score(TaskClass::General, &AdapterId::new("poor"), 0.3, &f);
        assert!(good.predicted_quality > poor.predicted_quality);
        // No pulls for the task yet: no exploration pressure
        assert_eq!(good.bonus, 0.0);
    }

    #[test]
    fn test_rewards_move_the_arm() {
        let mut bandit = Bandit::new(SelectionConfig::default());
        let id = AdapterId::new("a");
        let f = features(0.9);
        let before = bandit.score(TaskClass::General, &id, 0.5, &f).predicted_quality;
        for _ in 0..10 {
            bandit.update(TaskClass::General, &id, &f, 1.0);
        }
        let after = bandit.score(TaskClass::General, &id, 0.5, &f).predicted_quality;
        assert!(after > before);
        assert_eq!(bandit.pulls(TaskClass::General, &id), 10);
        assert_eq!(bandit.pulls(TaskClass::Creative, &id), 0);
    }

    #[test]
    fn test_untried_arm_gets_larger_bonus() {
        let mut bandit = Bandit::new(SelectionConfig::default());
        let tried = AdapterId::new("tried");
        let f = features(0.5);
        for _ in 0..20 {
            bandit.update(TaskClass::General, &tried, &f, 0.6);
        }
        let tried_score = bandit.score(TaskClass::General, &tried, 0.5, &f);
        let fresh_score = bandit.score(TaskClass::General, &AdapterId::new("fresh"), 0.5, &f);
        assert!(fresh_score.bonus > tried_score.bonus);
    }

    #[test]
    fn test_sgd_step_reduces_error() {
        let mut bandit = Bandit::new(SelectionConfig::default());
        let id = AdapterId::new("a");
        let f = features(1.0);
        let target = 0.2;
        let before = (bandit.contextual(&f) - target).abs();
        bandit.update(TaskClass::General, &id, &f, target);
        let after = (bandit.contextual(&f) - target).abs();
        assert!(after < before);
    }

    #[test]
    fn test_reward_prefers_cheap_agreeing_answers() {
        assert!(reward(0.8, 1.0, 0.0) > reward(0.8, 0.2, 0.0));
        assert!(reward(0.8, 1.0, 0.0) > reward(0.8, 1.0, 0.5));
        assert!((cost_efficiency(HALF_EFFICIENCY_USD) - 0.5).abs() < 1e-12);
    }
}
