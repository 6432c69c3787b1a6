//! AIMD ceiling
//!
//! Additive-increase/multiplicative-decrease control of a stream's effective
//! parallel ceiling. Successes grow the ceiling linearly up to the configured
//! `max_parallel`; a failure or timeout cuts it by a constant factor.

use serde::{Deserialize, Serialize};

/// AIMD constants
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AimdConfig {
    /// Additive step on success
    pub alpha: f64,
    /// Multiplicative factor on failure (0 < beta < 1)
    pub beta: f64,
    /// Floor for the ceiling
    pub min_ceiling: f64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.5,
            min_ceiling: 0.5,
        }
    }
}

/// Effective parallel ceiling of one window
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AimdCeiling {
    ceiling: f64,
    max: f64,
}

impl AimdCeiling {
    /// Start fully open at `max_parallel`
    #[must_use]
    pub fn new(max_parallel: u32) -> Self {
        let max = f64::from(max_parallel);
        Self { ceiling: max, max }
    }

    /// Current ceiling
    #[must_use]
    pub fn value(&self) -> f64 {
        self.ceiling
    }

    /// Additive increase, capped at the configured maximum
    pub fn on_success(&mut self, config: &AimdConfig) {
        self.ceiling = (self.ceiling + config.alpha).min(self.max);
    }

    /// Multiplicative decrease, floored at `min_ceiling`
    ///
    /// Once the ceiling sits at the floor further failures leave it there;
    /// the stream still admits one send at a time through
    /// [`admit_limit`](Self::admit_limit).
    pub fn on_failure(&mut self, config: &AimdConfig) {
        self.ceiling = (self.ceiling * config.beta).max(config.min_ceiling);
    }

    /// Concurrent sends the ceiling allows right now
    ///
    /// Never below one, so a stream can always make progress, and never
    /// above the configured maximum.
    #[must_use]
    pub fn admit_limit(&self) -> u32 {
        let floor = self.ceiling.floor().max(1.0);
        floor.min(self.max) as u32
    }

    /// Follow a change of `max_parallel`
    pub fn set_max(&mut self, max_parallel: u32) {
        self.max = f64::from(max_parallel);
        self.ceiling = self.ceiling.min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_is_additive_and_capped() {
        let config = AimdConfig::default();
        let mut ceiling = AimdCeiling::new(4);
        ceiling.on_failure(&config);
        assert_eq!(ceiling.value(), 2.0);

        let mut previous = ceiling.value();
        for _ in 0..10 {
            ceiling.on_success(&config);
            assert!(ceiling.value() >= previous);
            previous = ceiling.value();
        }
        assert_eq!(ceiling.value(), 4.0);
    }

    #[test]
    fn test_decrease_is_multiplicative_and_floored() {
        let config = AimdConfig::default();
        let mut ceiling = AimdCeiling::new(8);
        ceiling.on_failure(&config);
        assert_eq!(ceiling.value(), 4.0);
        ceiling.on_failure(&config);
        assert_eq!(ceiling.value(), 2.0);
        for _ in 0..10 {
            ceiling.on_failure(&config);
        }
        assert_eq!(ceiling.value(), config.min_ceiling);
        assert_eq!(ceiling.admit_limit(), 1);
    }

    #[test]
    fn test_failure_at_floor_holds_ceiling() {
        let config = AimdConfig {
            min_ceiling: 2.0,
            ..AimdConfig::default()
        };
        let mut ceiling = AimdCeiling::new(4);
        ceiling.on_failure(&config);
        assert_eq!(ceiling.value(), 2.0);

        ceiling.on_failure(&config);
        ceiling.on_failure(&config);
        assert_eq!(ceiling.value(), 2.0);
        assert_eq!(ceiling.admit_limit(), 2);

        ceiling.on_success(&config);
        assert_eq!(ceiling.value(), 3.0);
    }

    #[test]
    fn test_set_max_clamps() {
        let mut ceiling = AimdCeiling::new(8);
        ceiling.set_max(3);
        assert_eq!(ceiling.value(), 3.0);
        assert_eq!(ceiling.admit_limit(), 3);
    }
}
