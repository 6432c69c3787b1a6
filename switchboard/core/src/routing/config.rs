//! Routing Configuration
//!
//! Task classification, risk levels and the tunables of adapter selection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Task Classification
// ============================================================================

/// Classification of task types for routing decisions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    /// Quick response needed
    /// Examples: autocomplete, quick answers, greetings
    QuickResponse,

    /// Deep thinking allowed
    /// Examples: complex analysis, multi-step reasoning
    DeepThinking,

    /// Code generation and review
    CodeGeneration,

    /// Mathematical/logical tasks (precision over speed)
    Mathematical,

    /// Creative/generative tasks
    Creative,

    /// Tool use and function calling
    ToolUse,

    /// Default/unclassified tasks
    #[default]
    General,
}

impl TaskClass {
    /// Deadline for a single adapter call serving this task class
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::QuickResponse => Duration::from_secs(5),
            Self::DeepThinking => Duration::from_secs(120),
            Self::CodeGeneration => Duration::from_secs(60),
            Self::Mathematical => Duration::from_secs(90),
            Self::Creative => Duration::from_secs(60),
            Self::ToolUse => Duration::from_secs(30),
            Self::General => Duration::from_secs(60),
        }
    }

    /// Latency the task class tolerates before the latency feature goes to zero
    #[must_use]
    pub fn latency_budget(&self) -> Duration {
        match self {
            Self::QuickResponse => Duration::from_millis(500),
            Self::ToolUse => Duration::from_secs(2),
            Self::Creative | Self::General => Duration::from_secs(5),
            Self::CodeGeneration => Duration::from_secs(10),
            Self::Mathematical => Duration::from_secs(20),
            Self::DeepThinking => Duration::from_secs(30),
        }
    }

    /// Stable name used in logs and bandit arm keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuickResponse => "quick_response",
            Self::DeepThinking => "deep_thinking",
            Self::CodeGeneration => "code_generation",
            Self::Mathematical => "mathematical",
            Self::Creative => "creative",
            Self::ToolUse => "tool_use",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for TaskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Risk
// ============================================================================

/// Declared risk of a request, matched against policy `max_risk`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Nothing at stake
    #[default]
    Low,
    /// Ordinary production work
    Medium,
    /// Mistakes are costly
    High,
    /// Mistakes are unacceptable
    Critical,
}

// ============================================================================
// Selection tunables
// ============================================================================

/// Tunables for the selection engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Maximum plan length
    pub top_k: usize,
    /// UCB1 exploration constant
    pub exploration: f64,
    /// Step size of the contextual weight update
    pub learning_rate: f64,
    /// Blend between the UCB arm score and the contextual score (1.0 = arm only)
    pub ucb_blend: f64,
    /// Minimum predicted quality gain for a challenger
    pub challenger_min_gain: f64,
    /// Maximum challenger cost relative to the primary
    pub challenger_max_cost_ratio: f64,
    /// Default quality target when a rule does not set one
    pub quality_target: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            exploration: 1.0,
            learning_rate: 0.05,
            ucb_blend: 0.5,
            challenger_min_gain: 0.02,
            challenger_max_cost_ratio: 1.5,
            quality_target: 0.7,
        }
    }
}

/// Health tracking tunables for routing table rows
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// EWMA weight of the newest observation
    pub ewma_alpha: f64,
    /// Error rate above which an adapter is unhealthy
    pub max_error_rate: f64,
    /// Consecutive failures that mark an adapter unhealthy
    pub max_consecutive_failures: u32,
    /// How long an adapter may stay unhealthy before it is pruned
    #[serde(with = "duration_ms")]
    pub prune_grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            max_error_rate: 0.5,
            max_consecutive_failures: 3,
            prune_grace: Duration::from_secs(60),
        }
    }
}

/// Serialise `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
