//! Adapter Traits
//!
//! The contract every language-model adapter implements. The engine never
//! knows what is behind an adapter; it only sees capabilities, estimates,
//! a chunked response stream and a health report.
//!
//! # Design Philosophy
//!
//! - `estimate` is always called before admission, so the window governor
//!   can reserve budget up front
//! - `stream` hands back a channel; dropping the receiver cancels the call
//! - Adapter implementations report failure with `anyhow`, the engine maps it
//!   to wire error codes

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::{AdapterId, StreamKey};
use crate::routing::config::{RiskLevel, TaskClass};
use crate::window::SendEstimate;

/// Rough token count for text (four characters per token)
#[must_use]
pub fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

// ============================================================================
// Capabilities
// ============================================================================

/// What an adapter declares about itself
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterCapabilities {
    /// Model behind the adapter
    pub model: String,
    /// Task classes the adapter accepts (empty = all)
    pub task_types: Vec<TaskClass>,
    /// Task classes the adapter excels at
    pub strengths: Vec<TaskClass>,
    /// Maximum context window in tokens
    pub context_size: u64,
    /// USD per 1000 input tokens
    pub usd_per_1k_input: f64,
    /// USD per 1000 output tokens
    pub usd_per_1k_output: f64,
    /// Declared typical latency
    pub latency_ms: u64,
    /// Declared answer quality (0.0 - 1.0), used until outcomes accumulate
    pub quality_prior: f64,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            model: String::new(),
            task_types: Vec::new(),
            strengths: Vec::new(),
            context_size: 8192,
            usd_per_1k_input: 0.0,
            usd_per_1k_output: 0.0,
            latency_ms: 1000,
            quality_prior: 0.5,
        }
    }
}

impl AdapterCapabilities {
    /// Whether the adapter accepts this task class
    #[must_use]
    pub fn supports(&self, task: TaskClass) -> bool {
        self.task_types.is_empty() || self.task_types.contains(&task)
    }

    /// Affinity for a task class (0.0 - 1.0)
    #[must_use]
    pub fn affinity_for(&self, task: TaskClass) -> f64 {
        if self.strengths.contains(&task) {
            1.0
        } else if self.supports(task) {
            0.6
        } else {
            0.0
        }
    }

    /// Price of a call with the given token counts
    #[must_use]
    pub fn price(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.usd_per_1k_input + tokens_out as f64 * self.usd_per_1k_output)
            / 1000.0
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// One request as seen by an adapter
#[derive(Clone, Debug, PartialEq)]
pub struct AdapterRequest {
    /// Stream the request belongs to
    pub stream: StreamKey,
    /// Message sequence within the stream
    pub message_seq: u64,
    /// Task class
    pub task_class: TaskClass,
    /// Declared risk
    pub risk: RiskLevel,
    /// Reassembled request text
    pub prompt: String,
    /// Upper bound on output tokens (0 = adapter default)
    pub max_output_tokens: u64,
    /// Trace id for log correlation
    pub trace_id: Option<String>,
}

impl AdapterRequest {
    /// Request for `prompt` on `stream`
    pub fn new(stream: StreamKey, prompt: impl Into<String>) -> Self {
        Self {
            stream,
            message_seq: 0,
            task_class: TaskClass::default(),
            risk: RiskLevel::default(),
            prompt: prompt.into(),
            max_output_tokens: 0,
            trace_id: None,
        }
    }

    /// Set task class
    #[must_use]
    pub fn with_task_class(mut self, task_class: TaskClass) -> Self {
        self.task_class = task_class;
        self
    }

    /// Set risk
    #[must_use]
    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    /// Size of the request in tokens
    #[must_use]
    pub fn size_tokens(&self) -> u64 {
        approx_tokens(&self.prompt)
    }
}

/// Predicted consumption of one call
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Input tokens
    pub tokens_in: u64,
    /// Output tokens
    pub tokens_out: u64,
    /// Price in USD
    pub usd: f64,
}

impl CostEstimate {
    /// Total tokens
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }

    /// What the window governor reserves for this call
    #[must_use]
    pub fn to_send(&self) -> SendEstimate {
        SendEstimate {
            tokens: self.total_tokens(),
            usd: self.usd,
        }
    }
}

/// Response stream events from adapters
#[derive(Clone, Debug, PartialEq)]
pub enum AdapterChunk {
    /// A piece of the answer
    Partial {
        /// Content of this chunk
        content: String,
        /// Adapter's confidence in the answer so far
        confidence: f32,
        /// USD spent producing this chunk
        partial_cost: f64,
        /// Tokens produced in this chunk
        tokens: u64,
    },
    /// The adapter's own validation or tests failed
    ValidationFailed {
        /// What failed
        reason: String,
    },
    /// The call failed
    Error(String),
}

/// Health report
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// 95th percentile latency
    pub p95_latency_ms: u64,
    /// Recent error rate (0.0 - 1.0)
    pub error_rate: f64,
}

// ============================================================================
// Adapter trait
// ============================================================================

/// Language-model adapter
///
/// Implement this trait to put a new backend behind the switchboard.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable identity in the routing table
    fn id(&self) -> &AdapterId;

    /// Declared capabilities
    fn capabilities(&self) -> AdapterCapabilities;

    /// Predict the consumption of `request`
    async fn estimate(&self, request: &AdapterRequest) -> anyhow::Result<CostEstimate>;

    /// Start the call and return its chunk stream
    ///
    /// The channel closes when the response is complete. Dropping the
    /// receiver cancels the call.
    async fn stream(&self, request: &AdapterRequest) -> anyhow::Result<mpsc::Receiver<AdapterChunk>>;

    /// Current health
    async fn health(&self) -> HealthReport;
}

// ============================================================================
// Registry
// ============================================================================

/// Live adapters by id
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<AdapterId, Arc<dyn Adapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.ids())
            .finish()
    }
}

impl AdapterRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an adapter
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Option<Arc<dyn Adapter>> {
        self.adapters.insert(adapter.id().clone(), adapter)
    }

    /// Remove an adapter
    pub fn deregister(&self, id: &AdapterId) -> Option<Arc<dyn Adapter>> {
        self.adapters.remove(id).map(|(_, adapter)| adapter)
    }

    /// Look up an adapter
    #[must_use]
    pub fn get(&self, id: &AdapterId) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(id).map(|entry| entry.value().clone())
    }

    /// Registered ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<AdapterId> {
        let mut ids: Vec<AdapterId> = self.adapters.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// All adapters
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Adapter>> {
        self.adapters.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of adapters
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapter is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_affinity() {
        let caps = AdapterCapabilities {
            task_types: vec![TaskClass::CodeGeneration, TaskClass::General],
            strengths: vec![TaskClass::CodeGeneration],
            ..Default::default()
        };
        assert_eq!(caps.affinity_for(TaskClass::CodeGeneration), 1.0);
        assert_eq!(caps.affinity_for(TaskClass::General), 0.6);
        assert_eq!(caps.affinity_for(TaskClass::Creative), 0.0);
        assert!(AdapterCapabilities::default().supports(TaskClass::Creative));
    }

    #[test]
    fn test_price_and_estimate() {
        let caps = AdapterCapabilities {
            usd_per_1k_input: 1.0,
            usd_per_1k_output: 2.0,
            ..Default::default()
        };
        assert!((caps.price(500, 250) - 1.0).abs() < 1e-9);

        let estimate = CostEstimate {
            tokens_in: 500,
            tokens_out: 250,
            usd: 1.0,
        };
        assert_eq!(estimate.to_send().tokens, 750);
    }

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }
}
