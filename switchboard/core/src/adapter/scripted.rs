//! Scripted Adapter
//!
//! A loopback adapter that replays a canned response. Used by tests and by
//! the daemon when adapters are declared in configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{
    approx_tokens, Adapter, AdapterCapabilities, AdapterChunk, AdapterRequest, CostEstimate,
    HealthReport,
};
use crate::protocol::AdapterId;
use crate::routing::config::duration_ms;

/// How a scripted adapter behaves
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedBehavior {
    /// Full response text
    pub response: String,
    /// Confidence reported with every chunk
    pub confidence: f32,
    /// Delay before the first chunk
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    /// Uniform random extra delay, up to this much
    #[serde(with = "duration_ms")]
    pub jitter: Duration,
    /// Number of chunks the response is split into
    pub chunks: usize,
    /// Fail with this message instead of answering
    pub fail_with: Option<String>,
    /// Report this validation failure after the answer
    pub validation_failure: Option<String>,
    /// Never answer (until cancelled)
    pub hang: bool,
    /// Fixed token estimate overriding the text-based one
    pub estimate_tokens: Option<u64>,
    /// Fixed USD estimate overriding the price-based one
    pub estimate_usd: Option<f64>,
}

impl Default for ScriptedBehavior {
    fn default() -> Self {
        Self {
            response: String::new(),
            confidence: 0.8,
            latency: Duration::from_millis(10),
            jitter: Duration::ZERO,
            chunks: 1,
            fail_with: None,
            validation_failure: None,
            hang: false,
            estimate_tokens: None,
            estimate_usd: None,
        }
    }
}

impl ScriptedBehavior {
    /// Answer `response` with `confidence`
    pub fn answer(response: impl Into<String>, confidence: f32) -> Self {
        Self {
            response: response.into(),
            confidence,
            ..Default::default()
        }
    }

    /// Set first-chunk latency
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Split the answer into `chunks` pieces
    #[must_use]
    pub fn with_chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks.max(1);
        self
    }

    /// Fail every call
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Default::default()
        }
    }

    /// Never answer
    #[must_use]
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    /// Report a validation failure after answering
    #[must_use]
    pub fn with_validation_failure(mut self, reason: impl Into<String>) -> Self {
        self.validation_failure = Some(reason.into());
        self
    }

    /// Pin the estimate
    #[must_use]
    pub fn with_estimate(mut self, tokens: u64, usd: f64) -> Self {
        self.estimate_tokens = Some(tokens);
        self.estimate_usd = Some(usd);
        self
    }
}

/// Scripted adapter declared in configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptedAdapterConfig {
    /// Adapter id
    pub id: String,
    /// Declared capabilities
    #[serde(default)]
    pub capabilities: AdapterCapabilities,
    /// Behaviour
    #[serde(default)]
    pub behavior: ScriptedBehavior,
}

/// Adapter that replays a [`ScriptedBehavior`]
#[derive(Debug)]
pub struct ScriptedAdapter {
    id: AdapterId,
    capabilities: AdapterCapabilities,
    behavior: ScriptedBehavior,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl ScriptedAdapter {
    /// Create a scripted adapter
    pub fn new(
        id: impl Into<String>,
        capabilities: AdapterCapabilities,
        behavior: ScriptedBehavior,
    ) -> Self {
        Self {
            id: AdapterId::new(id),
            capabilities,
            behavior,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &ScriptedAdapterConfig) -> Self {
        Self::new(
            config.id.clone(),
            config.capabilities.clone(),
            config.behavior.clone(),
        )
    }

    /// Number of `stream` calls so far
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn delay(&self) -> Duration {
        let jitter_ms = self.behavior.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.behavior.latency;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.behavior.latency + Duration::from_millis(extra)
    }

    fn split_response(&self) -> Vec<String> {
        let chars: Vec<char> = self.behavior.response.chars().collect();
        let pieces = self.behavior.chunks.max(1);
        if chars.is_empty() {
            return vec![String::new()];
        }
        let size = chars.len().div_ceil(pieces);
        chars.chunks(size).map(|c| c.iter().collect()).collect()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn id(&self) -> &AdapterId {
        &self.id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities.clone()
    }

    async fn estimate(&self, request: &AdapterRequest) -> anyhow::Result<CostEstimate> {
        let tokens_in = request.size_tokens();
        let tokens_out = approx_tokens(&self.behavior.response);
        let mut estimate = CostEstimate {
            tokens_in,
            tokens_out,
            usd: self.capabilities.price(tokens_in, tokens_out),
        };
        if let Some(tokens) = self.behavior.estimate_tokens {
            estimate.tokens_in = 0;
            estimate.tokens_out = tokens;
        }
        if let Some(usd) = self.behavior.estimate_usd {
            estimate.usd = usd;
        }
        Ok(estimate)
    }

    async fn stream(&self, request: &AdapterRequest) -> anyhow::Result<mpsc::Receiver<AdapterChunk>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(16);

        if self.behavior.hang {
            debug!(adapter = %self.id, stream = %request.stream, "Scripted adapter hanging");
            tokio::spawn(async move {
                tx.closed().await;
            });
            return Ok(rx);
        }

        let delay = self.delay();
        if let Some(message) = self.behavior.fail_with.clone() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(AdapterChunk::Error(message)).await;
            });
            return Ok(rx);
        }

        let pieces = self.split_response();
        let confidence = self.behavior.confidence;
        let validation = self.behavior.validation_failure.clone();
        let capabilities = self.capabilities.clone();
        let tokens_in = request.size_tokens();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for (index, content) in pieces.into_iter().enumerate() {
                let tokens = approx_tokens(&content);
                // Input tokens are billed with the first chunk
                let billed_in = if index == 0 { tokens_in } else { 0 };
                let chunk = AdapterChunk::Partial {
                    partial_cost: capabilities.price(billed_in, tokens),
                    tokens: tokens + billed_in,
                    content,
                    confidence,
                };
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            if let Some(reason) = validation {
                let _ = tx.send(AdapterChunk::ValidationFailed { reason }).await;
            }
        });

        Ok(rx)
    }

    async fn health(&self) -> HealthReport {
        let calls = self.calls.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        HealthReport {
            p95_latency_ms: (self.behavior.latency + self.behavior.jitter).as_millis() as u64,
            error_rate: if calls == 0 {
                0.0
            } else {
                failures as f64 / calls as f64
            },
        }
    }
}
