//! Routing Table
//!
//! One row per advertised adapter: declared capabilities plus live metrics
//! learned from health reports and observed outcomes. Many request tasks
//! read the table concurrently; advertisement, health and outcome updates
//! are serialised by the write lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::config::{HealthConfig, TaskClass};
use super::metrics::LatencyWindow;
use crate::adapter::{AdapterCapabilities, HealthReport};
use crate::protocol::AdapterId;

// ============================================================================
// Adapter Entry
// ============================================================================

/// Routing table row
#[derive(Clone, Debug)]
pub struct AdapterEntry {
    /// Adapter id
    pub id: AdapterId,
    /// Declared capabilities
    pub capabilities: AdapterCapabilities,
    /// Observed call latencies
    pub latency: LatencyWindow,
    /// p95 from the last health report
    pub reported_p95_ms: Option<u64>,
    /// Exponentially weighted error rate (0.0 - 1.0)
    pub error_rate: f64,
    /// Completed calls
    pub trials: u64,
    /// Calls whose answer was chosen
    pub wins: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Whether the adapter may be selected
    pub healthy: bool,
    /// When the adapter last became unhealthy
    pub unhealthy_since: Option<Instant>,
    /// Last advertisement
    pub advertised_at: Instant,
}

impl AdapterEntry {
    fn new(id: AdapterId, capabilities: AdapterCapabilities, now: Instant) -> Self {
        Self {
            id,
            capabilities,
            latency: LatencyWindow::default(),
            reported_p95_ms: None,
            error_rate: 0.0,
            trials: 0,
            wins: 0,
            consecutive_failures: 0,
            healthy: true,
            unhealthy_since: None,
            advertised_at: now,
        }
    }

    /// Best available p95: observed, then reported, then declared
    #[must_use]
    pub fn p95_latency_ms(&self) -> u64 {
        self.latency
            .p95_ms()
            .or(self.reported_p95_ms)
            .unwrap_or(self.capabilities.latency_ms)
    }

    /// Laplace-smoothed historical win rate
    #[must_use]
    pub fn win_rate(&self) -> f64 {
        (self.wins as f64 + 1.0) / (self.trials as f64 + 2.0)
    }

    /// Whether the adapter can serve `task`
    #[must_use]
    pub fn serves(&self, task: TaskClass) -> bool {
        self.healthy && self.capabilities.supports(task)
    }

    fn refresh_health(&mut self, config: &HealthConfig, now: Instant) {
        let healthy = self.error_rate <= config.max_error_rate
            && self.consecutive_failures < config.max_consecutive_failures;
        if healthy == self.healthy {
            return;
        }
        self.healthy = healthy;
        if healthy {
            self.unhealthy_since = None;
            info!(adapter = %self.id, "Adapter healthy again");
        } else {
            self.unhealthy_since = Some(now);
            warn!(
                adapter = %self.id,
                error_rate = self.error_rate,
                consecutive_failures = self.consecutive_failures,
                "Adapter marked unhealthy"
            );
        }
    }
}

/// Observed result of one adapter call
#[derive(Clone, Debug, PartialEq)]
pub struct CallOutcome {
    /// Whether the call produced a usable answer
    pub success: bool,
    /// Whether its answer was chosen
    pub won: bool,
    /// Wall time of the call
    pub latency: Duration,
}

impl CallOutcome {
    /// Successful call
    #[must_use]
    pub fn success(latency: Duration, won: bool) -> Self {
        Self {
            success: true,
            won,
            latency,
        }
    }

    /// Failed or timed-out call
    #[must_use]
    pub fn failure(latency: Duration) -> Self {
        Self {
            success: false,
            won: false,
            latency,
        }
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// Live adapter rows
#[derive(Debug, Default)]
pub struct RoutingTable {
    config: HealthConfig,
    rows: RwLock<HashMap<AdapterId, AdapterEntry>>,
}

impl RoutingTable {
    /// Empty table
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Health configuration
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Create or refresh a row; returns `true` for a new adapter
    ///
    /// Refreshing replaces capabilities and keeps the learned metrics.
    pub async fn advertise(&self, id: AdapterId, capabilities: AdapterCapabilities) -> bool {
        let now = Instant::now();
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(entry) => {
                entry.capabilities = capabilities;
                entry.advertised_at = now;
                debug!(adapter = %id, "Capabilities refreshed");
                false
            }
            None => {
                info!(adapter = %id, model = %capabilities.model, "Adapter advertised");
                rows.insert(id.clone(), AdapterEntry::new(id, capabilities, now));
                true
            }
        }
    }

    /// Remove a row
    pub async fn deregister(&self, id: &AdapterId) -> Option<AdapterEntry> {
        let removed = self.rows.write().await.remove(id);
        if removed.is_some() {
            info!(adapter = %id, "Adapter deregistered");
        }
        removed
    }

    /// Blend a health report into the row
    pub async fn apply_health(&self, id: &AdapterId, report: HealthReport) -> bool {
        let alpha = self.config.ewma_alpha;
        let mut rows = self.rows.write().await;
        let Some(entry) = rows.get_mut(id) else {
            return false;
        };
        entry.error_rate = alpha * report.error_rate + (1.0 - alpha) * entry.error_rate;
        entry.reported_p95_ms = Some(report.p95_latency_ms);
        if report.error_rate <= self.config.max_error_rate {
            entry.consecutive_failures = 0;
        }
        entry.refresh_health(&self.config, Instant::now());
        true
    }

    /// Fold one call outcome into the row
    pub async fn record_outcome(&self, id: &AdapterId, outcome: &CallOutcome) -> bool {
        let alpha = self.config.ewma_alpha;
        let mut rows = self.rows.write().await;
        let Some(entry) = rows.get_mut(id) else {
            return false;
        };
        entry.trials += 1;
        entry.latency.record(outcome.latency);
        if outcome.success {
            entry.error_rate *= 1.0 - alpha;
            entry.consecutive_failures = 0;
            if outcome.won {
                entry.wins += 1;
            }
        } else {
            entry.error_rate = alpha + (1.0 - alpha) * entry.error_rate;
            entry.consecutive_failures += 1;
        }
        entry.refresh_health(&self.config, Instant::now());
        true
    }

    /// Remove rows unhealthy for longer than the configured grace
    pub async fn prune_unhealthy(&self, now: Instant) -> Vec<AdapterId> {
        let grace = self.config.prune_grace;
        let mut rows = self.rows.write().await;
        let expired: Vec<AdapterId> = rows
            .values()
            .filter(|e| {
                e.unhealthy_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= grace)
            })
            .map(|e| e.id.clone())
            .collect();
        for id in &expired {
            rows.remove(id);
            warn!(adapter = %id, "Pruned after prolonged unhealthiness");
        }
        expired
    }

    /// Copy of one row
    pub async fn get(&self, id: &AdapterId) -> Option<AdapterEntry> {
        self.rows.read().await.get(id).cloned()
    }

    /// Copy of every row
    pub async fn entries(&self) -> Vec<AdapterEntry> {
        let mut entries: Vec<AdapterEntry> = self.rows.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Number of rows
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether the table is empty
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> AdapterCapabilities {
        AdapterCapabilities {
            model: "m".into(),
            ..AdapterCapabilities::default()
        }
    }

    #[tokio::test]
    async fn test_advertise_creates_then_refreshes() {
        let table = RoutingTable::default();
        let id = AdapterId::new("a");
        assert!(table.advertise(id.clone(), caps()).await);
        table
            .record_outcome(&id, &CallOutcome::success(Duration::from_millis(40), true))
            .await;

        let mut updated = caps();
        updated.context_size = 128_000;
        assert!(!table.advertise(id.clone(), updated).await);

        let entry = table.get(&id).await.unwrap();
        assert_eq!(entry.capabilities.context_size, 128_000);
        assert_eq!(entry.trials, 1);
        assert_eq!(entry.wins, 1);
    }

    #[tokio::test]
    async fn test_consecutive_failures_mark_unhealthy() {
        let table = RoutingTable::new(HealthConfig {
            max_error_rate: 1.0,
            ..HealthConfig::default()
        });
        let id = AdapterId::new("a");
        table.advertise(id.clone(), caps()).await;

        for _ in 0..2 {
            table
                .record_outcome(&id, &CallOutcome::failure(Duration::from_millis(5)))
                .await;
        }
        assert!(table.get(&id).await.unwrap().healthy);

        table
            .record_outcome(&id, &CallOutcome::failure(Duration::from_millis(5)))
            .await;
        let entry = table.get(&id).await.unwrap();
        assert!(!entry.healthy);
        assert!(entry.unhealthy_since.is_some());
    }

    #[tokio::test]
    async fn test_error_rate_ewma() {
        let table = RoutingTable::default();
        let id = AdapterId::new("a");
        table.advertise(id.clone(), caps()).await;
        table
            .record_outcome(&id, &CallOutcome::failure(Duration::from_millis(5)))
            .await;
        let entry = table.get(&id).await.unwrap();
        assert!((entry.error_rate - 0.3).abs() < 1e-9);
        assert!(entry.healthy);

        table
            .record_outcome(&id, &CallOutcome::failure(Duration::from_millis(5)))
            .await;
        // 0.3 + 0.7 * 0.3 = 0.51
        assert!(!table.get(&id).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_health_report_recovers_adapter() {
        let table = RoutingTable::default();
        let id = AdapterId::new("a");
        table.advertise(id.clone(), caps()).await;
        table
            .apply_health(
                &id,
                HealthReport {
                    p95_latency_ms: 900,
                    error_rate: 1.0,
                },
            )
            .await;
        table
            .apply_health(
                &id,
                HealthReport {
                    p95_latency_ms: 900,
                    error_rate: 1.0,
                },
            )
            .await;
        assert!(!table.get(&id).await.unwrap().healthy);

        for _ in 0..5 {
            table
                .apply_health(
                    &id,
                    HealthReport {
                        p95_latency_ms: 100,
                        error_rate: 0.0,
                    },
                )
                .await;
        }
        let entry = table.get(&id).await.unwrap();
        assert!(entry.healthy);
        assert_eq!(entry.p95_latency_ms(), 100);
    }

    #[tokio::test]
    async fn test_prune_after_grace() {
        let table = RoutingTable::new(HealthConfig {
            prune_grace: Duration::from_secs(10),
            ..HealthConfig::default()
        });
        let id = AdapterId::new("a");
        table.advertise(id.clone(), caps()).await;
        for _ in 0..3 {
            table
                .record_outcome(&id, &CallOutcome::failure(Duration::from_millis(5)))
                .await;
        }
        let now = Instant::now();
        assert!(table.prune_unhealthy(now).await.is_empty());
        assert_eq!(
            table.prune_unhealthy(now + Duration::from_secs(11)).await,
            vec![id.clone()]
        );
        assert!(table.get(&id).await.is_none());
    }

    #[test]
    fn test_p95_prefers_observed_latency() {
        let mut entry = AdapterEntry::new(AdapterId::new("a"), caps(), Instant::now());
        assert_eq!(entry.p95_latency_ms(), 1000);
        entry.reported_p95_ms = Some(300);
        assert_eq!(entry.p95_latency_ms(), 300);
        entry.latency.record(Duration::from_millis(20));
        assert_eq!(entry.p95_latency_ms(), 20);
    }
}
