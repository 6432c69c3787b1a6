//! Engine Metrics
//!
//! Lock-free primitives used across the engine:
//! - Atomic counters and gauges
//! - Bucketed latency histograms
//! - A rolling latency window for per-adapter p95 tracking
//!
//! plus [`EngineMetrics`], the engine-wide counter set.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds (in the unit being measured)
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (milliseconds)
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);

        let value_u64 = value as u64;
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds
    pub buckets: Vec<f64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Number of samples
    pub total: u64,
    /// Sum of samples (truncated to integers)
    pub sum: u64,
    /// Smallest sample
    pub min: u64,
    /// Largest sample
    pub max: u64,
    /// Mean sample
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding percentile `p` (0.0 - 1.0)
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// p50
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// p95
    #[must_use]
    pub fn p95(&self) -> f64 {
        self.percentile(0.95)
    }
}

// ============================================================================
// Rolling latency window
// ============================================================================

/// The most recent `capacity` latency samples
///
/// Unlike [`Histogram`] this forgets old samples, so an adapter that recovers
/// from a slow period sees its p95 come back down.
#[derive(Clone, Debug)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(128)
    }
}

impl LatencyWindow {
    /// Window holding at most `capacity` samples
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Record a latency
    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency.as_millis() as u64);
    }

    /// Number of samples held
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentile in milliseconds, `None` when empty
    #[must_use]
    pub fn percentile_ms(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize).max(1);
        Some(sorted[rank - 1])
    }

    /// p95 in milliseconds
    #[must_use]
    pub fn p95_ms(&self) -> Option<u64> {
        self.percentile_ms(0.95)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Zeroed counter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Gauge
// ============================================================================

/// A gauge (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Zeroed gauge
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtract one, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Engine Metrics
// ============================================================================

/// Engine-wide counters
#[derive(Debug)]
pub struct EngineMetrics {
    /// Streams opened
    pub streams_opened: Counter,
    /// Streams that ended with a result
    pub streams_completed: Counter,
    /// Streams that ended with a terminal error
    pub aborts: Counter,
    /// Successful admissions
    pub admissions: Counter,
    /// Admissions refused with `WINDOW_EXCEEDED`
    pub rejections: Counter,
    /// Work shed or displaced by the scheduler
    pub preemptions: Counter,
    /// Escalations run
    pub escalations: Counter,
    /// Adapter calls that missed their deadline
    pub adapter_timeouts: Counter,
    /// Frames rejected by the codec
    pub decode_errors: Counter,
    /// Requests waiting in the scheduler
    pub queue_depth: Gauge,
    /// Requests currently being served
    pub active_requests: Gauge,
    /// End-to-end request latency (ms)
    pub request_latency: Histogram,
    /// Time spent queued before dispatch (ms)
    pub queue_wait: Histogram,
    started_at: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Fresh metrics
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams_opened: Counter::new(),
            streams_completed: Counter::new(),
            aborts: Counter::new(),
            admissions: Counter::new(),
            rejections: Counter::new(),
            preemptions: Counter::new(),
            escalations: Counter::new(),
            adapter_timeouts: Counter::new(),
            decode_errors: Counter::new(),
            queue_depth: Gauge::new(),
            active_requests: Gauge::new(),
            request_latency: Histogram::latency_default(),
            queue_wait: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    /// Time since the metrics were created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Plain-value copy for logging and tests
    #[must_use]
    pub fn summary(&self) -> EngineMetricsSummary {
        let latency = self.request_latency.snapshot();
        EngineMetricsSummary {
            uptime_seconds: self.uptime().as_secs(),
            streams_opened: self.streams_opened.get(),
            streams_completed: self.streams_completed.get(),
            aborts: self.aborts.get(),
            admissions: self.admissions.get(),
            rejections: self.rejections.get(),
            preemptions: self.preemptions.get(),
            escalations: self.escalations.get(),
            adapter_timeouts: self.adapter_timeouts.get(),
            decode_errors: self.decode_errors.get(),
            queue_depth: self.queue_depth.get(),
            active_requests: self.active_requests.get(),
            latency_p50_ms: latency.p50(),
            latency_p95_ms: latency.p95(),
        }
    }
}

/// Snapshot of [`EngineMetrics`]
#[derive(Clone, Debug, Default, PartialEq)]
#[allow(missing_docs)]
pub struct EngineMetricsSummary {
    pub uptime_seconds: u64,
    pub streams_opened: u64,
    pub streams_completed: u64,
    pub aborts: u64,
    pub admissions: u64,
    pub rejections: u64,
    pub preemptions: u64,
    pub escalations: u64,
    pub adapter_timeouts: u64,
    pub decode_errors: u64,
    pub queue_depth: u64,
    pub active_requests: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new(vec![10.0, 25.0, 50.0, 100.0]);

        hist.record(5.0);
        hist.record(15.0);
        hist.record(75.0);
        hist.record(200.0); // lands in the last bucket

        let snap = hist.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.min, 5);
        assert_eq!(snap.max, 200);
        assert_eq!(snap.p50(), 25.0);
    }

    #[test]
    fn test_latency_window_forgets_old_samples() {
        let mut window = LatencyWindow::new(4);
        for ms in [1000, 1000, 1000, 1000] {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.p95_ms(), Some(1000));

        for ms in [10, 20, 30, 40] {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.len(), 4);
        assert_eq!(window.p95_ms(), Some(40));
        assert_eq!(window.percentile_ms(0.5), Some(20));
    }

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_engine_metrics_summary() {
        let metrics = EngineMetrics::new();
        metrics.admissions.add(3);
        metrics.rejections.inc();
        metrics.request_latency.record(120.0);

        let summary = metrics.summary();
        assert_eq!(summary.admissions, 3);
        assert_eq!(summary.rejections, 1);
        assert_eq!(summary.latency_p95_ms, 250.0);
    }
}
