//! Weighted fair queue across QoS tiers
//!
//! Each tier is a FIFO. Dispatch uses smooth weighted round robin over the
//! non-empty tiers, with one override: while Gold has work and its share of
//! the last `share_window` dispatch decisions is below `gold_reserved_share`,
//! Gold is served first. Lower-tier depth therefore never starves Gold.
//!
//! Under congestion the queue sheds from the bottom: Bronze first, Silver
//! only when congestion is severe, Gold never.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::protocol::{ErrorCode, PriorityTier, StreamKey};

// =============================================================================
// Configuration
// =============================================================================

/// Per-tier scheduling weights
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierWeights {
    /// Gold weight
    pub gold: u32,
    /// Silver weight
    pub silver: u32,
    /// Bronze weight
    pub bronze: u32,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            gold: 6,
            silver: 3,
            bronze: 1,
        }
    }
}

impl TierWeights {
    fn get(&self, tier: PriorityTier) -> i64 {
        i64::from(match tier {
            PriorityTier::Gold => self.gold,
            PriorityTier::Silver => self.silver,
            PriorityTier::Bronze => self.bronze,
        })
    }
}

/// Scheduler tunables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tier weights
    pub weights: TierWeights,
    /// Minimum Gold share of recent dispatches while Gold has work
    pub gold_reserved_share: f64,
    /// Number of recent dispatch decisions the share is measured over
    pub share_window: usize,
    /// Maximum queued items across all tiers
    pub max_depth: usize,
    /// Congestion at which Bronze work is shed
    pub shed_threshold: f64,
    /// Congestion at which Silver work is shed too
    pub severe_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: TierWeights::default(),
            gold_reserved_share: 0.5,
            share_window: 64,
            max_depth: 1024,
            shed_threshold: 0.85,
            severe_threshold: 0.95,
        }
    }
}

/// Scheduler errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    /// Queue full and nothing lower-tier to displace
    #[error("stream {key} preempted: {tier} queue full")]
    Preempted {
        /// Rejected stream
        key: StreamKey,
        /// Its tier
        tier: PriorityTier,
    },

    /// Scheduler closed
    #[error("scheduler closed")]
    Closed,
}

impl SchedulerError {
    /// Wire code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Preempted { .. } => ErrorCode::Preempted,
            Self::Closed => ErrorCode::Internal,
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// One unit of admitted work
#[derive(Clone, Debug)]
pub struct Scheduled<T> {
    /// Stream the work belongs to
    pub key: StreamKey,
    /// QoS tier
    pub tier: PriorityTier,
    /// Payload
    pub item: T,
    /// When it was queued
    pub enqueued_at: Instant,
}

impl<T> Scheduled<T> {
    /// How long the item has waited
    #[must_use]
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Dispatch counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Items dispatched per tier (Gold, Silver, Bronze)
    pub dispatched: [u64; 3],
    /// Items displaced or shed per tier
    pub preempted: [u64; 3],
    /// Items waiting per tier
    pub depth: [usize; 3],
}

struct Inner<T> {
    queues: [VecDeque<Scheduled<T>>; 3],
    current: [i64; 3],
    recent: VecDeque<PriorityTier>,
    recent_gold: usize,
    stats: SchedulerStats,
    closed: bool,
}

impl<T> Inner<T> {
    fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn record(&mut self, tier: PriorityTier, window: usize) {
        self.recent.push_back(tier);
        if tier == PriorityTier::Gold {
            self.recent_gold += 1;
        }
        while self.recent.len() > window {
            if self.recent.pop_front() == Some(PriorityTier::Gold) {
                self.recent_gold -= 1;
            }
        }
        self.stats.dispatched[tier.index()] += 1;
    }
}

/// QoS scheduler over items of type `T`
pub struct QosScheduler<T> {
    config: SchedulerConfig,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> fmt::Debug for QosScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QosScheduler")
            .field("config", &self.config)
            .field("depth", &self.len())
            .finish()
    }
}

impl<T> Default for QosScheduler<T> {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl<T> QosScheduler<T> {
    /// Empty scheduler
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                current: [0; 3],
                recent: VecDeque::new(),
                recent_gold: 0,
                stats: SchedulerStats::default(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue work
    ///
    /// On a full queue the newest item of the lowest lower tier is displaced
    /// and returned so the caller can abort it.
    ///
    /// # Errors
    ///
    /// `Preempted` when the queue is full and nothing lower-tier can be
    /// displaced, `Closed` after [`close`](Self::close).
    pub fn enqueue(
        &self,
        key: StreamKey,
        tier: PriorityTier,
        item: T,
    ) -> Result<Option<Scheduled<T>>, SchedulerError> {
        let displaced = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SchedulerError::Closed);
            }

            let mut displaced = None;
            if inner.len() >= self.config.max_depth {
                let victim = PriorityTier::ALL
                    .iter()
                    .rev()
                    .copied()
                    .find(|t| tier.outranks(*t) && !inner.queues[t.index()].is_empty());
                match victim {
                    Some(victim) => {
                        displaced = inner.queues[victim.index()].pop_back();
                        inner.stats.preempted[victim.index()] += 1;
                    }
                    None => {
                        inner.stats.preempted[tier.index()] += 1;
                        return Err(SchedulerError::Preempted { key, tier });
                    }
                }
            }

            inner.queues[tier.index()].push_back(Scheduled {
                key,
                tier,
                item,
                enqueued_at: Instant::now(),
            });
            displaced
        };
        if let Some(victim) = &displaced {
            debug!(stream = %victim.key, tier = %victim.tier, "Displaced by higher tier");
        }
        self.notify.notify_one();
        Ok(displaced)
    }

    /// Next item, if any, without waiting
    pub fn try_next(&self) -> Option<Scheduled<T>> {
        let mut inner = self.inner.lock();
        let tier = self.pick(&mut inner)?;
        let item = inner.queues[tier.index()].pop_front()?;
        inner.record(tier, self.config.share_window.max(1));
        Some(item)
    }

    /// Wait for the next item; `None` once closed and drained
    pub async fn next(&self) -> Option<Scheduled<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_next() {
                return Some(item);
            }
            if self.inner.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// Shed lower-tier work under congestion (0.0 - 1.0)
    ///
    /// Returns the shed items; callers abort their streams with `PREEMPTED`.
    pub fn shed(&self, congestion: f64) -> Vec<Scheduled<T>> {
        let mut tiers = Vec::new();
        if congestion >= self.config.shed_threshold {
            tiers.push(PriorityTier::Bronze);
        }
        if congestion >= self.config.severe_threshold {
            tiers.push(PriorityTier::Silver);
        }
        if tiers.is_empty() {
            return Vec::new();
        }

        let mut inner = self.inner.lock();
        let mut shed = Vec::new();
        for tier in tiers {
            let drained: Vec<_> = inner.queues[tier.index()].drain(..).collect();
            inner.stats.preempted[tier.index()] += drained.len() as u64;
            shed.extend(drained);
        }
        if !shed.is_empty() {
            debug!(congestion, shed = shed.len(), "Shed queued work");
        }
        shed
    }

    /// Remove every queued item of a stream
    pub fn remove_stream(&self, key: &StreamKey) -> Vec<Scheduled<T>> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        for queue in &mut inner.queues {
            let mut kept = VecDeque::with_capacity(queue.len());
            for item in queue.drain(..) {
                if &item.key == key {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *queue = kept;
        }
        removed
    }

    /// Stop accepting work and wake every waiter
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Items queued across all tiers
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters and depths
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        for tier in PriorityTier::ALL {
            stats.depth[tier.index()] = inner.queues[tier.index()].len();
        }
        stats
    }

    fn pick(&self, inner: &mut Inner<T>) -> Option<PriorityTier> {
        let ready: Vec<PriorityTier> = PriorityTier::ALL
            .iter()
            .copied()
            .filter(|t| !inner.queues[t.index()].is_empty())
            .collect();
        if ready.is_empty() {
            return None;
        }

        if ready.contains(&PriorityTier::Gold) {
            let decisions = inner.recent.len() as f64 + 1.0;
            if (inner.recent_gold as f64) < self.config.gold_reserved_share * decisions {
                return Some(PriorityTier::Gold);
            }
        }

        // Smooth weighted round robin over the ready tiers
        let weights = &self.config.weights;
        let total: i64 = ready.iter().map(|t| weights.get(*t)).sum();
        if total == 0 {
            return ready.first().copied();
        }
        let mut best = ready[0];
        for tier in &ready {
            inner.current[tier.index()] += weights.get(*tier);
            if inner.current[tier.index()] > inner.current[best.index()] {
                best = *tier;
            }
        }
        inner.current[best.index()] -= total;
        Some(best)
    }
}
