//! Window Governor
//!
//! Per-stream admission control over three dimensions: concurrent adapter
//! calls, tokens and USD. The governor is the single writer of window state;
//! everything else reads snapshots or goes through its contract.
//!
//! # Design
//!
//! - `try_admit` checks and reserves under the window's map entry lock, so
//!   two concurrent senders can never both squeeze under a ceiling
//! - Every reservation is a [`SendTicket`]; `on_ack` swaps the reserved
//!   estimate for actual consumption, `on_timeout` keeps the estimate charged
//! - The parallel dimension is gated by an AIMD ceiling that grows on
//!   successful acks and halves on failures and timeouts
//! - Window updates go out on a channel when remaining capacity moves by at
//!   least `update_threshold`, and on `tick` once `update_interval` elapsed

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use super::aimd::{AimdCeiling, AimdConfig};
use crate::protocol::{ErrorCode, StreamKey, WindowLimits, WindowSnapshot, WindowUsage};
use crate::routing::config::duration_ms;

/// Float slack for USD comparisons
const USD_EPSILON: f64 = 1e-9;

// =============================================================================
// Configuration
// =============================================================================

/// Governor tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// AIMD constants
    pub aimd: AimdConfig,
    /// How long `admit_within` waits for capacity
    #[serde(with = "duration_ms")]
    pub admission_timeout: Duration,
    /// Remaining-fraction change that triggers a window update
    pub update_threshold: f64,
    /// Maximum time between window updates of a busy window
    #[serde(with = "duration_ms")]
    pub update_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            aimd: AimdConfig::default(),
            admission_timeout: Duration::from_millis(250),
            update_threshold: 0.20,
            update_interval: Duration::from_secs(1),
        }
    }
}

impl GovernorConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the admission timeout
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Set the update threshold
    #[must_use]
    pub fn with_update_threshold(mut self, threshold: f64) -> Self {
        self.update_threshold = threshold;
        self
    }

    /// Set the AIMD constants
    #[must_use]
    pub fn with_aimd(mut self, aimd: AimdConfig) -> Self {
        self.aimd = aimd;
        self
    }
}

// =============================================================================
// Types
// =============================================================================

/// Predicted consumption of one send
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SendEstimate {
    /// Tokens (input + output)
    pub tokens: u64,
    /// USD
    pub usd: f64,
}

impl SendEstimate {
    /// Estimate of `tokens` and `usd`
    #[must_use]
    pub fn new(tokens: u64, usd: f64) -> Self {
        Self { tokens, usd }
    }
}

/// Window dimension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Token ceiling
    Tokens,
    /// USD ceiling
    Usd,
    /// Concurrency ceiling
    Parallel,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tokens => write!(f, "tokens"),
            Self::Usd => write!(f, "usd"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Proof of an admitted send; hand it back on ack or timeout
#[derive(Clone, Debug, PartialEq)]
pub struct SendTicket {
    key: StreamKey,
    id: u64,
    estimate: SendEstimate,
}

impl SendTicket {
    /// Stream the send belongs to
    #[must_use]
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Reserved estimate
    #[must_use]
    pub fn estimate(&self) -> SendEstimate {
        self.estimate
    }
}

/// Window change worth telling the sender about
#[derive(Clone, Debug, PartialEq)]
pub struct WindowUpdate {
    /// Stream whose window changed
    pub key: StreamKey,
    /// Window after the change
    pub snapshot: WindowSnapshot,
}

/// Governor errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GovernorError {
    /// Admission refused; retry after a window update
    #[error("window exceeded on {dimension} for {key}")]
    WindowExceeded {
        /// Stream refused
        key: StreamKey,
        /// First violated dimension (tokens, usd, parallel order)
        dimension: Dimension,
        /// Every violated dimension, in the same order
        violations: Vec<Dimension>,
        /// Window at the time of refusal
        snapshot: WindowSnapshot,
    },

    /// Token or USD ceiling cannot fit the send even with nothing in flight
    #[error("budget exhausted on {dimension} for {key}")]
    BudgetExhausted {
        /// Stream refused
        key: StreamKey,
        /// Exhausted dimension
        dimension: Dimension,
        /// Window at the time of refusal
        snapshot: WindowSnapshot,
    },

    /// No window registered for the stream
    #[error("no window for stream {0}")]
    UnknownStream(StreamKey),

    /// Ticket was already settled or its window released
    #[error("unknown send ticket {0}")]
    UnknownTicket(u64),
}

impl GovernorError {
    /// Wire code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::WindowExceeded { .. } => ErrorCode::WindowExceeded,
            Self::BudgetExhausted { .. } => ErrorCode::BudgetExhausted,
            Self::UnknownStream(_) => ErrorCode::UnknownStream,
            Self::UnknownTicket(_) => ErrorCode::Internal,
        }
    }

    /// Window snapshot carried by admission errors
    #[must_use]
    pub fn snapshot(&self) -> Option<WindowSnapshot> {
        match self {
            Self::WindowExceeded { snapshot, .. } | Self::BudgetExhausted { snapshot, .. } => {
                Some(*snapshot)
            }
            _ => None,
        }
    }
}

// =============================================================================
// Window state
// =============================================================================

struct WindowState {
    limits: WindowLimits,
    usage: WindowUsage,
    ceiling: AimdCeiling,
    outstanding: HashMap<u64, SendEstimate>,
    last_emitted: (f64, f64, f64),
    last_emit_at: Instant,
    notify: Arc<Notify>,
}

impl WindowState {
    fn new(limits: WindowLimits, now: Instant) -> Self {
        let mut state = Self {
            limits,
            usage: WindowUsage::default(),
            ceiling: AimdCeiling::new(limits.max_parallel),
            outstanding: HashMap::new(),
            last_emitted: (1.0, 1.0, 1.0),
            last_emit_at: now,
            notify: Arc::new(Notify::new()),
        };
        state.last_emitted = state.snapshot().remaining_fractions();
        state
    }

    fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            limits: self.limits,
            usage: self.usage,
            effective_parallel: self.ceiling.value(),
        }
    }

    fn parallel_limit(&self) -> u32 {
        self.ceiling.admit_limit().min(self.limits.max_parallel)
    }

    fn violations(&self, estimate: SendEstimate) -> Vec<Dimension> {
        let mut violations = Vec::new();
        if self.usage.tokens_used.saturating_add(estimate.tokens) > self.limits.max_tokens {
            violations.push(Dimension::Tokens);
        }
        if self.usage.usd_used + estimate.usd > self.limits.max_usd + USD_EPSILON {
            violations.push(Dimension::Usd);
        }
        if self.usage.in_flight >= self.parallel_limit() {
            violations.push(Dimension::Parallel);
        }
        violations
    }

    fn settle(&mut self, reserved: SendEstimate, actual: SendEstimate) {
        self.usage.in_flight = self.usage.in_flight.saturating_sub(1);
        self.usage.tokens_used = self
            .usage
            .tokens_used
            .saturating_sub(reserved.tokens)
            .saturating_add(actual.tokens);
        self.usage.usd_used = (self.usage.usd_used - reserved.usd + actual.usd).max(0.0);
    }
}

// =============================================================================
// Governor
// =============================================================================

/// Admission controller for every open stream
pub struct WindowGovernor {
    config: GovernorConfig,
    windows: DashMap<StreamKey, WindowState>,
    next_ticket: AtomicU64,
    updates: Option<mpsc::UnboundedSender<WindowUpdate>>,
}

impl fmt::Debug for WindowGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowGovernor")
            .field("config", &self.config)
            .field("windows", &self.windows.len())
            .finish()
    }
}

impl Default for WindowGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl WindowGovernor {
    /// Governor without an update channel
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            updates: None,
        }
    }

    /// Governor that publishes window updates on `updates`
    #[must_use]
    pub fn with_updates(config: GovernorConfig, updates: mpsc::UnboundedSender<WindowUpdate>) -> Self {
        Self {
            updates: Some(updates),
            ..Self::new(config)
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Register a window; an existing window is left untouched
    pub fn open(&self, key: &StreamKey, limits: WindowLimits) -> WindowSnapshot {
        let entry = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| WindowState::new(limits, Instant::now()));
        debug!(stream = %key, ?limits, "Window opened");
        entry.snapshot()
    }

    /// Whether a window exists
    #[must_use]
    pub fn contains(&self, key: &StreamKey) -> bool {
        self.windows.contains_key(key)
    }

    /// Current window
    #[must_use]
    pub fn snapshot(&self, key: &StreamKey) -> Option<WindowSnapshot> {
        self.windows.get(key).map(|w| w.snapshot())
    }

    /// Pure admission check
    #[must_use]
    pub fn admit(&self, key: &StreamKey, estimate: SendEstimate) -> bool {
        self.windows
            .get(key)
            .is_some_and(|w| w.violations(estimate).is_empty())
    }

    /// Check and reserve atomically
    ///
    /// # Errors
    ///
    /// `WindowExceeded` when any dimension would overflow,
    /// `BudgetExhausted` when the token or USD ceiling cannot fit the send
    /// even with nothing in flight, `UnknownStream` without a window.
    pub fn try_admit(&self, key: &StreamKey, estimate: SendEstimate) -> Result<SendTicket, GovernorError> {
        let update = {
            let mut window = self
                .windows
                .get_mut(key)
                .ok_or_else(|| GovernorError::UnknownStream(key.clone()))?;

            let violations = window.violations(estimate);
            if let Some(&dimension) = violations.first() {
                let snapshot = window.snapshot();
                if window.usage.in_flight == 0 && dimension != Dimension::Parallel {
                    return Err(GovernorError::BudgetExhausted {
                        key: key.clone(),
                        dimension,
                        snapshot,
                    });
                }
                trace!(stream = %key, %dimension, "Admission refused");
                return Err(GovernorError::WindowExceeded {
                    key: key.clone(),
                    dimension,
                    violations,
                    snapshot,
                });
            }

            let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            window.usage.in_flight += 1;
            window.usage.tokens_used = window.usage.tokens_used.saturating_add(estimate.tokens);
            window.usage.usd_used += estimate.usd;
            window.outstanding.insert(id, estimate);

            let ticket = SendTicket {
                key: key.clone(),
                id,
                estimate,
            };
            (ticket, self.threshold_update(key, &mut window))
        };
        let (ticket, update) = update;
        self.publish(update);
        Ok(ticket)
    }

    /// Reserve for a send previously checked with [`admit`](Self::admit)
    ///
    /// Re-validates under the window lock; another sender may have taken the
    /// capacity in between.
    pub fn on_send(&self, key: &StreamKey, estimate: SendEstimate) -> Result<SendTicket, GovernorError> {
        self.try_admit(key, estimate)
    }

    /// Admit, waiting up to the configured admission timeout for capacity
    pub async fn admit_within(
        &self,
        key: &StreamKey,
        estimate: SendEstimate,
    ) -> Result<SendTicket, GovernorError> {
        self.admit_before(key, estimate, self.config.admission_timeout)
            .await
    }

    /// Admit, waiting up to `timeout` for capacity
    pub async fn admit_before(
        &self,
        key: &StreamKey,
        estimate: SendEstimate,
        timeout: Duration,
    ) -> Result<SendTicket, GovernorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = self
                .windows
                .get(key)
                .map(|w| w.notify.clone())
                .ok_or_else(|| GovernorError::UnknownStream(key.clone()))?;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_admit(key, estimate) {
                Err(GovernorError::WindowExceeded { .. }) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_admit(key, estimate);
                    }
                }
                other => return other,
            }
        }
    }

    /// Settle a send with its actual consumption
    ///
    /// `success` drives the AIMD ceiling: additive increase on success,
    /// multiplicative decrease on failure.
    pub fn on_ack(
        &self,
        ticket: &SendTicket,
        actual: SendEstimate,
        success: bool,
    ) -> Result<WindowSnapshot, GovernorError> {
        let (snapshot, update) = {
            let mut window = self
                .windows
                .get_mut(&ticket.key)
                .ok_or(GovernorError::UnknownTicket(ticket.id))?;
            let reserved = window
                .outstanding
                .remove(&ticket.id)
                .ok_or(GovernorError::UnknownTicket(ticket.id))?;
            window.settle(reserved, actual);
            let aimd = self.config.aimd;
            if success {
                window.ceiling.on_success(&aimd);
            } else {
                window.ceiling.on_failure(&aimd);
            }
            window.notify.notify_waiters();
            (window.snapshot(), self.threshold_update(&ticket.key, &mut window))
        };
        self.publish(update);
        Ok(snapshot)
    }

    /// Settle a send whose adapter call timed out
    ///
    /// Frees the parallel slot, keeps the reserved estimate charged, and
    /// takes the multiplicative-decrease path.
    pub fn on_timeout(&self, ticket: &SendTicket) -> Result<WindowSnapshot, GovernorError> {
        let (snapshot, update) = {
            let mut window = self
                .windows
                .get_mut(&ticket.key)
                .ok_or(GovernorError::UnknownTicket(ticket.id))?;
            let reserved = window
                .outstanding
                .remove(&ticket.id)
                .ok_or(GovernorError::UnknownTicket(ticket.id))?;
            window.settle(reserved, reserved);
            let aimd = self.config.aimd;
            window.ceiling.on_failure(&aimd);
            window.notify.notify_waiters();
            debug!(stream = %ticket.key, ceiling = window.ceiling.value(), "Send timed out");
            (window.snapshot(), self.threshold_update(&ticket.key, &mut window))
        };
        self.publish(update);
        Ok(snapshot)
    }

    /// Replace the limits of a live window
    pub fn update_limits(&self, key: &StreamKey, limits: WindowLimits) -> Result<WindowSnapshot, GovernorError> {
        let (snapshot, update) = {
            let mut window = self
                .windows
                .get_mut(key)
                .ok_or_else(|| GovernorError::UnknownStream(key.clone()))?;
            window.limits = limits;
            window.ceiling.set_max(limits.max_parallel);
            window.notify.notify_waiters();
            debug!(stream = %key, ?limits, "Window limits updated");
            (window.snapshot(), self.force_update(key, &mut window, Instant::now()))
        };
        self.publish(Some(update));
        Ok(snapshot)
    }

    /// Drop a window and everything reserved against it
    pub fn release(&self, key: &StreamKey) -> Option<WindowSnapshot> {
        let (_, window) = self.windows.remove(key)?;
        window.notify.notify_waiters();
        debug!(stream = %key, outstanding = window.outstanding.len(), "Window released");
        Some(window.snapshot())
    }

    /// Emit updates for windows whose update interval elapsed
    ///
    /// Idle windows (nothing in flight) are skipped.
    pub fn tick(&self, now: Instant) -> Vec<WindowUpdate> {
        let mut updates = Vec::new();
        for mut entry in self.windows.iter_mut() {
            let due = now.saturating_duration_since(entry.last_emit_at) >= self.config.update_interval;
            if due && entry.usage.in_flight > 0 {
                let key = entry.key().clone();
                updates.push(self.force_update(&key, entry.value_mut(), now));
            }
        }
        for update in &updates {
            self.publish(Some(update.clone()));
        }
        updates
    }

    /// Mean parallel utilisation across open windows (0.0 - 1.0)
    #[must_use]
    pub fn saturation(&self) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for window in self.windows.iter() {
            let limit = window.parallel_limit().max(1);
            total += (f64::from(window.usage.in_flight) / f64::from(limit)).min(1.0);
            count += 1;
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    /// Number of open windows
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no window is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn threshold_update(&self, key: &StreamKey, window: &mut WindowState) -> Option<WindowUpdate> {
        let now = window.snapshot().remaining_fractions();
        let last = window.last_emitted;
        let threshold = self.config.update_threshold;
        let moved = (now.0 - last.0).abs() >= threshold
            || (now.1 - last.1).abs() >= threshold
            || (now.2 - last.2).abs() >= threshold;
        moved.then(|| self.force_update(key, window, Instant::now()))
    }

    fn force_update(&self, key: &StreamKey, window: &mut WindowState, now: Instant) -> WindowUpdate {
        let snapshot = window.snapshot();
        window.last_emitted = snapshot.remaining_fractions();
        window.last_emit_at = now;
        WindowUpdate {
            key: key.clone(),
            snapshot,
        }
    }

    fn publish(&self, update: Option<WindowUpdate>) {
        if let (Some(tx), Some(update)) = (&self.updates, update) {
            let _ = tx.send(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_parallel: u32, max_tokens: u64, max_usd: f64) -> WindowLimits {
        WindowLimits {
            max_parallel,
            max_tokens,
            max_usd,
        }
    }

    fn key() -> StreamKey {
        StreamKey::new("s", "a")
    }

    #[test]
    fn test_token_ceiling_reported_first() {
        let governor = WindowGovernor::default();
        governor.open(&key(), limits(1, 1000, 0.10));

        let first = governor.try_admit(&key(), SendEstimate::new(800, 0.05));
        assert!(first.is_ok());

        let err = governor
            .try_admit(&key(), SendEstimate::new(300, 0.02))
            .unwrap_err();
        match err {
            GovernorError::WindowExceeded {
                dimension,
                violations,
                snapshot,
                ..
            } => {
                assert_eq!(dimension, Dimension::Tokens);
                assert!(!violations.contains(&Dimension::Usd));
                assert_eq!(snapshot.usage.tokens_used, 800);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_admission_never_exceeds_limits() {
        let governor = WindowGovernor::default();
        let lim = limits(3, 1000, 1.0);
        governor.open(&key(), lim);

        let mut tickets = Vec::new();
        for i in 0..20u64 {
            let estimate = SendEstimate::new(50 + i * 7, 0.03);
            if let Ok(ticket) = governor.try_admit(&key(), estimate) {
                tickets.push(ticket);
            }
            let snap = governor.snapshot(&key()).unwrap();
            assert!(snap.usage.in_flight <= lim.max_parallel);
            assert!(snap.usage.tokens_used <= lim.max_tokens);
            assert!(snap.usage.usd_used <= lim.max_usd + USD_EPSILON);
            if i % 3 == 0 {
                if let Some(ticket) = tickets.pop() {
                    governor
                        .on_ack(&ticket, SendEstimate::new(10, 0.01), true)
                        .unwrap();
                }
            }
        }
    }

    #[test]
    fn test_ack_reconciles_actual_usage() {
        let governor = WindowGovernor::default();
        governor.open(&key(), limits(2, 1000, 1.0));
        let ticket = governor.try_admit(&key(), SendEstimate::new(500, 0.5)).unwrap();
        let snap = governor
            .on_ack(&ticket, SendEstimate::new(200, 0.1), true)
            .unwrap();
        assert_eq!(snap.usage.in_flight, 0);
        assert_eq!(snap.usage.tokens_used, 200);
        assert!((snap.usage.usd_used - 0.1).abs() < 1e-9);
        assert!(matches!(
            governor.on_ack(&ticket, SendEstimate::default(), true),
            Err(GovernorError::UnknownTicket(_))
        ));
    }

    #[test]
    fn test_timeout_keeps_estimate_and_shrinks_ceiling() {
        let governor = WindowGovernor::default();
        governor.open(&key(), limits(4, 1000, 1.0));
        let ticket = governor.try_admit(&key(), SendEstimate::new(100, 0.1)).unwrap();
        let snap = governor.on_timeout(&ticket).unwrap();
        assert_eq!(snap.usage.in_flight, 0);
        assert_eq!(snap.usage.tokens_used, 100);
        assert_eq!(snap.effective_parallel, 2.0);
    }

    #[test]
    fn test_aimd_ceiling_gates_parallelism() {
        let governor = WindowGovernor::default();
        governor.open(&key(), limits(4, 10_000, 10.0));
        let t = governor.try_admit(&key(), SendEstimate::new(1, 0.0)).unwrap();
        governor.on_timeout(&t).unwrap();
        let t = governor.try_admit(&key(), SendEstimate::new(1, 0.0)).unwrap();
        governor.on_timeout(&t).unwrap();
        // ceiling 1.0 now
        let _held = governor.try_admit(&key(), SendEstimate::new(1, 0.0)).unwrap();
        let err = governor.try_admit(&key(), SendEstimate::new(1, 0.0)).unwrap_err();
        assert!(matches!(
            err,
            GovernorError::WindowExceeded {
                dimension: Dimension::Parallel,
                ..
            }
        ));
    }

    #[test]
    fn test_budget_exhausted_when_idle() {
        let governor = WindowGovernor::default();
        governor.open(&key(), limits(2, 100, 1.0));
        let err = governor.try_admit(&key(), SendEstimate::new(500, 0.0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BudgetExhausted);
    }

    #[test]
    fn test_threshold_updates_published() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let governor = WindowGovernor::with_updates(GovernorConfig::default(), tx);
        governor.open(&key(), limits(10, 1000, 1.0));

        // 10% of tokens: below threshold
        let small = governor.try_admit(&key(), SendEstimate::new(100, 0.0)).unwrap();
        assert!(rx.try_recv().is_err());

        // another 20% of tokens: crosses threshold
        let _big = governor.try_admit(&key(), SendEstimate::new(200, 0.0)).unwrap();
        let update = rx.try_recv().unwrap();
        assert_eq!(update.snapshot.usage.tokens_used, 300);

        governor.on_ack(&small, SendEstimate::new(100, 0.0), true).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_tick_emits_after_interval() {
        let governor = WindowGovernor::default();
        governor.open(&key(), limits(4, 1000, 1.0));
        let _ticket = governor.try_admit(&key(), SendEstimate::new(1, 0.0)).unwrap();
        assert!(governor.tick(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(governor.tick(later).len(), 1);
    }

    #[test]
    fn test_update_limits_and_saturation() {
        let governor = WindowGovernor::default();
        governor.open(&key(), limits(2, 1000, 1.0));
        let _t = governor.try_admit(&key(), SendEstimate::new(1, 0.0)).unwrap();
        assert!((governor.saturation() - 0.5).abs() < 1e-9);

        governor.update_limits(&key(), limits(1, 1000, 1.0)).unwrap();
        assert!((governor.saturation() - 1.0).abs() < 1e-9);
        assert!(!governor.admit(&key(), SendEstimate::new(1, 0.0)));

        assert!(governor.release(&key()).is_some());
        assert_eq!(governor.saturation(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_within_waits_for_capacity() {
        let governor = Arc::new(WindowGovernor::default());
        governor.open(&key(), limits(1, 1000, 1.0));
        let held = governor.try_admit(&key(), SendEstimate::new(10, 0.0)).unwrap();

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move {
                governor
                    .admit_before(&key(), SendEstimate::new(10, 0.0), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        governor.on_ack(&held, SendEstimate::new(10, 0.0), true).unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_within_times_out() {
        let governor = WindowGovernor::default();
        governor.open(&key(), limits(1, 1000, 1.0));
        let _held = governor.try_admit(&key(), SendEstimate::new(10, 0.0)).unwrap();
        let err = governor
            .admit_within(&key(), SendEstimate::new(10, 0.0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::WindowExceeded);
    }
}
