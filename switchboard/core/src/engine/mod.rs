//! Switchboard Engine
//!
//! Wires the session manager, window governor, QoS scheduler, adapter
//! selection and consensus into one routing engine.
//!
//! # Architecture
//!
//! ```text
//!  inbound Frame
//!       |
//!       v
//!  SessionManager --Message--> QosScheduler --dispatcher--> request task
//!       |                                                       |
//!       | Reply / Aborted / Control                  Selector -> Plan
//!       v                                                       |
//!  Outbound channel <-- data + CLOSE / ERROR+ABORT <-- fan-out (JoinSet)
//!       ^                                                       |
//!       +----------- WINDOW_UPDATE <-- WindowGovernor    ConsensusEngine
//! ```
//!
//! # Design Principles
//!
//! - The session manager is the only owner of stream state; the engine
//!   reacts to the events it returns
//! - One request per stream: the first completed message is served and its
//!   final result closes the stream
//! - Every stream ends with a final result or a terminal error frame
//! - Aborting a stream aborts its request task, which drops the `JoinSet`
//!   holding the adapter calls

mod request;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, AdapterRegistry, ScriptedAdapter};
use crate::config::SwitchboardConfig;
use crate::consensus::{ConsensusEngine, ConsensusError, EscalationConfig};
use crate::protocol::{
    ControlMessage, ErrorCode, ErrorReport, Frame, FrameMetadata, PriorityTier, SessionId,
    StreamKey, WindowSnapshot,
};
use crate::routing::metrics::{EngineMetrics, EngineMetricsSummary};
use crate::routing::{
    HealthConfig, PolicyRule, PolicySet, RoutingError, RoutingTable, SelectionConfig, Selector,
};
use crate::scheduler::{QosScheduler, Scheduled, SchedulerConfig, SchedulerError, SchedulerStats};
use crate::session::{SessionConfig, SessionError, SessionEvent, SessionManager};
use crate::telemetry::{StreamOutcome, TelemetryRecord, TelemetrySink};
use crate::window::{GovernorConfig, GovernorError, WindowGovernor, WindowUpdate};

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Session manager
    pub session: SessionConfig,
    /// Window governor
    pub governor: GovernorConfig,
    /// QoS scheduler
    pub scheduler: SchedulerConfig,
    /// Adapter selection
    pub selection: SelectionConfig,
    /// Routing table health
    pub health: HealthConfig,
    /// Consensus and escalation
    pub escalation: EscalationConfig,
    /// Initial policy rules
    pub rules: Vec<PolicyRule>,
    /// How often the maintenance task runs
    pub maintenance_interval: Duration,
    /// How often adapters are asked for health reports
    pub health_poll_interval: Duration,
    /// Per-call deadline; `None` uses the task class default
    pub adapter_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            governor: GovernorConfig::default(),
            scheduler: SchedulerConfig::default(),
            selection: SelectionConfig::default(),
            health: HealthConfig::default(),
            escalation: EscalationConfig::default(),
            rules: Vec::new(),
            maintenance_interval: Duration::from_millis(250),
            health_poll_interval: Duration::from_secs(5),
            adapter_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Set the policy rules
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<PolicyRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Set the per-call adapter deadline
    #[must_use]
    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = Some(timeout);
        self
    }

    /// Set the escalation configuration
    #[must_use]
    pub fn with_escalation(mut self, escalation: EscalationConfig) -> Self {
        self.escalation = escalation;
        self
    }

    /// Set the session configuration
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

impl From<&SwitchboardConfig> for EngineConfig {
    fn from(config: &SwitchboardConfig) -> Self {
        Self {
            session: config.session.clone(),
            governor: config.governor.clone(),
            scheduler: config.scheduler.clone(),
            selection: config.selection.clone(),
            health: config.health.clone(),
            escalation: config.escalation.clone(),
            rules: config.rules.clone(),
            maintenance_interval: config.maintenance_interval,
            health_poll_interval: config.health_poll_interval,
            adapter_timeout: config.adapter_timeout,
        }
    }
}

// =============================================================================
// Errors and outbound frames
// =============================================================================

/// Why a request could not produce a result
#[derive(Debug, Error)]
pub enum EngineError {
    /// Selection failed
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Reconciliation failed
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Admission failed
    #[error(transparent)]
    Admission(#[from] GovernorError),

    /// Scheduling failed
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Stream state rejected the operation
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl EngineError {
    /// Wire code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Routing(e) => e.code(),
            Self::Consensus(e) => e.code(),
            Self::Admission(e) => e.code(),
            Self::Scheduler(e) => e.code(),
            Self::Session(e) => e.code(),
        }
    }

    /// Window snapshot for admission failures
    #[must_use]
    pub fn snapshot(&self) -> Option<WindowSnapshot> {
        match self {
            Self::Admission(e) => e.snapshot(),
            _ => None,
        }
    }

    /// Structured report for the client
    #[must_use]
    pub fn report(&self, message_seq: u64) -> ErrorReport {
        let mut report = ErrorReport::new(self.code(), self.to_string()).with_message(message_seq);
        if let Some(snapshot) = self.snapshot() {
            report = report.with_window(snapshot);
        }
        report
    }
}

/// Frame leaving the engine for a session
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    /// Session the frame belongs to
    pub session: SessionId,
    /// The frame
    pub frame: Frame,
}

// =============================================================================
// Engine
// =============================================================================

/// One request waiting in the scheduler
#[derive(Clone, Debug)]
pub(crate) struct PendingRequest {
    message_seq: u64,
    content: String,
    metadata: FrameMetadata,
}

enum RequestSlot {
    Queued,
    Running(AbortHandle),
}

struct Inner {
    config: EngineConfig,
    sessions: SessionManager,
    governor: Arc<WindowGovernor>,
    scheduler: QosScheduler<PendingRequest>,
    selector: Selector,
    registry: Arc<AdapterRegistry>,
    consensus: ConsensusEngine,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: EngineMetrics,
    outbound: mpsc::UnboundedSender<Outbound>,
    requests: DashMap<StreamKey, RequestSlot>,
}

/// The routing and flow-control engine
///
/// Feed decoded frames to [`handle_frame`](Self::handle_frame); every frame
/// for the client comes out of the outbound channel given to
/// [`new`](Self::new). Call [`start`](Self::start) inside a Tokio runtime
/// before feeding frames.
pub struct Switchboard {
    inner: Arc<Inner>,
    updates: Mutex<Option<mpsc::UnboundedReceiver<WindowUpdate>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchboard")
            .field("sessions", &self.inner.sessions.session_count())
            .field("queued", &self.inner.scheduler.len())
            .field("adapters", &self.inner.registry.len())
            .finish()
    }
}

impl Switchboard {
    /// Create an engine over `registry`, emitting frames on `outbound`
    pub fn new(
        config: EngineConfig,
        registry: Arc<AdapterRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let governor = Arc::new(WindowGovernor::with_updates(
            config.governor.clone(),
            updates_tx,
        ));
        let sessions = SessionManager::new(config.session.clone(), Arc::clone(&governor));
        let table = Arc::new(RoutingTable::new(config.health.clone()));
        let selector = Selector::new(
            config.selection.clone(),
            table,
            PolicySet::new(config.rules.clone()),
        );
        let inner = Inner {
            sessions,
            scheduler: QosScheduler::new(config.scheduler.clone()),
            consensus: ConsensusEngine::new(config.escalation.clone()),
            governor,
            selector,
            registry,
            telemetry,
            metrics: EngineMetrics::new(),
            outbound,
            requests: DashMap::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
            updates: Mutex::new(Some(updates_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build an engine from loaded configuration, registering the scripted
    /// adapters it declares
    pub async fn from_config(
        config: &SwitchboardConfig,
        telemetry: Arc<dyn TelemetrySink>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let engine = Self::new(
            EngineConfig::from(config),
            Arc::new(AdapterRegistry::new()),
            telemetry,
            outbound,
        );
        for adapter in &config.adapters {
            engine
                .register_adapter(Arc::new(ScriptedAdapter::from_config(adapter)))
                .await;
        }
        engine
    }

    /// Register an adapter and advertise its capabilities in the routing table
    pub async fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        let id = adapter.id().clone();
        let capabilities = adapter.capabilities();
        self.inner.registry.register(adapter);
        self.inner.selector.table().advertise(id, capabilities).await;
    }

    /// Spawn the dispatcher, maintenance and window-update tasks
    ///
    /// Calling it twice has no effect.
    pub fn start(&self) {
        let Some(updates) = self.updates.lock().take() else {
            return;
        };
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(&self.inner).dispatch_loop()));
        tasks.push(tokio::spawn(Arc::clone(&self.inner).maintenance_loop()));
        tasks.push(tokio::spawn(Arc::clone(&self.inner).forward_updates(updates)));
        info!(
            adapters = self.inner.registry.len(),
            rules = self.inner.config.rules.len(),
            "Switchboard started"
        );
    }

    /// Stop background tasks and cancel every running request
    pub fn shutdown(&self) {
        self.inner.scheduler.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let keys: Vec<StreamKey> = self.inner.requests.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.inner.cancel(&key);
        }
        info!("Switchboard stopped");
    }

    /// Handle one decoded inbound frame
    pub async fn handle_frame(&self, frame: Frame) {
        let events = self.inner.sessions.handle_frame(frame);
        for event in events {
            self.inner.on_session_event(event).await;
        }
    }

    /// Run one maintenance pass now
    pub async fn run_maintenance(&self) {
        self.inner.maintain(Instant::now()).await;
    }

    /// Session manager
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Window governor
    #[must_use]
    pub fn governor(&self) -> &Arc<WindowGovernor> {
        &self.inner.governor
    }

    /// Adapter selector
    #[must_use]
    pub fn selector(&self) -> &Selector {
        &self.inner.selector
    }

    /// Adapter registry
    #[must_use]
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.inner.registry
    }

    /// Engine counters
    #[must_use]
    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    /// Snapshot of the engine counters
    #[must_use]
    pub fn metrics_summary(&self) -> EngineMetricsSummary {
        self.inner.metrics.summary()
    }

    /// Scheduler counters
    #[must_use]
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }
}

impl Drop for Switchboard {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// =============================================================================
// Event handling
// =============================================================================

impl Inner {
    fn send(&self, frame: Frame) {
        let session = frame.session_id.clone();
        if self.outbound.send(Outbound { session, frame }).is_err() {
            debug!("Outbound channel closed, frame dropped");
        }
    }

    async fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Opened { key, tier } => {
                self.metrics.streams_opened.inc();
                debug!(stream = %key, %tier, "Stream ready for requests");
            }
            SessionEvent::Resumed { key } => {
                debug!(stream = %key, "Stream resumed");
            }
            SessionEvent::Message {
                key,
                message_seq,
                content,
                metadata,
                tier,
            } => {
                let request = PendingRequest {
                    message_seq,
                    content,
                    metadata,
                };
                self.enqueue(key, tier, request);
            }
            SessionEvent::Control { key, control } => self.on_control(&key, control).await,
            SessionEvent::Reply(frame) => self.send(frame),
            SessionEvent::Closed { key } => {
                self.cancel(&key);
                self.record_telemetry(&key, None, StreamOutcome::Closed);
            }
            SessionEvent::Aborted { key, report } => {
                self.cancel(&key);
                self.metrics.aborts.inc();
                self.record_telemetry(&key, None, StreamOutcome::Aborted { code: report.code });
            }
        }
    }

    fn enqueue(&self, key: StreamKey, tier: PriorityTier, request: PendingRequest) {
        {
            let slot = self.requests.entry(key.clone());
            if let dashmap::mapref::entry::Entry::Occupied(_) = slot {
                debug!(stream = %key, message_seq = request.message_seq, "Stream already has a request, message ignored");
                return;
            }
            slot.insert(RequestSlot::Queued);
        }

        let message_seq = request.message_seq;
        match self.scheduler.enqueue(key.clone(), tier, request) {
            Ok(displaced) => {
                debug!(stream = %key, %tier, message_seq, "Request queued");
                if let Some(victim) = displaced {
                    self.metrics.preemptions.inc();
                    self.requests.remove(&victim.key);
                    let report = ErrorReport::new(
                        ErrorCode::Preempted,
                        format!("displaced by {tier} work"),
                    )
                    .with_message(victim.item.message_seq);
                    self.abort_stream(&victim.key, report);
                }
            }
            Err(e) => {
                self.requests.remove(&key);
                self.metrics.preemptions.inc();
                warn!(stream = %key, error = %e, "Request rejected by scheduler");
                self.abort_stream(&key, EngineError::from(e).report(message_seq));
            }
        }
        self.metrics.queue_depth.set(self.scheduler.len() as u64);
    }

    async fn on_control(&self, key: &StreamKey, control: ControlMessage) {
        match control {
            ControlMessage::CapabilityAdvertise(advert) => {
                let adapter = advert.adapter_id.clone();
                let created = self
                    .selector
                    .table()
                    .advertise(advert.adapter_id, advert.capabilities)
                    .await;
                if self.registry.get(&adapter).is_none() {
                    debug!(adapter = %adapter, "Advertised adapter has no local implementation");
                }
                info!(adapter = %adapter, created, "Capability advertisement applied");
            }
            ControlMessage::RouteUpdate { rules } => {
                info!(session = %key.session, rules = rules.len(), "Route update received");
                self.selector.replace_rules(rules).await;
            }
            ControlMessage::Error(report) => {
                warn!(stream = %key, code = %report.code, reason = %report.reason, "Client reported error");
            }
            ControlMessage::WindowUpdate(_) | ControlMessage::BudgetUpdate(_) => {
                debug!(stream = %key, "Window control ignored at this level");
            }
        }
    }

    /// Drop queued work and abort the running request of a stream
    fn cancel(&self, key: &StreamKey) {
        let removed = self.scheduler.remove_stream(key);
        if let Some((_, slot)) = self.requests.remove(key) {
            if let RequestSlot::Running(handle) = slot {
                handle.abort();
                debug!(stream = %key, "Request cancelled");
            }
        }
        if !removed.is_empty() {
            self.metrics.queue_depth.set(self.scheduler.len() as u64);
        }
    }

    /// Abort a stream from the engine side
    fn abort_stream(&self, key: &StreamKey, report: ErrorReport) {
        let code = report.code;
        self.cancel(key);
        if let Some(frame) = self.sessions.abort(key, report) {
            info!(stream = %key, %code, "Stream aborted by engine");
            self.metrics.aborts.inc();
            self.record_telemetry(key, None, StreamOutcome::Aborted { code });
            self.send(frame);
        }
    }

    fn record_telemetry(&self, key: &StreamKey, result: Option<request::Delivered>, outcome: StreamOutcome) {
        let info = self.sessions.stream_info(key);
        let usage = info.as_ref().map(|i| i.usage).unwrap_or_default();
        let latency_ms = info
            .as_ref()
            .map_or(0, |i| i.opened_at.elapsed().as_millis() as u64);
        let (adapter_id, model_used, agreement_score, escalation_occurred) = match result {
            Some(delivered) => (
                Some(delivered.adapter),
                delivered.model,
                Some(delivered.agreement),
                delivered.escalated,
            ),
            None => (None, None, None, false),
        };
        self.telemetry.record(TelemetryRecord {
            session: key.session.clone(),
            stream: key.stream.clone(),
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            usd: usage.usd,
            latency_ms,
            model_used,
            adapter_id,
            agreement_score,
            escalation_occurred,
            outcome,
            recorded_at: chrono::Utc::now(),
        });
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    async fn dispatch_loop(self: Arc<Self>) {
        while let Some(scheduled) = self.scheduler.next().await {
            self.metrics.queue_depth.set(self.scheduler.len() as u64);
            self.dispatch(scheduled);
        }
        debug!("Dispatcher stopped");
    }

    fn dispatch(self: &Arc<Self>, scheduled: Scheduled<PendingRequest>) {
        let key = scheduled.key.clone();
        let live = self
            .sessions
            .state(&key)
            .is_some_and(|state| !state.is_terminal());
        if !live {
            self.requests.remove(&key);
            debug!(stream = %key, "Dropping request for ended stream");
            return;
        }

        // Hold the slot while spawning so the task cannot clear it first
        let slot = self.requests.entry(key);
        let handle = tokio::spawn(Arc::clone(self).serve(scheduled));
        slot.insert(RequestSlot::Running(handle.abort_handle()));
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_health_poll: Option<Instant> = None;
        loop {
            interval.tick().await;
            let now = Instant::now();
            self.maintain(now).await;
            let poll_due = last_health_poll
                .map_or(true, |at| now.saturating_duration_since(at) >= self.config.health_poll_interval);
            if poll_due {
                self.poll_health().await;
                last_health_poll = Some(now);
            }
        }
    }

    async fn maintain(&self, now: Instant) {
        for event in self.sessions.sweep(now) {
            self.on_session_event(event).await;
        }

        // Published on the update channel as a side effect
        self.governor.tick(now);

        for adapter in self.selector.table().prune_unhealthy(now).await {
            info!(adapter = %adapter, "Pruned unhealthy adapter from routing table");
        }

        let congestion = self.governor.saturation();
        for shed in self.scheduler.shed(congestion) {
            self.metrics.preemptions.inc();
            self.requests.remove(&shed.key);
            let report = ErrorReport::new(
                ErrorCode::Preempted,
                format!("shed under congestion {congestion:.2}"),
            )
            .with_message(shed.item.message_seq);
            self.abort_stream(&shed.key, report);
        }
        self.metrics.queue_depth.set(self.scheduler.len() as u64);
    }

    async fn poll_health(&self) {
        let adapters = self.registry.all();
        let reports = join_all(adapters.iter().map(|adapter| adapter.health())).await;
        for (adapter, report) in adapters.iter().zip(reports) {
            self.selector.table().apply_health(adapter.id(), report).await;
        }
    }

    async fn forward_updates(self: Arc<Self>, mut updates: mpsc::UnboundedReceiver<WindowUpdate>) {
        while let Some(update) = updates.recv().await {
            let frame = Frame::control(&update.key, 0, ControlMessage::WindowUpdate(update.snapshot))
                .with_window(update.snapshot);
            self.send(frame);
        }
    }
}
