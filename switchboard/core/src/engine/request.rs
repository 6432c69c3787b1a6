//! Request pipeline
//!
//! Select, fan out, reconcile, escalate, deliver. Runs as one task per
//! stream; aborting the task cancels the adapter calls it owns.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EngineError, Inner, PendingRequest};
use crate::adapter::{AdapterChunk, AdapterRequest};
use crate::consensus::{jaccard, tokenize, ConsensusError, ConsensusResult, Contribution};
use crate::protocol::{AdapterId, Frame, Payload, StreamKey};
use crate::routing::{CallOutcome, Feedback, Plan, PlanEntry, TaskClass};
use crate::scheduler::Scheduled;
use crate::session::{fragment_message, StreamUsage};
use crate::telemetry::StreamOutcome;
use crate::window::{GovernorError, SendEstimate, SendTicket};

/// What the telemetry record needs from a delivered result
pub(super) struct Delivered {
    pub(super) adapter: AdapterId,
    pub(super) model: Option<String>,
    pub(super) agreement: f64,
    pub(super) escalated: bool,
}

/// Why one adapter call produced nothing
#[derive(Debug)]
enum CallFailure {
    Admission(GovernorError),
    Timeout(Duration),
    Adapter(String),
    Unavailable,
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admission(e) => write!(f, "admission: {e}"),
            Self::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            Self::Adapter(message) => write!(f, "adapter error: {message}"),
            Self::Unavailable => f.write_str("adapter not registered"),
        }
    }
}

impl CallFailure {
    /// Whether another adapter might succeed where this call failed
    ///
    /// Admission failures share the stream's window with any replacement.
    fn warrants_reselection(&self) -> bool {
        !matches!(self, Self::Admission(_))
    }
}

struct CallResult {
    entry: PlanEntry,
    latency: Duration,
    outcome: Result<Contribution, CallFailure>,
}

/// Decrements the active-request gauge even when the task is aborted
struct ActiveGuard<'a>(&'a Inner);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.metrics.active_requests.dec();
    }
}

impl Inner {
    pub(super) async fn serve(self: Arc<Self>, scheduled: Scheduled<PendingRequest>) {
        self.metrics
            .queue_wait
            .record(scheduled.waited().as_millis() as f64);
        self.metrics.active_requests.inc();
        let _active = ActiveGuard(&self);

        let key = scheduled.key;
        let pending = scheduled.item;
        let started = Instant::now();
        let result = self.run(&key, &pending).await;
        self.metrics
            .request_latency
            .record(started.elapsed().as_millis() as f64);

        match result {
            Ok(result) => self.deliver(&key, pending.message_seq, result).await,
            Err(err) => self.fail(&key, pending.message_seq, &err),
        }
        self.requests.remove(&key);
    }

    fn adapter_request(&self, key: &StreamKey, pending: &PendingRequest) -> AdapterRequest {
        let metadata = &pending.metadata;
        let mut request = AdapterRequest::new(key.clone(), pending.content.clone())
            .with_task_class(metadata.task_class.unwrap_or_default())
            .with_risk(metadata.risk.unwrap_or_default());
        request.message_seq = pending.message_seq;
        request.trace_id = Some(
            metadata
                .trace_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        );
        request
    }

    async fn run(
        self: &Arc<Self>,
        key: &StreamKey,
        pending: &PendingRequest,
    ) -> Result<ConsensusResult, EngineError> {
        let request = Arc::new(self.adapter_request(key, pending));
        let task = request.task_class;
        let plan = self.selector.select(&request, &self.registry, &[]).await?;
        info!(
            stream = %key,
            task = %task,
            rule = %plan.rule,
            strategy = plan.strategy.name(),
            trace_id = request.trace_id.as_deref(),
            "Request routed"
        );

        let mut budget = self.consensus.budget();
        let fan_out: Vec<PlanEntry> = plan.fan_out().cloned().collect();
        let mut calls = self.call_all(&request, fan_out).await;

        // Replace failed calls while the escalation budget allows
        let failed = calls
            .iter()
            .filter(|c| matches!(&c.outcome, Err(failure) if failure.warrants_reselection()))
            .count();
        for _ in 0..failed {
            if !budget.try_consume() {
                break;
            }
            let used = used_adapters(&calls);
            let Some(entry) = self.replacement(&plan, &request, &used).await else {
                break;
            };
            debug!(stream = %key, adapter = %entry.adapter, "Re-selecting after failed call");
            calls.extend(self.call_all(&request, vec![entry]).await);
        }

        let contributions = self.contributions(&calls);
        if contributions.is_empty() {
            self.record_feedback(task, &calls, None).await;
            return Err(no_result(&calls));
        }
        let mut result = self.consensus.reconcile(&plan.strategy, &contributions)?;

        if let Some(trigger) = self.consensus.evaluate(&result) {
            if budget.try_consume() {
                let used = used_adapters(&calls);
                match self.replacement(&plan, &request, &used).await {
                    Some(entry) => {
                        self.metrics.escalations.inc();
                        info!(stream = %key, adapter = %entry.adapter, %trigger, "Escalating");
                        calls.extend(self.call_all(&request, vec![entry]).await);
                        let contributions = self.contributions(&calls);
                        result = self.consensus.reconcile(&plan.strategy, &contributions)?;
                        result.escalated = true;
                    }
                    None => {
                        debug!(stream = %key, %trigger, "No adapter left to escalate to");
                    }
                }
            } else {
                debug!(stream = %key, %trigger, "Escalation budget spent, delivering as is");
            }
        }

        self.record_feedback(task, &calls, Some(&result)).await;
        Ok(result)
    }

    /// Next adapter to try: plan fallbacks first, then a fresh selection
    async fn replacement(
        &self,
        plan: &Plan,
        request: &AdapterRequest,
        used: &[AdapterId],
    ) -> Option<PlanEntry> {
        if let Some(entry) = plan.next_fallback(used) {
            return Some(entry.clone());
        }
        match self.selector.select(request, &self.registry, used).await {
            Ok(fresh) => fresh.primary().cloned(),
            Err(e) => {
                debug!(stream = %request.stream, error = %e, "No replacement adapter");
                None
            }
        }
    }

    async fn call_all(self: &Arc<Self>, request: &Arc<AdapterRequest>, entries: Vec<PlanEntry>) -> Vec<CallResult> {
        let mut set = JoinSet::new();
        for entry in entries {
            let inner = Arc::clone(self);
            let request = Arc::clone(request);
            set.spawn(async move { inner.call(&request, entry).await });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Adapter call task failed"),
            }
        }
        results
    }

    async fn call(&self, request: &AdapterRequest, entry: PlanEntry) -> CallResult {
        let started = Instant::now();
        let outcome = self.try_call(request, &entry).await;
        CallResult {
            entry,
            latency: started.elapsed(),
            outcome,
        }
    }

    async fn try_call(&self, request: &AdapterRequest, entry: &PlanEntry) -> Result<Contribution, CallFailure> {
        let key = &request.stream;
        let Some(adapter) = self.registry.get(&entry.adapter) else {
            return Err(CallFailure::Unavailable);
        };

        let ticket = match self.governor.admit_within(key, entry.estimate.to_send()).await {
            Ok(ticket) => {
                self.metrics.admissions.inc();
                ticket
            }
            Err(e) => {
                self.metrics.rejections.inc();
                debug!(stream = %key, adapter = %entry.adapter, error = %e, "Call not admitted");
                return Err(CallFailure::Admission(e));
            }
        };

        let deadline = self
            .config
            .adapter_timeout
            .unwrap_or_else(|| request.task_class.default_timeout());
        let started = Instant::now();
        let collected = tokio::time::timeout(deadline, async {
            let mut rx = adapter
                .stream(request)
                .await
                .map_err(|e| (CallFailure::Adapter(e.to_string()), Collected::default()))?;
            let mut answer = Collected::default();
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    AdapterChunk::Partial {
                        content,
                        confidence,
                        partial_cost,
                        tokens,
                    } => {
                        answer.content.push_str(&content);
                        answer.confidence = confidence;
                        answer.usd += partial_cost;
                        answer.tokens += tokens;
                    }
                    AdapterChunk::ValidationFailed { reason } => answer.validation = Some(reason),
                    AdapterChunk::Error(message) => return Err((CallFailure::Adapter(message), answer)),
                }
            }
            Ok(answer)
        })
        .await;

        match collected {
            Err(_elapsed) => {
                self.metrics.adapter_timeouts.inc();
                if let Err(e) = self.governor.on_timeout(&ticket) {
                    debug!(stream = %key, error = %e, "Timeout on a released window");
                }
                warn!(stream = %key, adapter = %entry.adapter, timeout_ms = deadline.as_millis() as u64, "Adapter call timed out");
                Err(CallFailure::Timeout(deadline))
            }
            Ok(Err((failure, partial))) => {
                self.settle(request, &ticket, &partial, false);
                warn!(stream = %key, adapter = %entry.adapter, error = %failure, "Adapter call failed");
                Err(failure)
            }
            Ok(Ok(answer)) => {
                self.settle(request, &ticket, &answer, true);
                self.sessions.touch(key);
                let win_rate = self
                    .selector
                    .table()
                    .get(&entry.adapter)
                    .await
                    .map_or(0.0, |e| e.win_rate());
                let mut contribution = Contribution::new(entry.adapter.clone(), answer.content, answer.confidence)
                    .with_cost(answer.usd, answer.tokens)
                    .with_win_rate(win_rate);
                contribution.latency = started.elapsed();
                if let Some(reason) = answer.validation {
                    contribution = contribution.with_validation_failure(reason);
                }
                Ok(contribution)
            }
        }
    }

    /// Settle a ticket with what the call consumed and bill the stream
    fn settle(&self, request: &AdapterRequest, ticket: &SendTicket, used: &Collected, success: bool) {
        let key = &request.stream;
        if let Err(e) = self
            .governor
            .on_ack(ticket, SendEstimate::new(used.tokens, used.usd), success)
        {
            debug!(stream = %key, error = %e, "Ack on a released window");
        }
        let tokens_in = request.size_tokens().min(used.tokens);
        let usage = StreamUsage {
            tokens_in,
            tokens_out: used.tokens - tokens_in,
            usd: used.usd,
        };
        if let Err(e) = self.sessions.record_usage(key, usage) {
            debug!(stream = %key, error = %e, "Usage for an ended stream");
        }
    }

    fn contributions(&self, calls: &[CallResult]) -> Vec<Contribution> {
        calls
            .iter()
            .filter_map(|c| c.outcome.as_ref().ok().cloned())
            .collect()
    }

    async fn record_feedback(&self, task: TaskClass, calls: &[CallResult], result: Option<&ConsensusResult>) {
        let answer_tokens = result.map(|r| tokenize(&r.answer));
        for call in calls {
            let feedback = match (&call.outcome, result, &answer_tokens) {
                (Ok(contribution), Some(result), Some(answer_tokens)) => Feedback {
                    call: CallOutcome::success(call.latency, contribution.adapter == result.answer_adapter),
                    quality: f64::from(contribution.confidence),
                    agreement: jaccard(&tokenize(&contribution.content), answer_tokens),
                    usd: contribution.usd,
                },
                // Admission failures say nothing about the adapter
                (Err(CallFailure::Admission(_) | CallFailure::Unavailable), _, _) => continue,
                _ => Feedback {
                    call: CallOutcome::failure(call.latency),
                    quality: 0.0,
                    agreement: 0.0,
                    usd: 0.0,
                },
            };
            self.selector.record_outcome(task, &call.entry, &feedback).await;
        }
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    async fn deliver(&self, key: &StreamKey, message_seq: u64, result: ConsensusResult) {
        let mut close = Frame::close(key, message_seq);
        close.payload = Payload::Result(result.to_envelope());
        if let Err(e) = self.sessions.finish(key, close.clone()) {
            debug!(stream = %key, error = %e, "Result for an ended stream dropped");
            return;
        }

        for frame in fragment_message(key, message_seq, &result.answer, self.config.session.max_fragment_bytes) {
            self.send(frame);
        }
        self.send(close);

        self.metrics.streams_completed.inc();
        info!(
            stream = %key,
            adapter = %result.answer_adapter,
            agreement = result.agreement,
            confidence = result.confidence,
            escalated = result.escalated,
            "Result delivered"
        );
        let model = self
            .registry
            .get(&result.answer_adapter)
            .map(|a| a.capabilities().model)
            .filter(|m| !m.is_empty());
        let delivered = Delivered {
            adapter: result.answer_adapter.clone(),
            model,
            agreement: result.agreement,
            escalated: result.escalated,
        };
        self.record_telemetry(key, Some(delivered), StreamOutcome::Completed);
    }

    fn fail(&self, key: &StreamKey, message_seq: u64, err: &EngineError) {
        let report = err.report(message_seq);
        if report.recoverable {
            // Client may resend once the window reopens
            if let Err(e) = self.sessions.reset_to_admitted(key) {
                debug!(stream = %key, error = %e, "Stream not resettable");
            }
            warn!(stream = %key, code = %report.code, "Recoverable request failure");
            self.send(Frame::error(key, message_seq, report));
        } else {
            // The task is finishing on its own; only the slot needs clearing
            self.requests.remove(key);
            self.abort_stream(key, report);
        }
    }
}

#[derive(Debug, Default)]
struct Collected {
    content: String,
    confidence: f32,
    usd: f64,
    tokens: u64,
    validation: Option<String>,
}

fn used_adapters(calls: &[CallResult]) -> Vec<AdapterId> {
    calls.iter().map(|c| c.entry.adapter.clone()).collect()
}

/// Error for a request where every call failed
fn no_result(calls: &[CallResult]) -> EngineError {
    let admission = calls.iter().find_map(|c| match &c.outcome {
        Err(CallFailure::Admission(e)) => Some(e.clone()),
        _ => None,
    });
    let all_admission = calls
        .iter()
        .all(|c| matches!(c.outcome, Err(CallFailure::Admission(_))));
    if let (true, Some(e)) = (all_admission, admission) {
        return EngineError::Admission(e);
    }
    let reason = calls
        .iter()
        .filter_map(|c| match &c.outcome {
            Err(failure) => Some(format!("{}: {failure}", c.entry.adapter)),
            Ok(_) => None,
        })
        .collect::<Vec<_>>()
        .join("; ");
    EngineError::Consensus(ConsensusError::NoConsensus { reason })
}
