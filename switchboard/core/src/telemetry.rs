//! Telemetry
//!
//! One [`TelemetryRecord`] per finished stream, handed to a
//! [`TelemetrySink`]. What the collector does with it is not our concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::protocol::{AdapterId, ErrorCode, SessionId, StreamId};

/// How a stream ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Final result delivered
    Completed,
    /// Closed by the client before a result
    Closed,
    /// Terminal error
    Aborted {
        /// Error code sent to the client
        code: ErrorCode,
    },
}

/// Per-stream telemetry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Session
    pub session: SessionId,
    /// Stream
    pub stream: StreamId,
    /// Input tokens billed across every adapter call
    pub tokens_in: u64,
    /// Output tokens billed across every adapter call
    pub tokens_out: u64,
    /// USD spent
    pub usd: f64,
    /// Time from dispatch to final frame
    pub latency_ms: u64,
    /// Model behind the answering adapter
    pub model_used: Option<String>,
    /// Answering adapter
    pub adapter_id: Option<AdapterId>,
    /// Agreement across contributors
    pub agreement_score: Option<f64>,
    /// Whether an escalation ran
    pub escalation_occurred: bool,
    /// How the stream ended
    pub outcome: StreamOutcome,
    /// When the record was produced
    pub recorded_at: DateTime<Utc>,
}

/// Destination for telemetry records
pub trait TelemetrySink: Send + Sync {
    /// Accept one record; must not block
    fn record(&self, record: TelemetryRecord);
}

/// Sink that forwards records on a channel
#[derive(Debug, Clone)]
pub struct ChannelTelemetrySink {
    tx: mpsc::UnboundedSender<TelemetryRecord>,
}

impl ChannelTelemetrySink {
    /// Sink plus the receiving end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelTelemetrySink {
    fn record(&self, record: TelemetryRecord) {
        // Receiver gone means nobody is collecting
        let _ = self.tx.send(record);
    }
}

/// Sink that logs records through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetrySink;

impl TelemetrySink for LogTelemetrySink {
    fn record(&self, record: TelemetryRecord) {
        info!(
            target: "switchboard::telemetry",
            session = %record.session,
            stream = %record.stream,
            tokens_in = record.tokens_in,
            tokens_out = record.tokens_out,
            usd = record.usd,
            latency_ms = record.latency_ms,
            adapter = record.adapter_id.as_ref().map(AdapterId::as_str),
            model = record.model_used.as_deref(),
            agreement = record.agreement_score,
            escalated = record.escalation_occurred,
            outcome = ?record.outcome,
            "Stream finished"
        );
    }
}
