//! Frame model
//!
//! One [`Frame`] is one protocol message unit. Field order in the struct
//! definitions is the serialisation order, and every map is a `BTreeMap`, so
//! the same frame always encodes to the same bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use super::codec::PROTOCOL_VERSION;
use super::error::ErrorCode;
use super::ids::{AdapterId, SessionId, StreamId, StreamKey};
use crate::adapter::AdapterCapabilities;
use crate::routing::config::{RiskLevel, TaskClass};
use crate::routing::policy::PolicyRule;

/// Default hop budget for a new frame
pub const DEFAULT_TTL: u8 = 16;

/// Highest fragment count a single message may use
///
/// Bounds reassembly state, and keeps a full missing-fragment list well
/// inside one frame.
pub const MAX_FRAGMENTS_PER_MESSAGE: u32 = 4096;

// ============================================================================
// Flags
// ============================================================================

/// Control flag bit set
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Opens (or reopens) a stream
    pub const OPEN: Self = Self(1);
    /// Acknowledges a received frame
    pub const ACK: Self = Self(1 << 1);
    /// More fragments of this message follow
    pub const MORE: Self = Self(1 << 2);
    /// Orderly end of the stream
    pub const CLOSE: Self = Self(1 << 3);
    /// Abortive end of the stream
    pub const ABORT: Self = Self(1 << 4);
    /// Liveness signal
    pub const HEARTBEAT: Self = Self(1 << 5);
    /// Payload is a control message
    pub const CONTROL: Self = Self(1 << 6);

    const KNOWN_BITS: u8 = 0x7f;

    /// Build from raw bits, rejecting unknown bits
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits & !Self::KNOWN_BITS == 0).then_some(Self(bits))
    }

    /// Raw bits
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag in `other` is set
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Set the flags in `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Whether only known bits are set
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 & !Self::KNOWN_BITS == 0
    }
}

impl BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(FrameFlags, &str); 7] = [
            (FrameFlags::OPEN, "OPEN"),
            (FrameFlags::ACK, "ACK"),
            (FrameFlags::MORE, "MORE"),
            (FrameFlags::CLOSE, "CLOSE"),
            (FrameFlags::ABORT, "ABORT"),
            (FrameFlags::HEARTBEAT, "HEARTBEAT"),
            (FrameFlags::CONTROL, "CONTROL"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "FrameFlags(NONE)")
        } else {
            write!(f, "FrameFlags({})", set.join("|"))
        }
    }
}

// ============================================================================
// Priority
// ============================================================================

/// QoS tier governing scheduling weight and preemption order
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    /// Highest tier, never shed
    Gold,
    /// Middle tier
    #[default]
    Silver,
    /// Lowest tier, shed first
    Bronze,
}

impl PriorityTier {
    /// All tiers, highest first
    pub const ALL: [PriorityTier; 3] = [Self::Gold, Self::Silver, Self::Bronze];

    /// Queue index (0 = highest)
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Gold => 0,
            Self::Silver => 1,
            Self::Bronze => 2,
        }
    }

    /// Whether `self` outranks `other`
    #[must_use]
    pub fn outranks(self, other: Self) -> bool {
        self.index() < other.index()
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gold => write!(f, "gold"),
            Self::Silver => write!(f, "silver"),
            Self::Bronze => write!(f, "bronze"),
        }
    }
}

// ============================================================================
// Window snapshot
// ============================================================================

/// Admission ceilings for a stream
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowLimits {
    /// Maximum concurrent adapter calls
    pub max_parallel: u32,
    /// Maximum tokens (input + output) across the stream
    pub max_tokens: u64,
    /// Maximum spend in USD across the stream
    pub max_usd: f64,
}

impl Default for WindowLimits {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_tokens: 32_000,
            max_usd: 1.0,
        }
    }
}

/// Current consumption against [`WindowLimits`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowUsage {
    /// Adapter calls currently outstanding
    pub in_flight: u32,
    /// Tokens reserved or consumed
    pub tokens_used: u64,
    /// USD reserved or spent
    pub usd_used: f64,
}

/// Point-in-time view of a stream's window
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Configured ceilings
    pub limits: WindowLimits,
    /// Current consumption
    pub usage: WindowUsage,
    /// AIMD-controlled parallel ceiling (never above `limits.max_parallel`)
    pub effective_parallel: f64,
}

impl WindowSnapshot {
    /// Remaining fraction per dimension: (parallel, tokens, usd)
    #[must_use]
    pub fn remaining_fractions(&self) -> (f64, f64, f64) {
        fn frac(used: f64, max: f64) -> f64 {
            if max <= 0.0 {
                0.0
            } else {
                ((max - used) / max).clamp(0.0, 1.0)
            }
        }
        (
            frac(
                f64::from(self.usage.in_flight),
                f64::from(self.limits.max_parallel),
            ),
            frac(self.usage.tokens_used as f64, self.limits.max_tokens as f64),
            frac(self.usage.usd_used, self.limits.max_usd),
        )
    }
}

// ============================================================================
// Metadata and payload
// ============================================================================

/// Free-form frame metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Task type used for policy matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_class: Option<TaskClass>,
    /// Declared risk of the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
    /// Data-scope tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_scopes: Vec<String>,
    /// Trace id linking frames of one request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Parent span within the trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span: Option<String>,
    /// Anything else
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Payload of an `OPEN` frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Requested window ceilings
    pub limits: WindowLimits,
    /// Client's estimate of the request size in tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_tokens: Option<u64>,
}

/// Structured error carried by an `ERROR` control frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Stable code
    pub code: ErrorCode,
    /// Human-readable reason
    pub reason: String,
    /// Whether the stream survives
    pub recoverable: bool,
    /// Message the error refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_seq: Option<u64>,
    /// Fragments the receiver is missing (retransmit request)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fragments: Vec<u32>,
    /// Window at the time of the error (admission failures)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowSnapshot>,
}

impl ErrorReport {
    /// Build a report whose recoverability follows the code
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            recoverable: code.is_recoverable(),
            message_seq: None,
            missing_fragments: Vec::new(),
            window: None,
        }
    }

    /// Attach the message sequence
    #[must_use]
    pub fn with_message(mut self, seq: u64) -> Self {
        self.message_seq = Some(seq);
        self
    }

    /// Attach missing fragment indices
    #[must_use]
    pub fn with_missing(mut self, missing: Vec<u32>) -> Self {
        self.missing_fragments = missing;
        self
    }

    /// Attach a window snapshot
    #[must_use]
    pub fn with_window(mut self, window: WindowSnapshot) -> Self {
        self.window = Some(window);
        self
    }

    /// Override recoverability
    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

/// Adapter capability advertisement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityAdvert {
    /// Adapter being advertised
    pub adapter_id: AdapterId,
    /// What it can do
    pub capabilities: AdapterCapabilities,
}

/// Control sub-messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum ControlMessage {
    /// An adapter announces or refreshes its capabilities
    CapabilityAdvertise(CapabilityAdvert),
    /// Window state changed; senders may re-pace
    WindowUpdate(WindowSnapshot),
    /// Client adjusts its stream budget
    BudgetUpdate(WindowLimits),
    /// Replace the routing policy rule set
    RouteUpdate {
        /// New rules, first match wins
        rules: Vec<PolicyRule>,
    },
    /// Structured error
    Error(ErrorReport),
}

/// Per-finding provenance in a result envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FindingSummary {
    /// Finding text
    pub text: String,
    /// Confidence attached to the finding
    pub confidence: f32,
    /// Adapters that reported it
    pub provenance: Vec<AdapterId>,
}

/// Final reconciled result, sent with the closing frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Reconciliation strategy that produced the answer
    pub strategy: String,
    /// Overall confidence
    pub confidence: f32,
    /// Agreement across contributors
    pub agreement: f32,
    /// Whether an escalation ran
    pub escalated: bool,
    /// Accepted findings with provenance
    pub findings: Vec<FindingSummary>,
    /// Adapters that contributed
    pub contributors: Vec<AdapterId>,
}

/// Typed frame payload
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// No payload (acks, heartbeats, closes)
    #[default]
    Empty,
    /// Stream open request
    Open(OpenRequest),
    /// One fragment of message content
    Data {
        /// Fragment content
        content: String,
    },
    /// Final reconciled result
    Result(ResultEnvelope),
    /// Control message
    Control(ControlMessage),
}

// ============================================================================
// Frame
// ============================================================================

/// One protocol message unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version
    pub version: u8,
    /// Owning session
    pub session_id: SessionId,
    /// Stream within the session (empty = session level)
    pub stream_id: StreamId,
    /// Message sequence, strictly increasing per stream
    pub message_seq: u64,
    /// Fragment index within the message, contiguous from zero
    pub fragment_seq: u32,
    /// Control flags
    pub flags: FrameFlags,
    /// Scheduling tier
    pub priority: PriorityTier,
    /// Remaining hop budget
    pub ttl: u8,
    /// Sender's view of the window, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowSnapshot>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: FrameMetadata,
    /// Typed payload
    #[serde(default)]
    pub payload: Payload,
    /// Hex HMAC-SHA256 over the frame encoded without this field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Frame {
    /// Create an empty frame for a stream
    pub fn new(session_id: SessionId, stream_id: StreamId, message_seq: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            session_id,
            stream_id,
            message_seq,
            fragment_seq: 0,
            flags: FrameFlags::NONE,
            priority: PriorityTier::default(),
            ttl: DEFAULT_TTL,
            window: None,
            metadata: FrameMetadata::default(),
            payload: Payload::Empty,
            signature: None,
        }
    }

    /// Frame addressed to `key`
    #[must_use]
    pub fn for_stream(key: &StreamKey, message_seq: u64) -> Self {
        Self::new(key.session.clone(), key.stream.clone(), message_seq)
    }

    /// `OPEN` frame requesting `limits`
    #[must_use]
    pub fn open(key: &StreamKey, limits: WindowLimits) -> Self {
        let mut frame = Self::for_stream(key, 0);
        frame.flags = FrameFlags::OPEN;
        frame.payload = Payload::Open(OpenRequest {
            limits,
            expected_tokens: None,
        });
        frame
    }

    /// Data fragment
    pub fn data(
        key: &StreamKey,
        message_seq: u64,
        fragment_seq: u32,
        content: impl Into<String>,
        more: bool,
    ) -> Self {
        let mut frame = Self::for_stream(key, message_seq);
        frame.fragment_seq = fragment_seq;
        if more {
            frame.flags = FrameFlags::MORE;
        }
        frame.payload = Payload::Data {
            content: content.into(),
        };
        frame
    }

    /// Control frame
    #[must_use]
    pub fn control(key: &StreamKey, message_seq: u64, control: ControlMessage) -> Self {
        let mut frame = Self::for_stream(key, message_seq);
        frame.flags = FrameFlags::CONTROL;
        frame.payload = Payload::Control(control);
        frame
    }

    /// `ERROR` control frame
    #[must_use]
    pub fn error(key: &StreamKey, message_seq: u64, report: ErrorReport) -> Self {
        Self::control(key, message_seq, ControlMessage::Error(report))
    }

    /// Terminal `ERROR` + `ABORT` frame
    #[must_use]
    pub fn abort(key: &StreamKey, message_seq: u64, report: ErrorReport) -> Self {
        let mut frame = Self::error(key, message_seq, report.terminal());
        frame.flags.insert(FrameFlags::ABORT);
        frame
    }

    /// Heartbeat frame
    #[must_use]
    pub fn heartbeat(key: &StreamKey) -> Self {
        let mut frame = Self::for_stream(key, 0);
        frame.flags = FrameFlags::HEARTBEAT;
        frame
    }

    /// Acknowledgement frame
    #[must_use]
    pub fn ack(key: &StreamKey, message_seq: u64) -> Self {
        let mut frame = Self::for_stream(key, message_seq);
        frame.flags = FrameFlags::ACK;
        frame
    }

    /// Orderly close frame
    #[must_use]
    pub fn close(key: &StreamKey, message_seq: u64) -> Self {
        let mut frame = Self::for_stream(key, message_seq);
        frame.flags = FrameFlags::CLOSE;
        frame
    }

    /// Set the priority tier
    #[must_use]
    pub fn with_priority(mut self, priority: PriorityTier) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach a window snapshot
    #[must_use]
    pub fn with_window(mut self, window: WindowSnapshot) -> Self {
        self.window = Some(window);
        self
    }

    /// Add flags
    #[must_use]
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    /// Stream key of this frame
    #[must_use]
    pub fn key(&self) -> StreamKey {
        StreamKey {
            session: self.session_id.clone(),
            stream: self.stream_id.clone(),
        }
    }

    /// Shorthand for `self.flags.contains(flag)`
    #[must_use]
    pub fn has(&self, flag: FrameFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Control message, if this is a control frame
    #[must_use]
    pub fn control_message(&self) -> Option<&ControlMessage> {
        match &self.payload {
            Payload::Control(control) => Some(control),
            _ => None,
        }
    }

    /// Structural checks that serde cannot express
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.flags.is_valid() {
            return Err(format!("unknown flag bits {:#04x}", self.flags.bits()));
        }
        if self.ttl == 0 {
            return Err("ttl exhausted".to_string());
        }
        if self.session_id.as_str().is_empty() {
            return Err("empty session id".to_string());
        }
        let session_level = self.stream_id.is_session_level();
        if self.has(FrameFlags::OPEN) {
            if session_level {
                return Err("OPEN requires a stream id".to_string());
            }
            if !matches!(self.payload, Payload::Open(_)) {
                return Err("OPEN frame without open payload".to_string());
            }
        }
        if self.has(FrameFlags::CONTROL) != matches!(self.payload, Payload::Control(_)) {
            return Err("CONTROL flag and payload disagree".to_string());
        }
        if matches!(self.payload, Payload::Data { .. }) && session_level {
            return Err("data frame without stream id".to_string());
        }
        if matches!(self.payload, Payload::Data { .. })
            && self.fragment_seq >= MAX_FRAGMENTS_PER_MESSAGE
        {
            return Err(format!(
                "fragment index {} exceeds limit {}",
                self.fragment_seq, MAX_FRAGMENTS_PER_MESSAGE
            ));
        }
        let limits = match &self.payload {
            Payload::Open(open) => Some(open.limits),
            Payload::Control(ControlMessage::BudgetUpdate(limits)) => Some(*limits),
            _ => None,
        };
        if limits.is_some_and(|l| l.max_parallel == 0) {
            return Err("window limits allow no parallel calls".to_string());
        }
        if self.has(FrameFlags::MORE) && !matches!(self.payload, Payload::Data { .. }) {
            return Err("MORE set on a non-data frame".to_string());
        }
        if self.has(FrameFlags::CLOSE) && self.has(FrameFlags::ABORT) {
            return Err("CLOSE and ABORT are exclusive".to_string());
        }
        Ok(())
    }
}
