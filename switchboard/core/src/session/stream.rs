//! Stream lifecycle
//!
//! ```text
//! Opening -> Admitted -> Streaming -> Reconciling -> Closed
//!               |            ^            |   |
//!               +------------|------------+   +--> Admitted (recoverable error)
//!                            +----------------+    (pipelined message)
//! any non-terminal -> Aborted;  Aborted -> Admitted on reopen
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::reassembly::ReassemblyBuffer;
use crate::protocol::{Frame, FrameMetadata, PriorityTier, StreamKey, WindowLimits};

/// Lifecycle state of one stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Open frame received, window not yet granted
    Opening,
    /// Window granted, waiting for request data
    Admitted,
    /// Fragments of a message are arriving
    Streaming,
    /// A message is complete and awaiting consensus
    Reconciling,
    /// Ended normally
    Closed,
    /// Ended with an error
    Aborted,
}

impl StreamState {
    /// Whether the state is final
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        match (self, next) {
            (Opening, Admitted) => true,
            (Admitted, Streaming | Reconciling) => true,
            (Streaming, Streaming | Reconciling) => true,
            (Reconciling, Streaming | Reconciling | Admitted) => true,
            (Aborted, Admitted) => true,
            (from, Closed | Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Admitted => "admitted",
            Self::Streaming => "streaming",
            Self::Reconciling => "reconciling",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Consumption accumulated over a stream's lifetime
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamUsage {
    /// Input tokens billed
    pub tokens_in: u64,
    /// Output tokens billed
    pub tokens_out: u64,
    /// USD spent
    pub usd: f64,
}

/// Read-only view of a stream
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    /// Identity
    pub key: StreamKey,
    /// Lifecycle state
    pub state: StreamState,
    /// QoS tier
    pub tier: PriorityTier,
    /// Metadata from the open frame
    pub metadata: FrameMetadata,
    /// Requested window
    pub limits: WindowLimits,
    /// Last message released in order
    pub last_completed_seq: u64,
    /// Accumulated consumption
    pub usage: StreamUsage,
    /// When the stream was opened
    pub opened_at: Instant,
}

/// Stream state owned by the session manager
#[derive(Debug)]
pub(crate) struct StreamRecord {
    pub(crate) key: StreamKey,
    pub(crate) state: StreamState,
    pub(crate) tier: PriorityTier,
    pub(crate) metadata: FrameMetadata,
    pub(crate) limits: WindowLimits,
    pub(crate) last_completed_seq: u64,
    pub(crate) pending: BTreeMap<u64, ReassemblyBuffer>,
    pub(crate) ready: BTreeMap<u64, (String, FrameMetadata)>,
    pub(crate) usage: StreamUsage,
    pub(crate) opened_at: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) ended_at: Option<Instant>,
    /// Reply to a duplicate open after the stream closed
    pub(crate) terminal_ack: Option<Frame>,
}

impl StreamRecord {
    pub(crate) fn new(open: &Frame, limits: WindowLimits, now: Instant) -> Self {
        Self {
            key: open.key(),
            state: StreamState::Opening,
            tier: open.priority,
            metadata: open.metadata.clone(),
            limits,
            last_completed_seq: open.message_seq,
            pending: BTreeMap::new(),
            ready: BTreeMap::new(),
            usage: StreamUsage::default(),
            opened_at: now,
            last_activity: now,
            ended_at: None,
            terminal_ack: None,
        }
    }

    /// Apply a transition, returning whether it was legal
    pub(crate) fn transition(&mut self, next: StreamState, now: Instant) -> bool {
        if self.state == next && !next.is_terminal() {
            return true;
        }
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(now);
            self.pending.clear();
            self.ready.clear();
        }
        true
    }

    pub(crate) fn info(&self) -> StreamInfo {
        StreamInfo {
            key: self.key.clone(),
            state: self.state,
            tier: self.tier,
            metadata: self.metadata.clone(),
            limits: self.limits,
            last_completed_seq: self.last_completed_seq,
            usage: self.usage,
            opened_at: self.opened_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use StreamState::*;
        assert!(Opening.can_transition_to(Admitted));
        assert!(Admitted.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Reconciling));
        assert!(Reconciling.can_transition_to(Streaming));
        assert!(Reconciling.can_transition_to(Admitted));
        assert!(Streaming.can_transition_to(Aborted));
        assert!(Aborted.can_transition_to(Admitted));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        use StreamState::*;
        assert!(!Closed.can_transition_to(Admitted));
        assert!(!Closed.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Closed));
        assert!(!Opening.can_transition_to(Streaming));
    }
}
