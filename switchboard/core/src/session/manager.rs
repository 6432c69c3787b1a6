//! Session Manager
//!
//! Single owner of session and stream state. Every inbound frame goes through
//! [`SessionManager::handle_frame`], which applies the stream state machine,
//! sequencing and reassembly, and returns [`SessionEvent`]s for the engine.
//! Time-driven behaviour (heartbeat and reassembly timeouts, idle session
//! expiry) runs in [`SessionManager::sweep`].
//!
//! The manager registers and releases windows with the governor but never
//! touches window fields itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::reassembly::{FragmentOutcome, ReassemblyBuffer};
use super::stream::{StreamInfo, StreamRecord, StreamState, StreamUsage};
use crate::protocol::{
    ControlMessage, ErrorCode, ErrorReport, Frame, FrameFlags, FrameMetadata, Payload,
    PriorityTier, SessionId, StreamId, StreamKey, WindowLimits,
};
use crate::routing::config::duration_ms;
use crate::window::WindowGovernor;

// ============================================================================
// Configuration
// ============================================================================

/// Session manager tunables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A stream silent for longer than this aborts with `HEARTBEAT_TIMEOUT`
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Gap age before a retransmit request, and again before giving up
    #[serde(with = "duration_ms")]
    pub reassembly_timeout: Duration,
    /// A session with no live streams expires after this long
    #[serde(with = "duration_ms")]
    pub session_idle_timeout: Duration,
    /// How long ended streams are remembered for idempotent reopen
    #[serde(with = "duration_ms")]
    pub terminal_retention: Duration,
    /// Live streams allowed per session
    pub max_streams_per_session: usize,
    /// Content bytes per outbound data fragment
    pub max_fragment_bytes: usize,
    /// Incomplete inbound messages held per stream
    pub max_pending_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let heartbeat = Duration::from_secs(15);
        Self {
            heartbeat_interval: heartbeat,
            reassembly_timeout: heartbeat,
            session_idle_timeout: Duration::from_secs(300),
            terminal_retention: Duration::from_secs(300),
            max_streams_per_session: 64,
            max_fragment_bytes: 16 * 1024,
            max_pending_messages: 64,
        }
    }
}

impl SessionConfig {
    /// Set the heartbeat interval; the reassembly timeout follows it
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.reassembly_timeout = interval;
        self
    }

    /// Set the per-session stream cap
    #[must_use]
    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_streams_per_session = max;
        self
    }
}

// ============================================================================
// Events and errors
// ============================================================================

/// What the engine must act on after a frame or sweep
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A new stream was admitted
    Opened {
        /// Stream
        key: StreamKey,
        /// Its tier
        tier: PriorityTier,
    },
    /// An aborted stream was reopened with its sequencing preserved
    Resumed {
        /// Stream
        key: StreamKey,
    },
    /// A request message completed, released in sequence order
    Message {
        /// Stream
        key: StreamKey,
        /// Message sequence
        message_seq: u64,
        /// Reassembled content
        content: String,
        /// Metadata (fragment zero, falling back to the open frame)
        metadata: FrameMetadata,
        /// Stream tier
        tier: PriorityTier,
    },
    /// Control message for the engine
    Control {
        /// Stream or session-level key the control arrived on
        key: StreamKey,
        /// The control message
        control: ControlMessage,
    },
    /// Frame to send back to the client
    Reply(Frame),
    /// Stream closed by the client
    Closed {
        /// Stream
        key: StreamKey,
    },
    /// Stream aborted; in-flight work must be cancelled
    Aborted {
        /// Stream
        key: StreamKey,
        /// Why
        report: ErrorReport,
    },
}

/// Session manager errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    /// No such stream
    #[error("unknown stream {0}")]
    UnknownStream(StreamKey),

    /// Transition not allowed by the state machine
    #[error("illegal transition for {key}: {from} -> {to}")]
    InvalidTransition {
        /// Stream
        key: StreamKey,
        /// Current state
        from: StreamState,
        /// Requested state
        to: StreamState,
    },
}

impl SessionError {
    /// Wire code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownStream(_) => ErrorCode::UnknownStream,
            Self::InvalidTransition { .. } => ErrorCode::Internal,
        }
    }
}

// ============================================================================
// Session state
// ============================================================================

#[derive(Debug)]
struct Session {
    streams: HashMap<StreamId, StreamRecord>,
    last_activity: Instant,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            streams: HashMap::new(),
            last_activity: now,
        }
    }

    fn live_streams(&self) -> usize {
        self.streams
            .values()
            .filter(|s| !s.state.is_terminal())
            .count()
    }
}

/// Owner of all session and stream state
pub struct SessionManager {
    config: SessionConfig,
    governor: Arc<WindowGovernor>,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl SessionManager {
    /// Create a manager registering windows with `governor`
    #[must_use]
    pub fn new(config: SessionConfig, governor: Arc<WindowGovernor>) -> Self {
        Self {
            config,
            governor,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle one decoded inbound frame
    pub fn handle_frame(&self, frame: Frame) -> Vec<SessionEvent> {
        self.handle_frame_at(frame, Instant::now())
    }

    /// [`handle_frame`](Self::handle_frame) with an explicit clock
    pub fn handle_frame_at(&self, frame: Frame, now: Instant) -> Vec<SessionEvent> {
        if let Err(reason) = frame.validate() {
            let key = frame.key();
            warn!(stream = %key, %reason, "Invalid frame dropped");
            let report =
                ErrorReport::new(ErrorCode::MalformedFrame, reason).with_message(frame.message_seq);
            return vec![SessionEvent::Reply(Frame::error(&key, frame.message_seq, report))];
        }

        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(frame.session_id.clone())
            .or_insert_with(|| {
                debug!(session = %frame.session_id, "Session created");
                Session::new(now)
            });
        session.last_activity = now;

        if frame.stream_id.is_session_level() {
            return self.handle_session_frame(&mut sessions, frame, now);
        }

        let key = frame.key();
        if frame.has(FrameFlags::OPEN) {
            return self.handle_open(session, frame, now);
        }

        let Some(stream) = session.streams.get_mut(&key.stream) else {
            if matches!(frame.payload, Payload::Data { .. }) || frame.has(FrameFlags::CLOSE) {
                let report = ErrorReport::new(ErrorCode::UnknownStream, "stream not open")
                    .with_message(frame.message_seq);
                return vec![SessionEvent::Reply(Frame::error(&key, frame.message_seq, report))];
            }
            return Vec::new();
        };

        if stream.state.is_terminal() {
            debug!(stream = %key, state = %stream.state, "Frame for ended stream dropped");
            return Vec::new();
        }
        stream.last_activity = now;

        if frame.has(FrameFlags::ABORT) {
            let report = match &frame.payload {
                Payload::Control(ControlMessage::Error(report)) => report.clone(),
                _ => ErrorReport::new(ErrorCode::Internal, "aborted by client").terminal(),
            };
            stream.transition(StreamState::Aborted, now);
            self.governor.release(&key);
            info!(stream = %key, code = %report.code, "Stream aborted by client");
            return vec![SessionEvent::Aborted { key, report }];
        }

        if frame.has(FrameFlags::CLOSE) {
            stream.transition(StreamState::Closed, now);
            self.governor.release(&key);
            let ack = Frame::close(&key, stream.last_completed_seq).with_flags(FrameFlags::ACK);
            stream.terminal_ack = Some(ack.clone());
            info!(stream = %key, "Stream closed by client");
            return vec![SessionEvent::Closed { key }, SessionEvent::Reply(ack)];
        }

        match frame.payload {
            Payload::Control(ControlMessage::BudgetUpdate(limits)) => {
                stream.limits = limits;
                match self.governor.update_limits(&key, limits) {
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        warn!(stream = %key, error = %e, "Budget update for stream without window");
                        Vec::new()
                    }
                }
            }
            Payload::Control(control) => vec![SessionEvent::Control { key, control }],
            Payload::Data { content } => {
                let more = frame.flags.contains(FrameFlags::MORE);
                Self::accept_fragment(
                    stream,
                    self.config.max_pending_messages,
                    frame.message_seq,
                    frame.fragment_seq,
                    content,
                    more,
                    &frame.metadata,
                    now,
                )
            }
            // Heartbeats, acks and empty frames only refresh liveness
            _ => Vec::new(),
        }
    }

    fn handle_session_frame(
        &self,
        sessions: &mut HashMap<SessionId, Session>,
        frame: Frame,
        now: Instant,
    ) -> Vec<SessionEvent> {
        let session_id = frame.session_id.clone();
        let key = frame.key();

        if frame.has(FrameFlags::HEARTBEAT) {
            if let Some(session) = sessions.get_mut(&session_id) {
                for stream in session.streams.values_mut() {
                    stream.last_activity = now;
                }
            }
            return Vec::new();
        }

        // Ended streams stay behind for idempotent reopen; the sweep expires
        // the session once it is idle
        if frame.has(FrameFlags::CLOSE) {
            let mut events = Vec::new();
            if let Some(session) = sessions.get_mut(&session_id) {
                for stream in session.streams.values_mut() {
                    if stream.state.is_terminal() {
                        continue;
                    }
                    stream.transition(StreamState::Closed, now);
                    self.governor.release(&stream.key);
                    stream.terminal_ack =
                        Some(Frame::close(&stream.key, stream.last_completed_seq).with_flags(FrameFlags::ACK));
                    events.push(SessionEvent::Closed {
                        key: stream.key.clone(),
                    });
                }
            }
            info!(session = %session_id, streams = events.len(), "Session closed");
            events.push(SessionEvent::Reply(
                Frame::close(&key, frame.message_seq).with_flags(FrameFlags::ACK),
            ));
            return events;
        }

        match frame.payload {
            Payload::Control(control) => vec![SessionEvent::Control { key, control }],
            _ => Vec::new(),
        }
    }

    fn handle_open(&self, session: &mut Session, frame: Frame, now: Instant) -> Vec<SessionEvent> {
        let key = frame.key();
        let limits = match &frame.payload {
            Payload::Open(open) => open.limits,
            _ => WindowLimits::default(),
        };

        if let Some(stream) = session.streams.get_mut(&key.stream) {
            return match stream.state {
                StreamState::Closed => {
                    debug!(stream = %key, "Duplicate open of closed stream");
                    stream
                        .terminal_ack
                        .clone()
                        .map(SessionEvent::Reply)
                        .into_iter()
                        .collect()
                }
                StreamState::Aborted => {
                    stream.transition(StreamState::Admitted, now);
                    stream.limits = limits;
                    stream.tier = frame.priority;
                    stream.last_activity = now;
                    stream.ended_at = None;
                    stream.terminal_ack = None;
                    let snapshot = self.governor.open(&key, limits);
                    info!(stream = %key, resume_after = stream.last_completed_seq, "Stream resumed");
                    let ack = Frame::ack(&key, stream.last_completed_seq).with_window(snapshot);
                    vec![SessionEvent::Resumed { key }, SessionEvent::Reply(ack)]
                }
                _ => {
                    stream.last_activity = now;
                    let mut ack = Frame::ack(&key, stream.last_completed_seq);
                    if let Some(snapshot) = self.governor.snapshot(&key) {
                        ack = ack.with_window(snapshot);
                    }
                    vec![SessionEvent::Reply(ack)]
                }
            };
        }

        if session.live_streams() >= self.config.max_streams_per_session {
            warn!(stream = %key, max = self.config.max_streams_per_session, "Stream limit reached");
            let report = ErrorReport::new(
                ErrorCode::StreamLimit,
                format!(
                    "session already has {} live streams",
                    self.config.max_streams_per_session
                ),
            );
            return vec![SessionEvent::Reply(Frame::abort(&key, frame.message_seq, report))];
        }

        let mut stream = StreamRecord::new(&frame, limits, now);
        let snapshot = self.governor.open(&key, limits);
        stream.transition(StreamState::Admitted, now);
        let tier = stream.tier;
        let ack = Frame::ack(&key, frame.message_seq).with_window(snapshot);
        session.streams.insert(key.stream.clone(), stream);
        info!(stream = %key, %tier, "Stream opened");
        vec![SessionEvent::Opened { key, tier }, SessionEvent::Reply(ack)]
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_fragment(
        stream: &mut StreamRecord,
        max_pending: usize,
        message_seq: u64,
        fragment_seq: u32,
        content: String,
        more: bool,
        metadata: &FrameMetadata,
        now: Instant,
    ) -> Vec<SessionEvent> {
        if message_seq <= stream.last_completed_seq || stream.ready.contains_key(&message_seq) {
            debug!(stream = %stream.key, message_seq, "Fragment for completed message dropped");
            return Vec::new();
        }
        if !stream.pending.contains_key(&message_seq) && stream.pending.len() >= max_pending {
            warn!(stream = %stream.key, message_seq, max_pending, "Too many incomplete messages");
            let report = ErrorReport::new(
                ErrorCode::WindowExceeded,
                format!("{max_pending} messages already awaiting fragments"),
            )
            .with_message(message_seq);
            return vec![SessionEvent::Reply(Frame::error(&stream.key, message_seq, report))];
        }

        let buffer = stream
            .pending
            .entry(message_seq)
            .or_insert_with(|| ReassemblyBuffer::new(now));
        match buffer.insert(fragment_seq, content, more, metadata, now) {
            FragmentOutcome::Duplicate | FragmentOutcome::Rejected => {
                debug!(stream = %stream.key, message_seq, fragment_seq, "Fragment dropped");
                Vec::new()
            }
            FragmentOutcome::Accepted => {
                if matches!(stream.state, StreamState::Admitted | StreamState::Reconciling) {
                    stream.transition(StreamState::Streaming, now);
                }
                Vec::new()
            }
            FragmentOutcome::Complete => {
                if let Some(buffer) = stream.pending.remove(&message_seq) {
                    stream.ready.insert(message_seq, buffer.assemble());
                }
                Self::release_ready(stream, now)
            }
        }
    }

    /// Release completed messages that no lower in-progress message blocks
    fn release_ready(stream: &mut StreamRecord, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some((&seq, _)) = stream.ready.iter().next() {
            let blocked = stream
                .pending
                .keys()
                .next()
                .is_some_and(|&lowest| lowest < seq);
            if blocked {
                break;
            }
            let Some((content, metadata)) = stream.ready.remove(&seq) else {
                break;
            };
            stream.last_completed_seq = seq;
            stream.transition(StreamState::Reconciling, now);
            let metadata = if metadata.task_class.is_some() {
                metadata
            } else {
                stream.metadata.clone()
            };
            events.push(SessionEvent::Message {
                key: stream.key.clone(),
                message_seq: seq,
                content,
                metadata,
                tier: stream.tier,
            });
        }
        events
    }

    // ========================================================================
    // Engine-facing transitions
    // ========================================================================

    /// Record that the engine delivered the final result; stores the closing
    /// frame as the reply to any duplicate open
    pub fn finish(&self, key: &StreamKey, closing: Frame) -> Result<(), SessionError> {
        self.with_stream(key, |stream, now| {
            let from = stream.state;
            if !stream.transition(StreamState::Closed, now) {
                return Err(SessionError::InvalidTransition {
                    key: key.clone(),
                    from,
                    to: StreamState::Closed,
                });
            }
            stream.terminal_ack = Some(closing);
            Ok(())
        })?;
        self.governor.release(key);
        Ok(())
    }

    /// Abort a stream; returns the `ERROR` + `ABORT` frame to send, or
    /// `None` if the stream already ended
    pub fn abort(&self, key: &StreamKey, report: ErrorReport) -> Option<Frame> {
        let frame = self
            .with_stream(key, |stream, now| {
                if !stream.transition(StreamState::Aborted, now) {
                    return Err(SessionError::InvalidTransition {
                        key: key.clone(),
                        from: stream.state,
                        to: StreamState::Aborted,
                    });
                }
                Ok(Frame::abort(key, stream.last_completed_seq, report))
            })
            .ok()?;
        self.governor.release(key);
        Some(frame)
    }

    /// A recoverable engine error for the current message: back to `Admitted`
    pub fn reset_to_admitted(&self, key: &StreamKey) -> Result<(), SessionError> {
        self.transition(key, StreamState::Admitted)
    }

    /// Apply a transition requested by the engine
    pub fn transition(&self, key: &StreamKey, to: StreamState) -> Result<(), SessionError> {
        self.with_stream(key, |stream, now| {
            let from = stream.state;
            if stream.transition(to, now) {
                Ok(())
            } else {
                Err(SessionError::InvalidTransition {
                    key: key.clone(),
                    from,
                    to,
                })
            }
        })
    }

    /// Add consumption to a stream's running totals
    pub fn record_usage(&self, key: &StreamKey, usage: StreamUsage) -> Result<(), SessionError> {
        self.with_stream(key, |stream, _| {
            stream.usage.tokens_in += usage.tokens_in;
            stream.usage.tokens_out += usage.tokens_out;
            stream.usage.usd += usage.usd;
            Ok(())
        })
    }

    /// Refresh a stream's liveness (outbound traffic counts as activity)
    pub fn touch(&self, key: &StreamKey) {
        let _ = self.with_stream(key, |stream, now| {
            stream.last_activity = now;
            Ok(())
        });
    }

    /// Current state of a stream
    #[must_use]
    pub fn state(&self, key: &StreamKey) -> Option<StreamState> {
        let sessions = self.sessions.lock();
        sessions
            .get(&key.session)
            .and_then(|s| s.streams.get(&key.stream))
            .map(|s| s.state)
    }

    /// Read-only view of a stream
    #[must_use]
    pub fn stream_info(&self, key: &StreamKey) -> Option<StreamInfo> {
        let sessions = self.sessions.lock();
        sessions
            .get(&key.session)
            .and_then(|s| s.streams.get(&key.stream))
            .map(StreamRecord::info)
    }

    /// Number of sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Live streams across all sessions
    #[must_use]
    pub fn live_stream_count(&self) -> usize {
        self.sessions.lock().values().map(Session::live_streams).sum()
    }

    /// Keys of every live stream in a session
    #[must_use]
    pub fn live_streams(&self, session: &SessionId) -> Vec<StreamKey> {
        let sessions = self.sessions.lock();
        sessions
            .get(session)
            .map(|s| {
                s.streams
                    .values()
                    .filter(|r| !r.state.is_terminal())
                    .map(|r| r.key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn with_stream<R>(
        &self,
        key: &StreamKey,
        f: impl FnOnce(&mut StreamRecord, Instant) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let mut sessions = self.sessions.lock();
        let stream = sessions
            .get_mut(&key.session)
            .and_then(|s| s.streams.get_mut(&key.stream))
            .ok_or_else(|| SessionError::UnknownStream(key.clone()))?;
        f(stream, Instant::now())
    }

    // ========================================================================
    // Sweep
    // ========================================================================

    /// Run timeouts as of `now`
    ///
    /// - a message gap older than `reassembly_timeout` gets one recoverable
    ///   `MISSING_FRAGMENT`; still open after another timeout, the stream
    ///   aborts with `REASSEMBLY_TIMEOUT`. The retransmit request refreshes
    ///   the stream's liveness, so the heartbeat cannot pre-empt it
    /// - a stream silent for longer than `heartbeat_interval` aborts with
    ///   `HEARTBEAT_TIMEOUT`
    /// - idle sessions and long-ended streams are forgotten
    pub fn sweep(&self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let mut released = Vec::new();
        let mut sessions = self.sessions.lock();

        for session in sessions.values_mut() {
            for stream in session.streams.values_mut() {
                if stream.state.is_terminal() {
                    continue;
                }
                if let Some(report) = self.check_reassembly(stream, now, &mut events) {
                    Self::abort_locked(stream, report, now, &mut events);
                    released.push(stream.key.clone());
                    continue;
                }
                if now.saturating_duration_since(stream.last_activity) > self.config.heartbeat_interval {
                    let report = ErrorReport::new(
                        ErrorCode::HeartbeatTimeout,
                        format!(
                            "no frame for {} ms",
                            self.config.heartbeat_interval.as_millis()
                        ),
                    )
                    .terminal();
                    Self::abort_locked(stream, report, now, &mut events);
                    released.push(stream.key.clone());
                }
            }

            let retention = self.config.terminal_retention;
            session.streams.retain(|_, s| {
                s.ended_at
                    .map_or(true, |ended| now.saturating_duration_since(ended) < retention)
            });
        }

        let idle = self.config.session_idle_timeout;
        sessions.retain(|id, session| {
            let keep = session.live_streams() > 0
                || now.saturating_duration_since(session.last_activity) < idle;
            if !keep {
                debug!(session = %id, "Idle session expired");
            }
            keep
        });
        drop(sessions);

        for key in released {
            self.governor.release(&key);
        }
        events
    }

    /// Returns a terminal report if the stream must abort
    fn check_reassembly(
        &self,
        stream: &mut StreamRecord,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) -> Option<ErrorReport> {
        let timeout = self.config.reassembly_timeout;
        let key = stream.key.clone();
        let mut requested = false;
        for (&seq, buffer) in &mut stream.pending {
            match buffer.retransmit_requested_at() {
                Some(requested) if now.saturating_duration_since(requested) >= timeout => {
                    warn!(stream = %key, message_seq = seq, "Reassembly timed out");
                    return Some(
                        ErrorReport::new(
                            ErrorCode::ReassemblyTimeout,
                            format!("message {seq} still incomplete after retransmit request"),
                        )
                        .with_message(seq)
                        .with_missing(buffer.missing())
                        .terminal(),
                    );
                }
                None if now.saturating_duration_since(buffer.last_progress()) >= timeout => {
                    let missing = buffer.missing();
                    debug!(stream = %key, message_seq = seq, ?missing, "Requesting retransmit");
                    buffer.mark_retransmit_requested(now);
                    requested = true;
                    let report = ErrorReport::new(
                        ErrorCode::MissingFragment,
                        format!("message {seq} is missing fragments"),
                    )
                    .with_message(seq)
                    .with_missing(missing);
                    events.push(SessionEvent::Reply(Frame::error(&key, seq, report)));
                }
                _ => {}
            }
        }
        if requested {
            stream.last_activity = now;
        }
        None
    }

    fn abort_locked(
        stream: &mut StreamRecord,
        report: ErrorReport,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        stream.transition(StreamState::Aborted, now);
        info!(stream = %stream.key, code = %report.code, "Stream aborted");
        events.push(SessionEvent::Reply(Frame::abort(
            &stream.key,
            stream.last_completed_seq,
            report.clone(),
        )));
        events.push(SessionEvent::Aborted {
            key: stream.key.clone(),
            report,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::GovernorConfig;

    fn manager() -> SessionManager {
        SessionManager::new(
            SessionConfig::default(),
            Arc::new(WindowGovernor::new(GovernorConfig::default())),
        )
    }

    fn key() -> StreamKey {
        StreamKey::new("s", "a")
    }

    fn open(manager: &SessionManager, now: Instant) -> Vec<SessionEvent> {
        manager.handle_frame_at(Frame::open(&key(), WindowLimits::default()), now)
    }

    fn messages(events: &[SessionEvent]) -> Vec<(u64, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Message {
                    message_seq,
                    content,
                    ..
                } => Some((*message_seq, content.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_open_admits_and_acks_with_window() {
        let manager = manager();
        let events = open(&manager, Instant::now());
        assert!(matches!(events[0], SessionEvent::Opened { .. }));
        match &events[1] {
            SessionEvent::Reply(ack) => {
                assert!(ack.has(FrameFlags::ACK));
                assert!(ack.window.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(manager.state(&key()), Some(StreamState::Admitted));
    }

    #[test]
    fn test_fragments_reassemble_and_stale_sequences_drop() {
        let manager = manager();
        let now = Instant::now();
        open(&manager, now);

        let events = manager.handle_frame_at(Frame::data(&key(), 1, 0, "hel", true), now);
        assert!(events.is_empty());
        assert_eq!(manager.state(&key()), Some(StreamState::Streaming));

        let events = manager.handle_frame_at(Frame::data(&key(), 1, 1, "lo", false), now);
        assert_eq!(messages(&events), vec![(1, "hello".to_string())]);
        assert_eq!(manager.state(&key()), Some(StreamState::Reconciling));

        // Replay of the completed message is dropped
        let events = manager.handle_frame_at(Frame::data(&key(), 1, 1, "lo", false), now);
        assert!(events.is_empty());
    }

    #[test]
    fn test_messages_release_in_order() {
        let manager = manager();
        let now = Instant::now();
        open(&manager, now);

        manager.handle_frame_at(Frame::data(&key(), 1, 0, "first-", true), now);
        let events = manager.handle_frame_at(Frame::data(&key(), 2, 0, "second", false), now);
        assert!(messages(&events).is_empty());

        let events = manager.handle_frame_at(Frame::data(&key(), 1, 1, "done", false), now);
        assert_eq!(
            messages(&events),
            vec![(1, "first-done".to_string()), (2, "second".to_string())]
        );
    }

    #[test]
    fn test_duplicate_open_of_closed_stream_is_idempotent() {
        let manager = manager();
        let now = Instant::now();
        open(&manager, now);
        let close = manager.handle_frame_at(Frame::close(&key(), 0), now);
        let ack = match &close[1] {
            SessionEvent::Reply(frame) => frame.clone(),
            other => panic!("unexpected {other:?}"),
        };

        let first = open(&manager, now);
        let second = open(&manager, now);
        assert_eq!(first, vec![SessionEvent::Reply(ack.clone())]);
        assert_eq!(first, second);
        assert_eq!(manager.state(&key()), Some(StreamState::Closed));
    }

    #[test]
    fn test_reopen_after_abort_preserves_sequencing() {
        let manager = manager();
        let now = Instant::now();
        open(&manager, now);
        manager.handle_frame_at(Frame::data(&key(), 3, 0, "x", false), now);
        assert!(manager.abort(&key(), ErrorReport::new(ErrorCode::Internal, "boom")).is_some());

        let events = open(&manager, now);
        assert!(matches!(events[0], SessionEvent::Resumed { .. }));
        assert_eq!(manager.state(&key()), Some(StreamState::Admitted));
        assert!(manager
            .handle_frame_at(Frame::data(&key(), 2, 0, "old", false), now)
            .is_empty());
    }

    #[test]
    fn test_stream_limit() {
        let manager = SessionManager::new(
            SessionConfig::default().with_max_streams(1),
            Arc::new(WindowGovernor::default()),
        );
        let now = Instant::now();
        open(&manager, now);
        let events = manager.handle_frame_at(
            Frame::open(&StreamKey::new("s", "b"), WindowLimits::default()),
            now,
        );
        match &events[0] {
            SessionEvent::Reply(frame) => {
                assert!(frame.has(FrameFlags::ABORT));
                match frame.control_message() {
                    Some(ControlMessage::Error(report)) => {
                        assert_eq!(report.code, ErrorCode::StreamLimit)
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_timeout_aborts_and_releases_window() {
        let governor = Arc::new(WindowGovernor::default());
        let manager = SessionManager::new(SessionConfig::default(), governor.clone());
        let start = Instant::now();
        open(&manager, start);
        assert!(governor.contains(&key()));

        assert!(manager.sweep(start + Duration::from_secs(10)).is_empty());
        let events = manager.sweep(start + Duration::from_secs(16));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Aborted { report, .. } if report.code == ErrorCode::HeartbeatTimeout
        )));
        assert_eq!(manager.state(&key()), Some(StreamState::Aborted));
        assert!(!governor.contains(&key()));
    }

    #[test]
    fn test_session_heartbeat_refreshes_every_stream() {
        let manager = manager();
        let start = Instant::now();
        open(&manager, start);
        manager.handle_frame_at(
            Frame::heartbeat(&StreamKey::new("s", "")),
            start + Duration::from_secs(10),
        );
        assert!(manager.sweep(start + Duration::from_secs(20)).is_empty());
    }

    #[test]
    fn test_budget_update_reaches_governor() {
        let governor = Arc::new(WindowGovernor::default());
        let manager = SessionManager::new(SessionConfig::default(), governor.clone());
        let now = Instant::now();
        open(&manager, now);
        let limits = WindowLimits {
            max_parallel: 1,
            max_tokens: 10,
            max_usd: 0.01,
        };
        let frame = Frame::control(&key(), 0, ControlMessage::BudgetUpdate(limits));
        assert!(manager.handle_frame_at(frame, now).is_empty());
        assert_eq!(governor.snapshot(&key()).unwrap().limits, limits);
    }

    #[test]
    fn test_session_close_closes_streams() {
        let manager = manager();
        let now = Instant::now();
        open(&manager, now);
        let events = manager.handle_frame_at(Frame::close(&StreamKey::new("s", ""), 0), now);
        assert!(matches!(events[0], SessionEvent::Closed { .. }));
        assert_eq!(manager.state(&key()), Some(StreamState::Closed));
        assert_eq!(manager.live_stream_count(), 0);

        // The closed stream still answers a duplicate open
        let reopen = open(&manager, now);
        match &reopen[..] {
            [SessionEvent::Reply(ack)] => {
                assert!(ack.has(FrameFlags::CLOSE));
                assert_eq!(ack.key(), key());
            }
            other => panic!("unexpected {other:?}"),
        }

        let later = now + Duration::from_secs(301);
        manager.sweep(later);
        assert_eq!(manager.session_count(), 0);
    }
}
