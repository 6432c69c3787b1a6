//! Protocol Flow Tests
//!
//! Exercises the layers below the engine together: bytes through the frame
//! decoder into the session manager, fragment recovery and timeouts against
//! an explicit clock, and window admission feeding the AIMD ceiling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use switchboard_core::scheduler::QosScheduler;
use switchboard_core::window::Dimension;
use switchboard_core::{
    ControlMessage, ErrorCode, ErrorReport, Frame, FrameCodec, FrameDecoder, FrameFlags,
    GovernorConfig, GovernorError, Payload, PriorityTier, SendEstimate, SessionConfig,
    SessionEvent, SessionManager, StreamKey, StreamState, WindowGovernor, WindowLimits,
    MAX_FRAGMENTS_PER_MESSAGE,
};

// ============================================================================
// Helpers
// ============================================================================

const HEARTBEAT: Duration = Duration::from_secs(1);

fn manager() -> (SessionManager, Arc<WindowGovernor>) {
    let governor = Arc::new(WindowGovernor::new(GovernorConfig::default()));
    let sessions = SessionManager::new(
        SessionConfig::default().with_heartbeat_interval(HEARTBEAT),
        Arc::clone(&governor),
    );
    (sessions, governor)
}

fn report_of(frame: &Frame) -> &ErrorReport {
    match &frame.payload {
        Payload::Control(ControlMessage::Error(report)) => report,
        other => panic!("expected error report, got {other:?}"),
    }
}

fn replies(events: &[SessionEvent]) -> Vec<&Frame> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Reply(frame) => Some(frame),
            _ => None,
        })
        .collect()
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

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

// ============================================================================
// Wire to session
// ============================================================================

#[test]
fn test_signed_byte_stream_reaches_session_manager() {
    let codec = FrameCodec::new().with_signing_key(b"shared-secret".to_vec());
    let key = StreamKey::new("wire", "one");
    let frames = [
        Frame::open(&key, WindowLimits::default()).with_priority(PriorityTier::Gold),
        Frame::data(&key, 1, 0, "split across ", true),
        Frame::data(&key, 1, 1, "two fragments", false),
    ];
    let mut bytes = Vec::new();
    for frame in &frames {
        bytes.extend(codec.encode(frame).unwrap());
    }

    let mut decoder = FrameDecoder::new(codec);
    let (sessions, _governor) = manager();
    let mut events = Vec::new();
    for chunk in bytes.chunks(7) {
        decoder.push(chunk);
        while let Some(frame) = decoder.decode().unwrap() {
            events.extend(sessions.handle_frame(frame));
        }
    }

    assert!(matches!(
        events.first(),
        Some(SessionEvent::Opened {
            tier: PriorityTier::Gold,
            ..
        })
    ));
    assert_eq!(messages(&events), vec![(1, "split across two fragments".to_string())]);
    assert_eq!(sessions.state(&key), Some(StreamState::Reconciling));
}

#[test]
fn test_unsigned_frame_rejected_by_signing_codec() {
    let key = StreamKey::new("wire", "two");
    let bytes = FrameCodec::new()
        .encode(&Frame::heartbeat(&key))
        .unwrap();

    let signing = FrameCodec::new().with_signing_key(b"shared-secret".to_vec());
    let err = signing.decode(&bytes).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SignatureInvalid);
}

// ============================================================================
// Ordering and reassembly
// ============================================================================

#[test]
fn test_messages_release_in_sequence_order() {
    let (sessions, _governor) = manager();
    let key = StreamKey::new("s", "ordered");
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);

    sessions.handle_frame_at(Frame::data(&key, 1, 0, "first ", true), t0);
    let early = sessions.handle_frame_at(Frame::data(&key, 2, 0, "second", false), t0);
    assert!(messages(&early).is_empty());

    let released = sessions.handle_frame_at(Frame::data(&key, 1, 1, "message", false), t0);
    assert_eq!(
        messages(&released),
        vec![(1, "first message".to_string()), (2, "second".to_string())]
    );

    // Replays of a completed message are ignored
    let replay = sessions.handle_frame_at(Frame::data(&key, 1, 0, "first ", true), t0);
    assert!(replay.is_empty());
}

#[test]
fn test_missing_fragment_then_reassembly_timeout() {
    let (sessions, governor) = manager();
    let key = StreamKey::new("s", "gappy");
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);
    sessions.handle_frame_at(Frame::data(&key, 1, 0, "abc", true), t0);
    sessions.handle_frame_at(Frame::data(&key, 1, 2, "ghi", false), t0);

    let first = sessions.sweep(t0 + HEARTBEAT);
    let reply = replies(&first);
    assert_eq!(reply.len(), 1);
    let report = report_of(reply[0]);
    assert_eq!(report.code, ErrorCode::MissingFragment);
    assert!(report.recoverable);
    assert_eq!(report.message_seq, Some(1));
    assert_eq!(report.missing_fragments, vec![1]);
    assert!(!reply[0].has(FrameFlags::ABORT));

    // Heartbeats keep the stream alive but do not fill the gap
    sessions.handle_frame_at(Frame::heartbeat(&key), t0 + ms(1500));
    let second = sessions.sweep(t0 + ms(2000));

    let abort = replies(&second)[0];
    assert!(abort.has(FrameFlags::ABORT));
    let report = report_of(abort);
    assert_eq!(report.code, ErrorCode::ReassemblyTimeout);
    assert!(!report.recoverable);
    assert!(second
        .iter()
        .any(|e| matches!(e, SessionEvent::Aborted { .. })));
    assert_eq!(sessions.state(&key), Some(StreamState::Aborted));
    assert!(!governor.contains(&key));
}

#[test]
fn test_silent_gap_reaches_reassembly_timeout_before_heartbeat() {
    let (sessions, governor) = manager();
    let key = StreamKey::new("s", "silent-gap");
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);
    sessions.handle_frame_at(Frame::data(&key, 1, 0, "abc", true), t0);
    sessions.handle_frame_at(Frame::data(&key, 1, 2, "ghi", false), t0);

    // No client traffic at all after the gap opens
    let first = sessions.sweep(t0 + ms(1100));
    assert!(!first
        .iter()
        .any(|e| matches!(e, SessionEvent::Aborted { .. })));
    assert_eq!(report_of(replies(&first)[0]).code, ErrorCode::MissingFragment);
    assert_eq!(sessions.state(&key), Some(StreamState::Streaming));

    let second = sessions.sweep(t0 + ms(2100));
    let codes: Vec<ErrorCode> = second
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Aborted { report, .. } => Some(report.code),
            _ => None,
        })
        .collect();
    assert_eq!(codes, vec![ErrorCode::ReassemblyTimeout]);
    assert!(!governor.contains(&key));
}

#[test]
fn test_fragment_index_is_bounded_and_gap_report_fits_one_frame() {
    let codec = FrameCodec::new();
    let key = StreamKey::new("s", "wide");
    let far = Frame::data(&key, 1, 2_000_000, "z", true);
    let bytes = codec.encode(&far).unwrap();
    assert_eq!(codec.decode(&bytes).unwrap_err().code(), ErrorCode::MalformedFrame);

    let (sessions, _governor) = manager();
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);
    sessions.handle_frame_at(Frame::data(&key, 1, 0, "a", true), t0);
    let rejected = sessions.handle_frame_at(far, t0);
    let report = report_of(replies(&rejected)[0]);
    assert_eq!(report.code, ErrorCode::MalformedFrame);
    assert!(report.recoverable);

    // Widest legal gap: everything between the first and last fragment
    let last = MAX_FRAGMENTS_PER_MESSAGE - 1;
    sessions.handle_frame_at(Frame::data(&key, 1, last, "z", false), t0);
    let sweep = sessions.sweep(t0 + HEARTBEAT);
    let request = replies(&sweep)[0];
    let report = report_of(request);
    assert_eq!(report.code, ErrorCode::MissingFragment);
    assert_eq!(report.missing_fragments.len() as u32, last - 1);
    assert!(codec.encode(request).is_ok());
}

#[test]
fn test_incomplete_messages_per_stream_are_capped() {
    let governor = Arc::new(WindowGovernor::new(GovernorConfig::default()));
    let config = SessionConfig {
        max_pending_messages: 2,
        ..SessionConfig::default()
    };
    let sessions = SessionManager::new(config, governor);
    let key = StreamKey::new("s", "hoarder");
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);
    assert!(sessions
        .handle_frame_at(Frame::data(&key, 1, 0, "a", true), t0)
        .is_empty());
    assert!(sessions
        .handle_frame_at(Frame::data(&key, 2, 0, "b", true), t0)
        .is_empty());

    let refused = sessions.handle_frame_at(Frame::data(&key, 3, 0, "c", true), t0);
    let report = report_of(replies(&refused)[0]);
    assert_eq!(report.code, ErrorCode::WindowExceeded);
    assert_eq!(report.message_seq, Some(3));

    // Fragments of messages already held are still accepted
    let done = sessions.handle_frame_at(Frame::data(&key, 1, 1, "!", false), t0);
    assert_eq!(messages(&done), vec![(1, "a!".to_string())]);
}

#[test]
fn test_retransmit_completes_message() {
    let (sessions, _governor) = manager();
    let key = StreamKey::new("s", "recovering");
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);
    sessions.handle_frame_at(Frame::data(&key, 1, 0, "abc", true), t0);
    sessions.handle_frame_at(Frame::data(&key, 1, 2, "ghi", false), t0);
    sessions.sweep(t0 + HEARTBEAT);

    let events = sessions.handle_frame_at(Frame::data(&key, 1, 1, "def", true), t0 + ms(1200));
    assert_eq!(messages(&events), vec![(1, "abcdefghi".to_string())]);

    let later = sessions.sweep(t0 + ms(2000));
    assert!(later.is_empty());
    assert_eq!(sessions.state(&key), Some(StreamState::Reconciling));
}

// ============================================================================
// Liveness and resumption
// ============================================================================

#[test]
fn test_silent_stream_times_out_and_heartbeat_prevents_it() {
    let (sessions, _governor) = manager();
    let quiet = StreamKey::new("s", "quiet");
    let chatty = StreamKey::new("s", "chatty");
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&quiet, WindowLimits::default()), t0);
    sessions.handle_frame_at(Frame::open(&chatty, WindowLimits::default()), t0);
    sessions.handle_frame_at(Frame::heartbeat(&chatty), t0 + ms(800));

    let events = sessions.sweep(t0 + ms(1500));
    let aborted: Vec<&StreamKey> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Aborted { key, report } => {
                assert_eq!(report.code, ErrorCode::HeartbeatTimeout);
                Some(key)
            }
            _ => None,
        })
        .collect();
    assert_eq!(aborted, vec![&quiet]);
    assert_eq!(sessions.state(&chatty), Some(StreamState::Admitted));
}

#[test]
fn test_aborted_stream_resumes_after_last_completed_message() {
    let (sessions, governor) = manager();
    let key = StreamKey::new("s", "resumable");
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);
    sessions.handle_frame_at(Frame::data(&key, 1, 0, "done", false), t0);
    sessions.sweep(t0 + ms(1500));
    assert_eq!(sessions.state(&key), Some(StreamState::Aborted));

    let t1 = t0 + ms(1600);
    let events = sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t1);
    assert!(matches!(events[0], SessionEvent::Resumed { .. }));
    let ack = replies(&events)[0];
    assert!(ack.has(FrameFlags::ACK));
    assert_eq!(ack.message_seq, 1);
    assert!(ack.window.is_some());
    assert!(governor.contains(&key));

    let events = sessions.handle_frame_at(Frame::data(&key, 2, 0, "next", false), t1);
    assert_eq!(messages(&events), vec![(2, "next".to_string())]);
}

#[test]
fn test_client_close_is_idempotent() {
    let (sessions, _governor) = manager();
    let key = StreamKey::new("s", "closing");
    let t0 = Instant::now();
    sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);

    let closed = sessions.handle_frame_at(Frame::close(&key, 0), t0);
    assert!(matches!(closed[0], SessionEvent::Closed { .. }));
    let first_ack = replies(&closed)[0].clone();

    let again = sessions.handle_frame_at(Frame::open(&key, WindowLimits::default()), t0);
    assert_eq!(replies(&again), vec![&first_ack]);
    assert_eq!(sessions.state(&key), Some(StreamState::Closed));
}

// ============================================================================
// Windows
// ============================================================================

#[test]
fn test_token_window_rejection_then_budget_exhaustion() {
    let governor = WindowGovernor::new(GovernorConfig::default());
    let key = StreamKey::new("s", "tokens");
    governor.open(
        &key,
        WindowLimits {
            max_parallel: 4,
            max_tokens: 1000,
            max_usd: 1.0,
        },
    );

    let first = governor.try_admit(&key, SendEstimate::new(600, 0.1)).unwrap();
    match governor.try_admit(&key, SendEstimate::new(600, 0.1)) {
        Err(GovernorError::WindowExceeded {
            dimension,
            violations,
            snapshot,
            ..
        }) => {
            assert_eq!(dimension, Dimension::Tokens);
            assert_eq!(violations, vec![Dimension::Tokens]);
            assert_eq!(snapshot.usage.in_flight, 1);
            assert_eq!(snapshot.usage.tokens_used, 600);
        }
        other => panic!("expected window exceeded, got {other:?}"),
    }

    let settled = governor
        .on_ack(&first, SendEstimate::new(500, 0.05), true)
        .unwrap();
    assert_eq!(settled.usage.in_flight, 0);
    assert_eq!(settled.usage.tokens_used, 500);

    let err = governor
        .try_admit(&key, SendEstimate::new(600, 0.1))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BudgetExhausted);
    assert!(err.snapshot().is_some());

    governor.try_admit(&key, SendEstimate::new(400, 0.1)).unwrap();
}

#[test]
fn test_timeouts_shrink_parallel_ceiling_and_successes_restore_it() {
    let governor = WindowGovernor::new(GovernorConfig::default());
    let key = StreamKey::new("s", "aimd");
    governor.open(&key, WindowLimits::default());
    let small = SendEstimate::new(10, 0.001);

    let ticket = governor.try_admit(&key, small).unwrap();
    let snapshot = governor.on_timeout(&ticket).unwrap();
    assert!((snapshot.effective_parallel - 2.0).abs() < f64::EPSILON);
    assert_eq!(snapshot.usage.tokens_used, 10);

    let a = governor.try_admit(&key, small).unwrap();
    let _b = governor.try_admit(&key, small).unwrap();
    let err = governor.try_admit(&key, small).unwrap_err();
    assert!(matches!(
        err,
        GovernorError::WindowExceeded {
            dimension: Dimension::Parallel,
            ..
        }
    ));

    let snapshot = governor.on_ack(&a, small, true).unwrap();
    assert!((snapshot.effective_parallel - 3.0).abs() < f64::EPSILON);
    governor.try_admit(&key, small).unwrap();
    governor.try_admit(&key, small).unwrap();
    assert_eq!(governor.snapshot(&key).unwrap().usage.in_flight, 3);
}

// ============================================================================
// Scheduling
// ============================================================================

#[test]
fn test_gold_keeps_its_share_and_bronze_still_runs() {
    let scheduler: QosScheduler<u32> = QosScheduler::default();
    for i in 0..20 {
        for tier in PriorityTier::ALL {
            let key = StreamKey::new("s", format!("{tier}-{i}"));
            scheduler.enqueue(key, tier, i).unwrap();
        }
    }

    let mut counts = [0usize; 3];
    for _ in 0..20 {
        let next = scheduler.try_next().unwrap();
        counts[next.tier.index()] += 1;
    }
    assert!(counts[PriorityTier::Gold.index()] >= 10);
    assert!(counts[PriorityTier::Bronze.index()] >= 1);
    assert_eq!(scheduler.len(), 40);
}
