//! Fragmentation and reassembly
//!
//! A message is complete once the fragment without `MORE` has arrived and
//! every lower fragment index is present.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::protocol::{Frame, FrameMetadata, StreamKey, MAX_FRAGMENTS_PER_MESSAGE};

/// Outcome of offering a fragment to a buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Stored; the message is still incomplete
    Accepted,
    /// Stored; the message is now complete
    Complete,
    /// Already held; dropped
    Duplicate,
    /// Inconsistent with the known final fragment, or past the fragment
    /// limit; dropped
    Rejected,
}

/// Fragments of one message
#[derive(Debug)]
pub struct ReassemblyBuffer {
    fragments: BTreeMap<u32, String>,
    final_index: Option<u32>,
    metadata: FrameMetadata,
    last_progress: Instant,
    retransmit_requested_at: Option<Instant>,
}

impl ReassemblyBuffer {
    /// Empty buffer
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            fragments: BTreeMap::new(),
            final_index: None,
            metadata: FrameMetadata::default(),
            last_progress: now,
            retransmit_requested_at: None,
        }
    }

    /// Offer one fragment
    pub fn insert(
        &mut self,
        index: u32,
        content: String,
        more: bool,
        metadata: &FrameMetadata,
        now: Instant,
    ) -> FragmentOutcome {
        if index >= MAX_FRAGMENTS_PER_MESSAGE {
            return FragmentOutcome::Rejected;
        }
        if self.fragments.contains_key(&index) {
            return FragmentOutcome::Duplicate;
        }
        match self.final_index {
            Some(last) if index > last => return FragmentOutcome::Rejected,
            Some(_) if !more => return FragmentOutcome::Rejected,
            _ => {}
        }
        if !more {
            if self.fragments.keys().next_back().is_some_and(|&max| max > index) {
                return FragmentOutcome::Rejected;
            }
            self.final_index = Some(index);
        }
        if index == 0 {
            self.metadata = metadata.clone();
        }
        self.fragments.insert(index, content);
        self.last_progress = now;
        self.retransmit_requested_at = None;

        if self.is_complete() {
            FragmentOutcome::Complete
        } else {
            FragmentOutcome::Accepted
        }
    }

    /// Whether every fragment up to the final one is present
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.final_index
            .is_some_and(|last| self.fragments.len() as u64 == u64::from(last) + 1)
    }

    /// Known-missing fragment indices
    ///
    /// Before the final fragment arrives only gaps below the highest index
    /// received are known. Never longer than [`MAX_FRAGMENTS_PER_MESSAGE`].
    #[must_use]
    pub fn missing(&self) -> Vec<u32> {
        let upper = match self.final_index {
            Some(last) => last,
            None => match self.fragments.keys().next_back() {
                Some(&max) => max,
                None => return vec![0],
            },
        };
        (0..=upper)
            .filter(|i| !self.fragments.contains_key(i))
            .collect()
    }

    /// Concatenate the fragments of a complete message
    #[must_use]
    pub fn assemble(self) -> (String, FrameMetadata) {
        (self.fragments.into_values().collect(), self.metadata)
    }

    /// Last time a fragment arrived
    #[must_use]
    pub fn last_progress(&self) -> Instant {
        self.last_progress
    }

    /// When a retransmit request was sent for the current gap
    #[must_use]
    pub fn retransmit_requested_at(&self) -> Option<Instant> {
        self.retransmit_requested_at
    }

    /// Note that a retransmit request went out
    pub fn mark_retransmit_requested(&mut self, now: Instant) {
        self.retransmit_requested_at = Some(now);
    }
}

/// Split `content` into data frames of at most `max_bytes` content each
///
/// Splits on char boundaries; `MORE` is set on every frame but the last.
/// Empty content still yields one frame.
#[must_use]
pub fn fragment_message(key: &StreamKey, message_seq: u64, content: &str, max_bytes: usize) -> Vec<Frame> {
    let max_bytes = max_bytes.max(4);
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < content.len() {
        let mut end = (start + max_bytes).min(content.len());
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        pieces.push(&content[start..end]);
        start = end;
    }
    if pieces.is_empty() {
        pieces.push("");
    }

    let last = pieces.len() - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| Frame::data(key, message_seq, i as u32, piece, i != last))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameFlags, Payload};

    fn meta() -> FrameMetadata {
        FrameMetadata::default()
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(now);
        assert_eq!(buffer.insert(2, "c".into(), false, &meta(), now), FragmentOutcome::Accepted);
        assert_eq!(buffer.missing(), vec![0, 1]);
        assert_eq!(buffer.insert(0, "a".into(), true, &meta(), now), FragmentOutcome::Accepted);
        assert_eq!(buffer.insert(0, "a".into(), true, &meta(), now), FragmentOutcome::Duplicate);
        assert_eq!(buffer.insert(1, "b".into(), true, &meta(), now), FragmentOutcome::Complete);
        assert_eq!(buffer.assemble().0, "abc");
    }

    #[test]
    fn test_inconsistent_fragments_rejected() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(now);
        buffer.insert(1, "b".into(), false, &meta(), now);
        assert_eq!(buffer.insert(3, "d".into(), true, &meta(), now), FragmentOutcome::Rejected);
        assert_eq!(buffer.insert(0, "a".into(), false, &meta(), now), FragmentOutcome::Rejected);

        let mut other = ReassemblyBuffer::new(now);
        other.insert(5, "f".into(), true, &meta(), now);
        assert_eq!(other.insert(2, "c".into(), false, &meta(), now), FragmentOutcome::Rejected);
    }

    #[test]
    fn test_fragment_past_limit_rejected() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(now);
        buffer.insert(0, "a".into(), true, &meta(), now);
        assert_eq!(
            buffer.insert(2_000_000, "z".into(), true, &meta(), now),
            FragmentOutcome::Rejected
        );
        assert_eq!(buffer.missing(), Vec::<u32>::new());

        let last = MAX_FRAGMENTS_PER_MESSAGE - 1;
        assert_eq!(buffer.insert(last, "z".into(), true, &meta(), now), FragmentOutcome::Accepted);
        assert_eq!(buffer.missing().len() as u32, MAX_FRAGMENTS_PER_MESSAGE - 2);
    }

    #[test]
    fn test_fragment_message_respects_limit_and_boundaries() {
        let key = StreamKey::new("s", "a");
        let content = "héllo wörld, ünïcode";
        let frames = fragment_message(&key, 4, content, 5);
        assert!(frames.len() > 1);

        let mut rebuilt = String::new();
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.fragment_seq as usize, i);
            assert_eq!(frame.has(FrameFlags::MORE), i + 1 != frames.len());
            match &frame.payload {
                Payload::Data { content } => {
                    assert!(content.len() <= 5);
                    rebuilt.push_str(content);
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_fragment_empty_message() {
        let frames = fragment_message(&StreamKey::new("s", "a"), 1, "", 16);
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].has(FrameFlags::MORE));
    }
}
