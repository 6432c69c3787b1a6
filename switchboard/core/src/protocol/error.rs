//! Protocol error taxonomy
//!
//! Every error that can reach a client travels as an `ERROR` control frame
//! carrying a stable [`ErrorCode`]. Codes are part of the wire contract and
//! must never be renumbered or renamed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable wire error codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Frame failed schema or structural validation
    MalformedFrame,
    /// Frame carried a protocol version this peer does not speak
    UnsupportedVersion,
    /// Frame checksum did not match its contents
    ChecksumMismatch,
    /// Frame signature did not verify against the shared key
    SignatureInvalid,
    /// A fragment is missing; the sender should retransmit
    MissingFragment,
    /// A message stayed incomplete past the retransmit deadline
    ReassemblyTimeout,
    /// Admission failed; retry after a window update
    WindowExceeded,
    /// The stream's token or cost budget cannot cover the request
    BudgetExhausted,
    /// No frame arrived within the heartbeat interval
    HeartbeatTimeout,
    /// An adapter call exceeded its deadline
    AdapterTimeout,
    /// Policy matched no usable adapter
    NoEligibleAdapter,
    /// No contributor produced a usable answer
    NoConsensus,
    /// Work was shed by the scheduler under congestion
    Preempted,
    /// The session refused another stream
    StreamLimit,
    /// Frame referenced a stream the session does not know
    UnknownStream,
    /// Unexpected internal failure
    Internal,
}

impl ErrorCode {
    /// Wire string for this code
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedFrame => "MALFORMED_FRAME",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::MissingFragment => "MISSING_FRAGMENT",
            Self::ReassemblyTimeout => "REASSEMBLY_TIMEOUT",
            Self::WindowExceeded => "WINDOW_EXCEEDED",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::AdapterTimeout => "ADAPTER_TIMEOUT",
            Self::NoEligibleAdapter => "NO_ELIGIBLE_ADAPTER",
            Self::NoConsensus => "NO_CONSENSUS",
            Self::Preempted => "PREEMPTED",
            Self::StreamLimit => "STREAM_LIMIT",
            Self::UnknownStream => "UNKNOWN_STREAM",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether the stream survives an error with this code
    ///
    /// Protocol errors are fatal to the frame only, sequencing gaps are
    /// retried, and admission failures are retried after a window update.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame
                | Self::UnsupportedVersion
                | Self::ChecksumMismatch
                | Self::SignatureInvalid
                | Self::MissingFragment
                | Self::WindowExceeded
                | Self::AdapterTimeout
                | Self::UnknownStream
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while decoding or encoding frames
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// Schema violation, truncated input, or structural inconsistency
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Integrity check failed
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum computed over the received bytes
        actual: u32,
    },

    /// Protocol version mismatch
    #[error("unsupported protocol version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version found in the frame
        found: u8,
        /// Version this codec speaks
        supported: u8,
    },

    /// Signature missing or wrong while a shared key is configured
    #[error("frame signature invalid")]
    SignatureInvalid,

    /// Frame exceeds the configured size limit
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Encoded size
        size: usize,
        /// Configured maximum
        max: usize,
    },
}

impl ProtocolError {
    /// Wire code for this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedFrame(_) | Self::FrameTooLarge { .. } => ErrorCode::MalformedFrame,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            Self::SignatureInvalid => ErrorCode::SignatureInvalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_strings_match_serde() {
        for code in [
            ErrorCode::WindowExceeded,
            ErrorCode::ReassemblyTimeout,
            ErrorCode::NoEligibleAdapter,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_recoverability() {
        assert!(ErrorCode::MissingFragment.is_recoverable());
        assert!(ErrorCode::WindowExceeded.is_recoverable());
        assert!(!ErrorCode::ReassemblyTimeout.is_recoverable());
        assert!(!ErrorCode::BudgetExhausted.is_recoverable());
        assert!(!ErrorCode::NoConsensus.is_recoverable());
    }
}
