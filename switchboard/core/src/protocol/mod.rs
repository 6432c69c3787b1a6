//! Wire protocol
//!
//! Frame model, identifiers, error codes and the codec that turns frames into
//! bytes and back. Everything here is pure: no I/O and no shared state.

pub mod codec;
pub mod error;
pub mod frame;
pub mod ids;

pub use codec::{FrameCodec, FrameDecoder, HEADER_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{
    CapabilityAdvert, ControlMessage, ErrorReport, FindingSummary, Frame, FrameFlags,
    FrameMetadata, OpenRequest, Payload, PriorityTier, ResultEnvelope, WindowLimits,
    WindowSnapshot, WindowUsage, DEFAULT_TTL, MAX_FRAGMENTS_PER_MESSAGE,
};
pub use ids::{AdapterId, SessionId, StreamId, StreamKey};
