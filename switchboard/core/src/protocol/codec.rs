//! Frame Codec
//!
//! Wire format for switchboard frames using a versioned, length-prefixed JSON
//! body with a CRC32 checksum for integrity and an optional HMAC-SHA256
//! signature for authenticity.
//!
//! # Frame Format
//!
//! ```text
//! +-------------+----------------+----------------+---------------------------+
//! | Version (1) | Length (4)     | Checksum (4)   | JSON body (variable)      |
//! | u8          | big-endian u32 | CRC32 BE       | serde encoding of Frame   |
//! +-------------+----------------+----------------+---------------------------+
//! ```
//!
//! The checksum covers the version byte, the length field and the body. The
//! body is produced by `serde_json` from a struct with fixed field order and
//! `BTreeMap` metadata, so the same frame always yields the same bytes.
//!
//! # Security
//!
//! - Maximum frame size is enforced before any allocation
//! - When a shared key is configured every frame must carry a valid signature,
//!   and signature verification is the last check before a frame is returned

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use super::error::ProtocolError;
use super::frame::Frame;

type HmacSha256 = Hmac<Sha256>;

/// Protocol version spoken by this codec
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size: 1 byte version + 4 bytes length + 4 bytes checksum
pub const HEADER_SIZE: usize = 9;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// CRC32 over version, length and body
#[inline]
fn compute_checksum(version: u8, len: u32, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[version]);
    hasher.update(&len.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Stateless frame encoder/decoder
#[derive(Clone, Default)]
pub struct FrameCodec {
    signing_key: Option<Vec<u8>>,
    max_frame_size: Option<usize>,
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("signed", &self.signing_key.is_some())
            .field("max_frame_size", &self.max_frame_size())
            .finish()
    }
}

impl FrameCodec {
    /// Codec without signing
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require and produce HMAC-SHA256 signatures with this shared key
    #[must_use]
    pub fn with_signing_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    /// Override the maximum frame size
    #[must_use]
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = Some(max);
        self
    }

    /// Effective maximum frame size
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.unwrap_or(MAX_FRAME_SIZE)
    }

    /// Whether a shared key is configured
    #[must_use]
    pub fn is_signing(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Encode a frame, signing it when a key is configured
    ///
    /// # Errors
    ///
    /// `MalformedFrame` if serialisation fails, `FrameTooLarge` if the body
    /// exceeds the maximum frame size.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        let body = match &self.signing_key {
            Some(key) => {
                let mut signed = frame.clone();
                signed.signature = Some(sign_with(key, frame)?);
                serialize(&signed)?
            }
            None => serialize(frame)?,
        };

        let max = self.max_frame_size();
        if body.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max,
            });
        }

        let len = body.len() as u32;
        let checksum = compute_checksum(frame.version, len, &body);

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.push(frame.version);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode exactly one frame from `bytes`
    ///
    /// # Errors
    ///
    /// See [`ProtocolError`]; checks run header, version, size, checksum,
    /// schema, structure, signature.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedFrame(format!(
                "truncated header: {} bytes",
                bytes.len()
            )));
        }
        let len = self.check_header(bytes)? as usize;
        if bytes.len() != HEADER_SIZE + len {
            return Err(ProtocolError::MalformedFrame(format!(
                "length field says {len} bytes, got {}",
                bytes.len() - HEADER_SIZE
            )));
        }
        self.decode_body(bytes[0], read_u32(&bytes[5..9]), &bytes[HEADER_SIZE..])
    }

    /// Compute the hex signature of a frame (ignoring any signature it has)
    ///
    /// Returns `None` when no key is configured.
    pub fn sign(&self, frame: &Frame) -> Result<Option<String>, ProtocolError> {
        self.signing_key
            .as_ref()
            .map(|key| sign_with(key, frame))
            .transpose()
    }

    /// Verify the frame signature against the configured key
    ///
    /// Always succeeds when no key is configured.
    pub fn verify(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let Some(key) = &self.signing_key else {
            return Ok(());
        };
        let provided = frame
            .signature
            .as_deref()
            .ok_or(ProtocolError::SignatureInvalid)?;
        let provided = hex::decode(provided).map_err(|_| ProtocolError::SignatureInvalid)?;

        let mut mac = new_mac(key)?;
        mac.update(&canonical_bytes(frame)?);
        mac.verify_slice(&provided)
            .map_err(|_| ProtocolError::SignatureInvalid)
    }

    /// Validate version and size; returns the body length
    fn check_header(&self, header: &[u8]) -> Result<u32, ProtocolError> {
        let version = header[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                supported: PROTOCOL_VERSION,
            });
        }
        let len = read_u32(&header[1..5]);
        let max = self.max_frame_size();
        if len as usize > max {
            return Err(ProtocolError::FrameTooLarge {
                size: len as usize,
                max,
            });
        }
        Ok(len)
    }

    fn decode_body(&self, version: u8, expected: u32, body: &[u8]) -> Result<Frame, ProtocolError> {
        let actual = compute_checksum(version, body.len() as u32, body);
        if actual != expected {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        let frame: Frame = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        if frame.version != version {
            return Err(ProtocolError::MalformedFrame(format!(
                "header version {version} disagrees with body version {}",
                frame.version
            )));
        }
        frame.validate().map_err(ProtocolError::MalformedFrame)?;
        self.verify(&frame)?;
        Ok(frame)
    }
}

fn serialize(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(frame).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

/// Encoding of the frame with its signature stripped
fn canonical_bytes(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    if frame.signature.is_none() {
        return serialize(frame);
    }
    let mut unsigned = frame.clone();
    unsigned.signature = None;
    serialize(&unsigned)
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, ProtocolError> {
    HmacSha256::new_from_slice(key).map_err(|_| ProtocolError::SignatureInvalid)
}

fn sign_with(key: &[u8], frame: &Frame) -> Result<String, ProtocolError> {
    let mut mac = new_mac(key)?;
    mac.update(&canonical_bytes(frame)?);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ============================================================================
// Streaming decoder
// ============================================================================

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete frames. A bad frame whose
/// length is known is skipped so the connection can keep going; an oversized
/// length field leaves the stream unframeable and clears the buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(FrameCodec::new())
    }
}

impl FrameDecoder {
    /// Create a decoder sharing the codec's key and limits
    #[must_use]
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of unconsumed bytes
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(..)` if the next frame is invalid (it has been consumed)
    pub fn decode(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.available() < HEADER_SIZE {
            return Ok(None);
        }

        let start = self.read_pos;
        let header = &self.buffer[start..start + HEADER_SIZE];
        let version = header[0];
        let len = read_u32(&header[1..5]) as usize;

        if len > self.codec.max_frame_size() {
            self.clear();
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.codec.max_frame_size(),
            });
        }
        if self.available() < HEADER_SIZE + len {
            return Ok(None);
        }

        let end = start + HEADER_SIZE + len;
        self.read_pos = end;

        let result = self.codec.check_header(&self.buffer[start..start + HEADER_SIZE]).and_then(|_| {
            let expected = read_u32(&self.buffer[start + 5..start + 9]);
            self.codec
                .decode_body(version, expected, &self.buffer[start + HEADER_SIZE..end])
        });
        if let Err(e) = &result {
            debug!(error = %e, bytes = len, "Dropping undecodable frame");
        }
        result.map(Some)
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{FrameFlags, WindowLimits};
    use crate::protocol::ids::StreamKey;

    fn sample() -> Frame {
        Frame::data(&StreamKey::new("sess", "req"), 3, 1, "hello", true)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = FrameCodec::new();
        let frame = sample();
        let bytes = codec.encode(&frame).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(codec.decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let codec = FrameCodec::new();
        let mut frame = sample();
        frame.metadata.extra.insert("b".into(), "2".into());
        frame.metadata.extra.insert("a".into(), "1".into());
        assert_eq!(codec.encode(&frame).unwrap(), codec.encode(&frame).unwrap());
    }

    #[test]
    fn test_checksum_mismatch() {
        let codec = FrameCodec::new();
        let mut bytes = codec.encode(&sample()).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0x01;
        assert!(matches!(
            codec.decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let codec = FrameCodec::new();
        let mut bytes = codec.encode(&sample()).unwrap();
        bytes[0] = 9;
        assert!(matches!(
            codec.decode(&bytes),
            Err(ProtocolError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn test_truncated_and_invalid_json() {
        let codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&[1, 0, 0]),
            Err(ProtocolError::MalformedFrame(_))
        ));

        let body = b"not valid json";
        let len = body.len() as u32;
        let mut bytes = vec![PROTOCOL_VERSION];
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&compute_checksum(PROTOCOL_VERSION, len, body).to_be_bytes());
        bytes.extend_from_slice(body);
        assert!(matches!(
            codec.decode(&bytes),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_structural_violation_is_malformed() {
        let codec = FrameCodec::new();
        let mut frame = Frame::open(&StreamKey::new("s", "a"), WindowLimits::default());
        frame.payload = crate::protocol::frame::Payload::Empty;
        let bytes = codec.encode(&frame).unwrap();
        assert!(matches!(
            codec.decode(&bytes),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_signature_required_and_verified() {
        let signer = FrameCodec::new().with_signing_key(b"shared".to_vec());
        let frame = sample();
        let bytes = signer.encode(&frame).unwrap();
        let decoded = signer.decode(&bytes).unwrap();
        assert!(decoded.signature.is_some());

        // Unsigned frame rejected by a keyed codec
        let unsigned = FrameCodec::new().encode(&frame).unwrap();
        assert_eq!(signer.decode(&unsigned), Err(ProtocolError::SignatureInvalid));

        // Wrong key
        let other = FrameCodec::new().with_signing_key(b"other".to_vec());
        assert_eq!(other.decode(&bytes), Err(ProtocolError::SignatureInvalid));
    }

    #[test]
    fn test_tampered_signed_frame_fails_signature() {
        let codec = FrameCodec::new().with_signing_key(b"k".to_vec());
        let mut frame = sample();
        frame.signature = codec.sign(&frame).unwrap();
        frame.flags = FrameFlags::NONE;
        // Re-encode without re-signing, keeping the stale signature
        let body = serde_json::to_vec(&frame).unwrap();
        let len = body.len() as u32;
        let mut bytes = vec![PROTOCOL_VERSION];
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&compute_checksum(PROTOCOL_VERSION, len, &body).to_be_bytes());
        bytes.extend_from_slice(&body);
        assert_eq!(codec.decode(&bytes), Err(ProtocolError::SignatureInvalid));
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::new().with_max_frame_size(64);
        let frame = Frame::data(&StreamKey::new("s", "a"), 1, 0, "x".repeat(200), false);
        assert!(matches!(
            codec.encode(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_streaming_decoder_partial_and_multiple() {
        let codec = FrameCodec::new();
        let first = sample();
        let second = Frame::heartbeat(&StreamKey::new("sess", "req"));
        let mut bytes = codec.encode(&first).unwrap();
        bytes.extend(codec.encode(&second).unwrap());

        let mut decoder = FrameDecoder::new(codec);
        let split = bytes.len() / 3;
        decoder.push(&bytes[..split]);
        assert_eq!(decoder.decode().unwrap(), None);
        decoder.push(&bytes[split..]);
        assert_eq!(decoder.decode().unwrap(), Some(first));
        assert_eq!(decoder.decode().unwrap(), Some(second));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_streaming_decoder_skips_corrupt_frame() {
        let codec = FrameCodec::new();
        let mut corrupt = codec.encode(&sample()).unwrap();
        corrupt[HEADER_SIZE + 2] ^= 0xff;
        let good = Frame::heartbeat(&StreamKey::new("sess", "req"));

        let mut decoder = FrameDecoder::new(codec.clone());
        decoder.push(&corrupt);
        decoder.push(&codec.encode(&good).unwrap());
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
        assert_eq!(decoder.decode().unwrap(), Some(good));
    }
}
