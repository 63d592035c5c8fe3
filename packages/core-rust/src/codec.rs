//! Length + checksum framed codec.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +-----------+-------------+----------------+-------------------+
//! | len: u32  | adler32: u32| tag: [u8; 6]   | payload: len bytes|
//! | big-endian| big-endian  | requests only  | UTF-8 JSON        |
//! +-----------+-------------+----------------+-------------------+
//! ```
//!
//! Requests (dispatcher -> worker) carry the tag; responses (worker ->
//! dispatcher) do not. A cancel request is the header `(0, 0)` followed by
//! the `CANCEL` tag and no payload.
//!
//! Both directions accumulate partial reads in the decoder buffer until a
//! whole frame is available, so a frame split across TCP segments is never
//! dropped or misparsed.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::hash::adler32;
use crate::messages::request::TAG_LEN;
use crate::messages::{Envelope, MessageType, Request};

/// Size of the `(length, checksum)` header.
pub const HEADER_LEN: usize = 8;

/// Default upper bound on a single payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while framing or parsing protocol messages.
///
/// Every decode error is fatal for the connection it occurred on: the stream
/// position can no longer be trusted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { length: usize, limit: usize },
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid worker announcement: {0}")]
    BadAnnouncement(&'static str),
}

// ---------------------------------------------------------------------------
// FrameHeader
// ---------------------------------------------------------------------------

/// The 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Header of a cancel request.
    pub const CANCEL: Self = Self {
        length: 0,
        checksum: 0,
    };

    /// Computes the header describing `payload`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::FrameTooLarge` if the payload does not fit a
    /// 32-bit length.
    pub fn for_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let length = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            length: payload.len(),
            limit: u32::MAX as usize,
        })?;
        Ok(Self {
            length,
            checksum: adler32(payload),
        })
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Reads a header from the front of `src` without consuming it.
    fn peek(src: &[u8]) -> Option<Self> {
        let bytes: [u8; HEADER_LEN] = src.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }

    /// Checks `payload` against this header's checksum.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::ChecksumMismatch` on any difference.
    pub fn verify(self, payload: &[u8]) -> Result<(), ProtocolError> {
        let actual = adler32(payload);
        if actual == self.checksum {
            Ok(())
        } else {
            Err(ProtocolError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            })
        }
    }
}

fn check_len(length: u32, limit: usize) -> Result<usize, ProtocolError> {
    let length = length as usize;
    if length > limit {
        return Err(ProtocolError::FrameTooLarge { length, limit });
    }
    Ok(length)
}

/// Appends a request frame to `dst`: header, tag, payload.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized or is too large.
pub fn encode_request(request: &Request, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    match request {
        Request::Job(envelope) => {
            let payload = envelope.to_payload()?;
            let header = FrameHeader::for_payload(&payload)?;
            dst.reserve(HEADER_LEN + TAG_LEN + payload.len());
            dst.put_slice(&header.to_bytes());
            dst.put_slice(MessageType::Job.tag());
            dst.put_slice(&payload);
        }
        Request::Cancel => {
            dst.reserve(HEADER_LEN + TAG_LEN);
            dst.put_slice(&FrameHeader::CANCEL.to_bytes());
            dst.put_slice(MessageType::Cancel.tag());
        }
    }
    Ok(())
}

/// Appends a response frame to `dst`: header, payload.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized or is too large.
pub fn encode_response(envelope: &Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = envelope.to_payload()?;
    let header = FrameHeader::for_payload(&payload)?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_slice(&header.to_bytes());
    dst.put_slice(&payload);
    Ok(())
}

// ---------------------------------------------------------------------------
// DispatcherCodec
// ---------------------------------------------------------------------------

/// Dispatcher side of the protocol: encodes [`Request`]s, decodes responses.
#[derive(Debug, Clone)]
pub struct DispatcherCodec {
    max_frame_len: usize,
}

impl DispatcherCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    #[must_use]
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for DispatcherCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DispatcherCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
        let Some(header) = FrameHeader::peek(src) else {
            return Ok(None);
        };
        let length = check_len(header.length, self.max_frame_len)?;
        let frame_len = HEADER_LEN + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length);
        header.verify(&payload)?;
        Envelope::from_payload(&payload).map(Some)
    }
}

impl Encoder<Request> for DispatcherCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_request(&item, dst)
    }
}

// ---------------------------------------------------------------------------
// WorkerCodec
// ---------------------------------------------------------------------------

/// Worker side of the protocol: decodes [`Request`]s, encodes responses.
///
/// Frames with an unrecognised tag are consumed and skipped.
#[derive(Debug, Clone)]
pub struct WorkerCodec {
    max_frame_len: usize,
}

impl WorkerCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl Default for WorkerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WorkerCodec {
    type Item = Request;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        loop {
            let Some(header) = FrameHeader::peek(src) else {
                return Ok(None);
            };
            let length = check_len(header.length, self.max_frame_len)?;
            let frame_len = HEADER_LEN + TAG_LEN + length;
            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let tag = src.split_to(TAG_LEN);
            let payload = src.split_to(length);

            match MessageType::from_tag(&tag) {
                Some(MessageType::Job) => {
                    header.verify(&payload)?;
                    return Envelope::from_payload(&payload).map(|env| Some(Request::Job(env)));
                }
                Some(MessageType::Cancel) => return Ok(Some(Request::Cancel)),
                None => {
                    debug!(tag = ?tag, "skipping frame with unknown message type");
                }
            }
        }
    }
}

impl Encoder<Envelope> for WorkerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_response(&item, dst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
