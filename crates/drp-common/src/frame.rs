//! Binary frame encoding and incremental decoding.
//!
//! Every frame is an 8-byte header (little-endian `i32` opcode, little-endian
//! `i32` body length) followed by a UTF-8 JSON body of exactly that length.
//! The local socket delivers a byte stream, so [`FrameDecoder`] keeps partial
//! headers and bodies between reads.

use serde_json::Value;
use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Maximum accepted body size (1 MiB).
pub const MAX_PAYLOAD: usize = 1_048_576;

/// Frame opcodes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Client → peer, first frame on a fresh channel.
    Handshake,
    /// RPC command, response or dispatch.
    Frame,
    /// Either side is closing the channel.
    Close,
    /// Keepalive request; must be echoed as [`Opcode::Pong`].
    Ping,
    /// Keepalive response.
    Pong,
}

impl Opcode {
    /// Returns the wire value of this opcode.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Handshake => 0,
            Self::Frame => 1,
            Self::Close => 2,
            Self::Ping => 3,
            Self::Pong => 4,
        }
    }

    /// Maps a wire value back to an opcode.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Handshake),
            1 => Some(Self::Frame),
            2 => Some(Self::Close),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// A single decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame opcode.
    pub opcode: Opcode,
    /// JSON body. An empty body decodes as [`Value::Null`].
    pub payload: Value,
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The header declared a negative body length.
    #[error("negative payload length: {0}")]
    NegativeLength(i32),
    /// The body exceeds [`MAX_PAYLOAD`].
    #[error("payload too large: max {max}, got {actual}")]
    PayloadTooLarge {
        /// Maximum allowed body size.
        max: usize,
        /// Declared or actual body size.
        actual: usize,
    },
    /// The header carried an opcode this protocol does not define.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(i32),
    /// The complete body was not valid JSON.
    #[error("invalid json body: {0}")]
    InvalidJson(String),
}

impl FrameError {
    /// Whether the decoder can no longer find the next frame boundary.
    ///
    /// Length errors leave the stream unsynchronised; the other variants
    /// consume their body and decoding can continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::NegativeLength(_) | Self::PayloadTooLarge { .. })
    }
}

impl Frame {
    /// Creates a frame with the given opcode and body.
    #[must_use]
    pub const fn new(opcode: Opcode, payload: Value) -> Self {
        Self { opcode, payload }
    }

    /// Creates a `HANDSHAKE` frame asserting protocol version and client id.
    #[must_use]
    pub fn handshake(version: u32, client_id: &str) -> Self {
        Self::new(
            Opcode::Handshake,
            serde_json::json!({ "v": version, "client_id": client_id }),
        )
    }

    /// Creates a `FRAME` (data) frame.
    #[must_use]
    pub const fn data(payload: Value) -> Self {
        Self::new(Opcode::Frame, payload)
    }

    /// Creates a `CLOSE` frame with an empty object body.
    #[must_use]
    pub fn close() -> Self {
        Self::new(Opcode::Close, Value::Object(serde_json::Map::new()))
    }

    /// Creates a `PING` frame carrying a token.
    #[must_use]
    pub fn ping(token: &str) -> Self {
        Self::new(Opcode::Ping, Value::String(token.to_string()))
    }

    /// Creates a `PONG` frame echoing a ping body.
    #[must_use]
    pub const fn pong(payload: Value) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Serializes this frame into header + body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the JSON body exceeds
    /// [`MAX_PAYLOAD`].
    ///
    /// # Examples
    ///
    /// ```
    /// use drp_common::frame::{Frame, HEADER_LEN};
    /// let bytes = Frame::handshake(1, "42").encode().unwrap();
    /// assert_eq!(&bytes[0..4], &0i32.to_le_bytes());
    /// assert_eq!(bytes.len(), HEADER_LEN + r#"{"client_id":"42","v":1}"#.len());
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self.opcode, &self.payload)
    }
}

/// Encodes an opcode and JSON value into wire bytes.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the body exceeds [`MAX_PAYLOAD`].
pub fn encode(opcode: Opcode, payload: &Value) -> Result<Vec<u8>, FrameError> {
    let body = payload.to_string();
    if body.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD,
            actual: body.len(),
        });
    }
    // MAX_PAYLOAD fits in an i32
    let len = i32::try_from(body.len()).map_err(|_| FrameError::PayloadTooLarge {
        max: MAX_PAYLOAD,
        actual: body.len(),
    })?;

    let mut v = Vec::with_capacity(HEADER_LEN + body.len());
    v.extend_from_slice(&opcode.code().to_le_bytes());
    v.extend_from_slice(&len.to_le_bytes());
    v.extend_from_slice(body.as_bytes());
    Ok(v)
}

/// Stateful decoder that turns an arbitrary chunking of the byte stream back
/// into frames.
///
/// Once a header is complete its `(opcode, length)` is retained and the body
/// accumulates across reads until `length` bytes are present.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    header: Option<(i32, usize)>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether a header has been read and its body is still incomplete.
    #[must_use]
    pub const fn in_body(&self) -> bool {
        self.header.is_some()
    }

    /// Extracts the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`]. Non-fatal errors (see
    /// [`FrameError::is_fatal`]) consume the offending frame, so calling
    /// again continues with the following one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let (code, len) = match self.header {
            Some(header) => header,
            None => {
                if self.buf.len() < HEADER_LEN {
                    return Ok(None);
                }
                let code = i32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                let raw_len =
                    i32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
                let len = usize::try_from(raw_len).map_err(|_| FrameError::NegativeLength(raw_len))?;
                if len > MAX_PAYLOAD {
                    return Err(FrameError::PayloadTooLarge {
                        max: MAX_PAYLOAD,
                        actual: len,
                    });
                }
                self.buf.drain(..HEADER_LEN);
                self.header = Some((code, len));
                (code, len)
            }
        };

        if self.buf.len() < len {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf.drain(..len).collect();
        self.header = None;

        let opcode = Opcode::from_code(code).ok_or(FrameError::UnknownOpcode(code))?;
        let payload = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).map_err(|e| FrameError::InvalidJson(e.to_string()))?
        };
        Ok(Some(Frame { opcode, payload }))
    }

    /// Feeds `bytes` and invokes `emit` for every frame completed by them.
    ///
    /// Returns the number of frames emitted.
    ///
    /// # Errors
    ///
    /// Stops at the first [`FrameError`]; frames emitted before it are kept.
    pub fn decode<F>(&mut self, bytes: &[u8], mut emit: F) -> Result<usize, FrameError>
    where
        F: FnMut(Frame),
    {
        self.push(bytes);
        let mut count = 0;
        while let Some(frame) = self.next_frame()? {
            emit(frame);
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        decoder.decode(bytes, |f| out.push(f)).unwrap();
        out
    }

    #[test]
    fn header_is_little_endian_opcode_then_length() {
        let bytes = Frame::data(json!({"cmd": "DISPATCH"})).encode().unwrap();
        let body = br#"{"cmd":"DISPATCH"}"#;

        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &(body.len() as i32).to_le_bytes());
        assert_eq!(&bytes[8..], body);
    }

    #[test]
    fn handshake_carries_version_and_client_id() {
        let frames = decode_all(&Frame::handshake(1, "594190466782724099").encode().unwrap());

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Handshake);
        assert_eq!(frames[0].payload["v"], 1);
        assert_eq!(frames[0].payload["client_id"], "594190466782724099");
    }

    #[test]
    fn zero_length_body_is_a_valid_frame() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&Opcode::Ping.code().to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());

        let frames = decode_all(&bytes);
        assert_eq!(frames, vec![Frame::new(Opcode::Ping, Value::Null)]);
    }

    #[test]
    fn body_split_across_reads_is_reassembled() {
        let bytes = Frame::data(json!({"evt": "READY", "data": {"v": 1}}))
            .encode()
            .unwrap();
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();

        decoder.decode(&bytes[..3], |f| out.push(f)).unwrap();
        assert!(out.is_empty());
        assert!(!decoder.in_body());

        decoder.decode(&bytes[3..12], |f| out.push(f)).unwrap();
        assert!(out.is_empty());
        assert!(decoder.in_body());

        decoder.decode(&bytes[12..], |f| out.push(f)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload["evt"], "READY");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut bytes = Frame::ping("a").encode().unwrap();
        bytes.extend(Frame::data(json!({"n": 1})).encode().unwrap());
        bytes.extend(Frame::close().encode().unwrap());

        let ops: Vec<Opcode> = decode_all(&bytes).into_iter().map(|f| f.opcode).collect();
        assert_eq!(ops, vec![Opcode::Ping, Opcode::Frame, Opcode::Close]);
    }

    #[test]
    fn unknown_opcode_is_skipped_without_losing_sync() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&9i32.to_le_bytes());
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        bytes.extend(Frame::data(json!({"ok": true})).encode().unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let err = decoder.next_frame().unwrap_err();
        assert_eq!(err, FrameError::UnknownOpcode(9));
        assert!(!err.is_fatal());

        let next = decoder.next_frame().unwrap().unwrap();
        assert_eq!(next.payload["ok"], true);
    }

    #[test]
    fn invalid_json_is_reported_and_consumed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&3i32.to_le_bytes());
        bytes.extend_from_slice(b"{x}");

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::InvalidJson(_))
        ));
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.next_frame(), Ok(None));
    }

    #[test]
    fn negative_length_is_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&(-5i32).to_le_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let err = decoder.next_frame().unwrap_err();
        assert_eq!(err, FrameError::NegativeLength(-5));
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&((MAX_PAYLOAD + 1) as i32).to_le_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(decoder.next_frame().unwrap_err().is_fatal());
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let big = Value::String("x".repeat(MAX_PAYLOAD));
        assert!(matches!(
            encode(Opcode::Frame, &big),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn opcode_codes_round_trip() {
        for op in [
            Opcode::Handshake,
            Opcode::Frame,
            Opcode::Close,
            Opcode::Ping,
            Opcode::Pong,
        ] {
            assert_eq!(Opcode::from_code(op.code()), Some(op));
        }
        assert_eq!(Opcode::from_code(5), None);
    }
}
