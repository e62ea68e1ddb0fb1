//! Wire format shared by the controller and its agents.
//!
//! Every message is `[type: T bytes][length: L bytes][payload]`, both header
//! fields big-endian unsigned, the payload base64 encoded. `T` and `L` are
//! agreed out of band; the defaults are 4 and 8.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{ChannelError, ConfigError};

// ── Message kinds (values fixed for interoperability) ───────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Cmd,
    Get,
    Put,
    Handshake,
    Output,
    Response,
    Content,
    Cwd,
    GetCwd,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Ping,
        MessageKind::Cmd,
        MessageKind::Get,
        MessageKind::Put,
        MessageKind::Handshake,
        MessageKind::Output,
        MessageKind::Response,
        MessageKind::Content,
        MessageKind::Cwd,
        MessageKind::GetCwd,
    ];

    pub fn code(self) -> u64 {
        match self {
            MessageKind::Ping => 0,
            MessageKind::Cmd => 1,
            MessageKind::Get => 2,
            MessageKind::Put => 3,
            MessageKind::Handshake => 4,
            MessageKind::Output => 5,
            MessageKind::Response => 6,
            MessageKind::Content => 7,
            MessageKind::Cwd => 8,
            MessageKind::GetCwd => 9,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Ping => "PING",
            MessageKind::Cmd => "CMD",
            MessageKind::Get => "GET",
            MessageKind::Put => "PUT",
            MessageKind::Handshake => "HANDSHAKE",
            MessageKind::Output => "OUTPUT",
            MessageKind::Response => "RESPONSE",
            MessageKind::Content => "CONTENT",
            MessageKind::Cwd => "CWD",
            MessageKind::GetCwd => "GET_CWD",
        };
        f.write_str(name)
    }
}

// ── Constants ───────────────────────────────────────────────────────

pub const DEFAULT_TYPE_WIDTH: usize = 4;
pub const DEFAULT_LENGTH_WIDTH: usize = 8;
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Payload of keepalive pings. Agents do not answer them.
pub const PING_PAYLOAD: &[u8] = b"keep-alive-ping";
/// Payload of `GetCwd` requests.
pub const CWD_REQUEST_PAYLOAD: &[u8] = b"_";

// ── Frames ──────────────────────────────────────────────────────────

/// One decoded message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Header layout plus the largest encoded payload accepted from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    type_width: usize,
    length_width: usize,
    max_frame_bytes: u64,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            type_width: DEFAULT_TYPE_WIDTH,
            length_width: DEFAULT_LENGTH_WIDTH,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl FrameFormat {
    pub fn new(
        type_width: usize,
        length_width: usize,
        max_frame_bytes: u64,
    ) -> Result<Self, ConfigError> {
        for (field, value) in [("type width", type_width), ("length width", length_width)] {
            if !(1..=8).contains(&value) {
                return Err(ConfigError::HeaderWidth { field, value });
            }
        }
        if max_frame_bytes == 0 {
            return Err(ConfigError::ZeroFrameLimit);
        }
        Ok(Self {
            type_width,
            length_width,
            max_frame_bytes,
        })
    }

    pub fn header_len(&self) -> usize {
        self.type_width + self.length_width
    }

    /// Build the complete wire bytes of one message.
    pub fn encode(&self, kind: MessageKind, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let encoded = encode_payload(payload);
        let mut frame = Vec::with_capacity(self.header_len() + encoded.len());
        if !put_uint(&mut frame, kind.code(), self.type_width) {
            return Err(ChannelError::protocol(format!(
                "type code {} does not fit in {} bytes",
                kind.code(),
                self.type_width
            )));
        }
        if !put_uint(&mut frame, encoded.len() as u64, self.length_width) {
            return Err(ChannelError::protocol(format!(
                "encoded payload of {} bytes does not fit in a {}-byte length field",
                encoded.len(),
                self.length_width
            )));
        }
        frame.extend_from_slice(encoded.as_bytes());
        Ok(frame)
    }

    /// Pull one complete frame off the front of `pending`.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full frame. A
    /// frame with an unknown type code is consumed before the error is
    /// returned, so the stream stays aligned on frame boundaries. An
    /// oversized length field is not recoverable and yields `Corrupt`.
    pub fn decode(&self, pending: &mut Vec<u8>) -> Result<Option<Frame>, ChannelError> {
        let header_len = self.header_len();
        if pending.len() < header_len {
            return Ok(None);
        }

        let code = read_uint(&pending[..self.type_width]);
        let declared = read_uint(&pending[self.type_width..header_len]);
        if declared > self.max_frame_bytes {
            return Err(ChannelError::Corrupt(format!(
                "declared length {} exceeds the {} byte limit",
                declared, self.max_frame_bytes
            )));
        }
        // Bounded by max_frame_bytes above.
        let length = declared as usize;
        if pending.len() < header_len + length {
            return Ok(None);
        }

        let encoded: Vec<u8> = pending.drain(..header_len + length).skip(header_len).collect();
        let kind = MessageKind::from_code(code)
            .ok_or_else(|| ChannelError::protocol(format!("unknown message type {code}")))?;
        let payload = decode_payload(&encoded)?;
        Ok(Some(Frame { kind, payload }))
    }
}

// ── Payload encoding ────────────────────────────────────────────────

pub fn encode_payload(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

pub fn decode_payload(encoded: &[u8]) -> Result<Vec<u8>, ChannelError> {
    STANDARD
        .decode(encoded)
        .map_err(|err| ChannelError::protocol(format!("payload is not valid base64: {err}")))
}

// ── Fixed-width integers ────────────────────────────────────────────

/// Append `value` as `width` big-endian bytes. False if it does not fit.
fn put_uint(out: &mut Vec<u8>, value: u64, width: usize) -> bool {
    if width < 8 && value >> (width * 8) != 0 {
        return false;
    }
    out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
    true
}

fn read_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}
