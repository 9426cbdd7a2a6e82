//! imux wire format.
//!
//! Every message on a link, after the handshake, is one frame:
//!
//!   [FrameHeader (8 bytes)] [body (body_len bytes)]
//!
//! The frame kind selects the body layout. Chunks carry a fixed
//! [`ChunkHeader`] followed by the raw identifiers and payload so the data path
//! never touches JSON. Control messages are small and carry a JSON body.
//!
//! Fixed headers are #[repr(C, packed)] zerocopy structs in network byte order.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// First byte of every frame.
pub const FRAME_MAGIC: u8 = 0x49;
/// Current frame version.
pub const FRAME_VERSION: u8 = 1;
/// Upper bound on a single chunk payload.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;
/// Upper bound on a whole frame, header included.
pub const MAX_FRAME: usize = MAX_PAYLOAD + 64 * 1024;

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Noise_XX message 1, sent by the client right after TCP connect.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HandshakeInit {
    pub nonce: [u8; 16],
    pub noise_msg: [u8; 32],
}

assert_eq_size!(HandshakeInit, [u8; 48]);

/// Noise_XX message 2, sent by the server.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HandshakeResponse {
    pub nonce: [u8; 16],
    pub noise_msg: [u8; 96],
}

assert_eq_size!(HandshakeResponse, [u8; 112]);

/// Noise_XX message 3, sent by the client.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HandshakeComplete {
    pub noise_msg: [u8; 64],
}

assert_eq_size!(HandshakeComplete, [u8; 64]);

// ── Frame header ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub magic: u8,
    pub version: u8,
    /// One of the [`FrameKind`] discriminants.
    pub kind: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    pub body_len: U32<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 8]);

/// Fixed part of a chunk body.
///
/// Followed by `session_len` bytes of SessionID, `socket_len` bytes of
/// SocketID, then `payload_len` bytes of payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkHeader {
    pub sequence_id: U64<BigEndian>,
    pub session_len: U16<BigEndian>,
    pub socket_len: U16<BigEndian>,
    pub payload_len: U32<BigEndian>,
}

assert_eq_size!(ChunkHeader, [u8; 16]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Chunk = 1,
    Command = 2,
    WorkerReady = 3,
    AuthRequest = 4,
    Response = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Chunk),
            2 => Ok(Self::Command),
            3 => Ok(Self::WorkerReady),
            4 => Ok(Self::AuthRequest),
            5 => Ok(Self::Response),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// The routed data unit.
///
/// `sequence_id` orders chunks per (session, socket, direction). An empty
/// payload marks end of stream for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub session_id: String,
    pub socket_id: String,
    pub sequence_id: u64,
    pub payload: Bytes,
}

impl Chunk {
    pub fn new(
        session_id: impl Into<String>,
        socket_id: impl Into<String>,
        sequence_id: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            socket_id: socket_id.into(),
            sequence_id,
            payload,
        }
    }

    /// End-of-stream marker for a socket.
    pub fn fin(session_id: impl Into<String>, socket_id: impl Into<String>, sequence_id: u64) -> Self {
        Self::new(session_id, socket_id, sequence_id, Bytes::new())
    }

    pub fn is_fin(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Command {
    /// Split a command line on whitespace into verb and arguments.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = words.next()?.to_string();
        Some(Self {
            command,
            args: words.map(str::to_string).collect(),
        })
    }
}

/// Sent by a freshly built pool link to bind itself to a logged-in session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReady {
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub message: String,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Every message a link can carry, decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Chunk(Chunk),
    Command(Command),
    WorkerReady(WorkerReady),
    AuthRequest(AuthRequest),
    Response(Response),
}

impl WireMessage {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Chunk(_) => FrameKind::Chunk,
            Self::Command(_) => FrameKind::Command,
            Self::WorkerReady(_) => FrameKind::WorkerReady,
            Self::AuthRequest(_) => FrameKind::AuthRequest,
            Self::Response(_) => FrameKind::Response,
        }
    }

    /// Encode into a complete frame.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let body = match self {
            Self::Chunk(chunk) => encode_chunk(chunk)?,
            Self::Command(c) => Bytes::from(serde_json::to_vec(c)?),
            Self::WorkerReady(w) => Bytes::from(serde_json::to_vec(w)?),
            Self::AuthRequest(a) => Bytes::from(serde_json::to_vec(a)?),
            Self::Response(r) => Bytes::from(serde_json::to_vec(r)?),
        };

        let header = FrameHeader {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            kind: self.kind() as u8,
            flags: 0,
            body_len: U32::new(body.len() as u32),
        };

        let mut frame = BytesMut::with_capacity(std::mem::size_of::<FrameHeader>() + body.len());
        frame.put_slice(header.as_bytes());
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode a complete frame.
    pub fn decode(frame: Bytes) -> Result<Self, WireError> {
        let header_len = std::mem::size_of::<FrameHeader>();
        let header = FrameHeader::read_from_prefix(&frame[..])
            .ok_or(WireError::Truncated("frame header"))?;

        if header.magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(header.magic));
        }
        if header.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        let kind = FrameKind::try_from(header.kind)?;
        let body_len = header.body_len.get() as usize;
        if frame.len() - header_len != body_len {
            return Err(WireError::LengthMismatch {
                declared: body_len,
                actual: frame.len() - header_len,
            });
        }

        let body = frame.slice(header_len..);
        Ok(match kind {
            FrameKind::Chunk => Self::Chunk(decode_chunk(body)?),
            FrameKind::Command => Self::Command(serde_json::from_slice(&body)?),
            FrameKind::WorkerReady => Self::WorkerReady(serde_json::from_slice(&body)?),
            FrameKind::AuthRequest => Self::AuthRequest(serde_json::from_slice(&body)?),
            FrameKind::Response => Self::Response(serde_json::from_slice(&body)?),
        })
    }
}

impl From<Chunk> for WireMessage {
    fn from(chunk: Chunk) -> Self {
        Self::Chunk(chunk)
    }
}

fn encode_chunk(chunk: &Chunk) -> Result<Bytes, WireError> {
    if chunk.payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(chunk.payload.len()));
    }
    let session_len =
        u16::try_from(chunk.session_id.len()).map_err(|_| WireError::IdentifierTooLong)?;
    let socket_len =
        u16::try_from(chunk.socket_id.len()).map_err(|_| WireError::IdentifierTooLong)?;

    let header = ChunkHeader {
        sequence_id: U64::new(chunk.sequence_id),
        session_len: U16::new(session_len),
        socket_len: U16::new(socket_len),
        payload_len: U32::new(chunk.payload.len() as u32),
    };

    let mut body = BytesMut::with_capacity(
        std::mem::size_of::<ChunkHeader>()
            + chunk.session_id.len()
            + chunk.socket_id.len()
            + chunk.payload.len(),
    );
    body.put_slice(header.as_bytes());
    body.put_slice(chunk.session_id.as_bytes());
    body.put_slice(chunk.socket_id.as_bytes());
    body.put_slice(&chunk.payload);
    Ok(body.freeze())
}

fn decode_chunk(body: Bytes) -> Result<Chunk, WireError> {
    let header =
        ChunkHeader::read_from_prefix(&body[..]).ok_or(WireError::Truncated("chunk header"))?;

    let session_len = header.session_len.get() as usize;
    let socket_len = header.socket_len.get() as usize;
    let payload_len = header.payload_len.get() as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload_len));
    }

    let start = std::mem::size_of::<ChunkHeader>();
    let socket_start = start + session_len;
    let payload_start = socket_start + socket_len;
    if body.len() != payload_start + payload_len {
        return Err(WireError::Truncated("chunk body"));
    }

    let session_id = std::str::from_utf8(&body[start..socket_start])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_string();
    let socket_id = std::str::from_utf8(&body[socket_start..payload_start])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_string();

    Ok(Chunk {
        session_id,
        socket_id,
        sequence_id: header.sequence_id.get(),
        payload: body.slice(payload_start..),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad frame magic 0x{0:02x}")]
    BadMagic(u8),
    #[error("unknown frame version {0}")]
    UnknownVersion(u8),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("frame declares {declared} body bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("chunk payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),
    #[error("session or socket identifier longer than 65535 bytes")]
    IdentifierTooLong,
    #[error("identifier is not valid UTF-8")]
    InvalidUtf8,
    #[error("control body: {0}")]
    Json(#[from] serde_json::Error),
}
