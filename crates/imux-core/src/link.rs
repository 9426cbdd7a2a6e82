//! Secure message link over any byte stream.
//!
//! A link is established with a three-message Noise_XX exchange using the
//! fixed-size handshake structs from [`crate::wire`], then carries encrypted
//! segments:
//!
//!   [u32 BE segment length] [u64 LE nonce] [ciphertext + MAC]
//!
//! A wire frame can be far larger than one Noise message (65535 bytes), so
//! each frame is prefixed with its u32 BE length and the result is cut into
//! plaintext segments of at most [`SEGMENT_PLAINTEXT`] bytes. The reader keeps
//! opening segments until the declared length has arrived.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{
    CryptoError, Keypair, NoiseInitiator, NoiseResponder, Opener, Sealer, SecureSession, NONCE_LEN,
    TAG_LEN,
};
use crate::wire::{
    HandshakeComplete, HandshakeInit, HandshakeResponse, WireError, WireMessage, MAX_FRAME,
};

/// Largest plaintext sealed into a single segment.
pub const SEGMENT_PLAINTEXT: usize = 65_000;
const MAX_SEGMENT: usize = NONCE_LEN + SEGMENT_PLAINTEXT + TAG_LEN;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake: {0}")]
    Crypto(#[from] CryptoError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("segment of {0} bytes exceeds limit")]
    SegmentTooLarge(usize),
    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),
    #[error("link closed by peer")]
    Closed,
}

impl LinkError {
    /// True when the peer went away cleanly between messages.
    pub fn is_closed(&self) -> bool {
        matches!(self, LinkError::Closed)
    }
}

/// A link that finished its handshake and has not been split yet.
pub struct SecureLink<S> {
    stream: S,
    session: SecureSession,
}

impl<S> SecureLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the client side of the handshake over `stream`.
    pub async fn connect(mut stream: S, keypair: &Keypair) -> Result<Self, LinkError> {
        let (initiator, msg1) = NoiseInitiator::new(keypair)?;

        let mut init = HandshakeInit::new_zeroed();
        init.nonce = *initiator.nonce();
        init.noise_msg.copy_from_slice(&msg1);
        stream.write_all(init.as_bytes()).await?;

        let mut buf = [0u8; std::mem::size_of::<HandshakeResponse>()];
        stream.read_exact(&mut buf).await?;
        let response = HandshakeResponse::read_from(&buf[..])
            .ok_or(WireError::Truncated("handshake response"))?;
        let (session, msg3) = initiator.finish(&response.noise_msg, &response.nonce)?;

        let mut complete = HandshakeComplete::new_zeroed();
        complete.noise_msg.copy_from_slice(&msg3);
        stream.write_all(complete.as_bytes()).await?;
        stream.flush().await?;

        Ok(Self { stream, session })
    }

    /// Run the server side of the handshake over `stream`.
    pub async fn accept(mut stream: S, keypair: &Keypair) -> Result<Self, LinkError> {
        let mut buf = [0u8; std::mem::size_of::<HandshakeInit>()];
        stream.read_exact(&mut buf).await?;
        let init =
            HandshakeInit::read_from(&buf[..]).ok_or(WireError::Truncated("handshake init"))?;

        let responder = NoiseResponder::new(keypair)?;
        let mut response = HandshakeResponse::new_zeroed();
        response.nonce = *responder.nonce();
        let (pending, msg2) = responder.respond(&init.noise_msg, &init.nonce)?;
        response.noise_msg.copy_from_slice(&msg2);
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;

        let mut buf = [0u8; std::mem::size_of::<HandshakeComplete>()];
        stream.read_exact(&mut buf).await?;
        let complete = HandshakeComplete::read_from(&buf[..])
            .ok_or(WireError::Truncated("handshake complete"))?;
        let session = pending.finish(&complete.noise_msg)?;

        Ok(Self { stream, session })
    }

    /// Fingerprint of the peer's static key.
    pub fn remote_fingerprint(&self) -> String {
        self.session.remote_fingerprint()
    }

    pub fn link_key(&self) -> [u8; 32] {
        self.session.link_key
    }

    /// Split into a reader for one task and a writer for another.
    pub fn split(self) -> (LinkReader<ReadHalf<S>>, LinkWriter<WriteHalf<S>>) {
        let (sealer, opener) = self.session.split();
        let (read, write) = tokio::io::split(self.stream);
        (
            LinkReader {
                inner: read,
                opener,
                segment: Vec::new(),
                plain: Vec::new(),
            },
            LinkWriter {
                inner: write,
                sealer,
                sealed: Vec::new(),
            },
        )
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct LinkReader<R> {
    inner: R,
    opener: Opener,
    segment: Vec<u8>,
    plain: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LinkReader<R> {
    /// Receive and decode the next message.
    ///
    /// Returns [`LinkError::Closed`] if the peer closed the stream on a
    /// message boundary.
    pub async fn recv(&mut self) -> Result<WireMessage, LinkError> {
        let frame = self.recv_frame().await?;
        Ok(WireMessage::decode(frame)?)
    }

    async fn recv_frame(&mut self) -> Result<Bytes, LinkError> {
        if !self.read_segment(true).await? {
            return Err(LinkError::Closed);
        }
        if self.plain.len() < 4 {
            return Err(WireError::Truncated("message length").into());
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.plain[..4]);
        let total = u32::from_be_bytes(len_bytes) as usize;
        if total > MAX_FRAME {
            return Err(LinkError::MessageTooLarge(total));
        }

        let mut frame = BytesMut::with_capacity(total);
        frame.extend_from_slice(&self.plain[4..]);
        while frame.len() < total {
            self.read_segment(false).await?;
            frame.extend_from_slice(&self.plain);
        }
        if frame.len() != total {
            return Err(WireError::LengthMismatch {
                declared: total,
                actual: frame.len(),
            }
            .into());
        }
        Ok(frame.freeze())
    }

    /// Read and open one segment into `self.plain`. Returns false on a clean
    /// EOF before the first byte when `eof_ok` is set.
    async fn read_segment(&mut self, eof_ok: bool) -> Result<bool, LinkError> {
        let mut len_bytes = [0u8; 4];
        match self.inner.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if eof_ok && e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_SEGMENT {
            return Err(LinkError::SegmentTooLarge(len));
        }

        self.segment.resize(len, 0);
        self.inner.read_exact(&mut self.segment).await?;
        self.opener.open(&self.segment, &mut self.plain)?;
        Ok(true)
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

pub struct LinkWriter<W> {
    inner: W,
    sealer: Sealer,
    sealed: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> LinkWriter<W> {
    /// Encode, seal and write one message.
    pub async fn send(&mut self, msg: &WireMessage) -> Result<(), LinkError> {
        let frame = msg.encode()?;
        if frame.len() > MAX_FRAME {
            return Err(LinkError::MessageTooLarge(frame.len()));
        }

        let mut first = Vec::with_capacity(SEGMENT_PLAINTEXT);
        first.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        let head = frame.len().min(SEGMENT_PLAINTEXT - 4);
        first.extend_from_slice(&frame[..head]);
        self.write_segment(&first).await?;

        for piece in frame[head..].chunks(SEGMENT_PLAINTEXT) {
            self.write_segment(piece).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    async fn write_segment(&mut self, plaintext: &[u8]) -> Result<(), LinkError> {
        self.sealer.seal(plaintext, &mut self.sealed)?;
        self.inner
            .write_all(&(self.sealed.len() as u32).to_be_bytes())
            .await?;
        self.inner.write_all(&self.sealed).await?;
        Ok(())
    }

    /// Flush and close the write direction.
    pub async fn shutdown(&mut self) -> Result<(), LinkError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
