//! Transport link handles shared by the router, fanout and producer.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use imux_core::{Chunk, LinkWriter, WireMessage};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use crate::error::{ImuxError, Result};

/// Process-unique identity of one transport link.
pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_link_id() -> LinkId {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Anything a chunk can be written to: a pool link, or a test double.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    fn link_id(&self) -> LinkId;

    /// Write one chunk. An error means the link is no longer usable.
    async fn send_chunk(&self, chunk: &Chunk) -> Result<()>;
}

/// The sending half of a secure link, shareable across tasks.
///
/// Sends are serialized by an async mutex so one frame is never interleaved
/// with another.
pub struct LinkSender<W> {
    id: LinkId,
    writer: Mutex<LinkWriter<W>>,
}

impl<W: AsyncWrite + Unpin + Send> LinkSender<W> {
    pub fn new(id: LinkId, writer: LinkWriter<W>) -> Self {
        Self {
            id,
            writer: Mutex::new(writer),
        }
    }

    pub async fn send(&self, msg: &WireMessage) -> Result<()> {
        self.writer.lock().await.send(msg).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkSink for LinkSender<W> {
    fn link_id(&self) -> LinkId {
        self.id
    }

    async fn send_chunk(&self, chunk: &Chunk) -> Result<()> {
        // The frame encoder wants an owned message; the payload is a
        // refcounted Bytes so this does not copy data.
        let msg = WireMessage::Chunk(chunk.clone());
        self.writer
            .lock()
            .await
            .send(&msg)
            .await
            .map_err(ImuxError::write_failure)
    }
}
