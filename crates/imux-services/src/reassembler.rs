//! Client-side reassembly of the return path.
//!
//! Chunks for one SocketID can arrive on any pool link, in any order. Each
//! registered socket owns a [`ReorderBuffer`] and a local sink behind one async
//! mutex, held across accept and write, so bytes reach the sink in sequence
//! order no matter which link delivered them.

use std::sync::Arc;

use dashmap::DashMap;
use imux_core::Chunk;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::destination::{BoxWriter, SocketTarget};
use crate::error::{ImuxError, Result};
use crate::progress::ProgressEvent;
use crate::sequencer::ReorderBuffer;

struct SinkSlot {
    buffer: ReorderBuffer,
    writer: BoxWriter,
    written: u64,
    closed: bool,
}

pub struct Reassembler {
    sinks: DashMap<String, Arc<Mutex<SinkSlot>>>,
    limit: usize,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    emptied: Notify,
}

impl Reassembler {
    pub fn new(limit: usize, events: Option<mpsc::UnboundedSender<ProgressEvent>>) -> Self {
        Self {
            sinks: DashMap::new(),
            limit,
            events,
            emptied: Notify::new(),
        }
    }

    /// Route future chunks of `socket_id` into `writer`.
    pub fn register(&self, socket_id: impl Into<String>, writer: BoxWriter) {
        let socket_id = socket_id.into();
        let slot = SinkSlot {
            buffer: ReorderBuffer::new(socket_id.clone(), self.limit),
            writer,
            written: 0,
            closed: false,
        };
        self.sinks.insert(socket_id, Arc::new(Mutex::new(slot)));
    }

    pub fn is_registered(&self, socket_id: &str) -> bool {
        self.sinks.contains_key(socket_id)
    }

    pub fn open_sinks(&self) -> usize {
        self.sinks.len()
    }

    /// Accept one chunk from any link.
    ///
    /// Chunks for sockets nobody registered are dropped. A write failure or
    /// reorder overflow closes that socket's sink and is returned.
    pub async fn deliver(&self, chunk: Chunk) -> Result<()> {
        let Some(slot) = self.sinks.get(&chunk.socket_id).map(|s| s.clone()) else {
            tracing::warn!(
                session_id = %chunk.session_id,
                socket_id = %chunk.socket_id,
                sequence_id = chunk.sequence_id,
                "chunk for unknown socket, dropping"
            );
            return Ok(());
        };

        let socket_id = chunk.socket_id.clone();
        let mut slot = slot.lock().await;
        if slot.closed {
            return Ok(());
        }

        let outcome = self.write_run(&mut slot, chunk).await;
        match outcome {
            Ok(false) => Ok(()),
            Ok(true) => {
                slot.closed = true;
                tracing::info!(socket_id = %socket_id, bytes = slot.written, "socket complete");
                self.retire(&socket_id);
                if let Some(events) = &self.events {
                    let name = match SocketTarget::parse(&socket_id) {
                        SocketTarget::Get { name } | SocketTarget::Put { name, .. } => name,
                        SocketTarget::Tunnel(id) => id,
                    };
                    let _ = events.send(ProgressEvent::FileCompleted { name });
                }
                Ok(())
            }
            Err(e) => {
                slot.closed = true;
                tracing::error!(socket_id = %socket_id, error = %e, "closing local sink");
                let _ = slot.writer.shutdown().await;
                self.retire(&socket_id);
                Err(e)
            }
        }
    }

    /// Returns true once the end-of-stream marker has been written.
    async fn write_run(&self, slot: &mut SinkSlot, chunk: Chunk) -> Result<bool> {
        for chunk in slot.buffer.accept(chunk)? {
            if chunk.is_fin() {
                slot.writer.flush().await.map_err(ImuxError::write_failure)?;
                slot.writer.shutdown().await.map_err(ImuxError::write_failure)?;
                return Ok(true);
            }
            slot.writer
                .write_all(&chunk.payload)
                .await
                .map_err(ImuxError::write_failure)?;
            slot.written += chunk.payload.len() as u64;
            if let Some(events) = &self.events {
                let _ = events.send(ProgressEvent::Moved(chunk.payload.len() as u64));
            }
        }
        Ok(false)
    }

    fn retire(&self, socket_id: &str) {
        self.sinks.remove(socket_id);
        if self.sinks.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    /// Wait until every registered sink has completed or failed.
    pub async fn wait_idle(&self) {
        loop {
            let emptied = self.emptied.notified();
            if self.sinks.is_empty() {
                return;
            }
            emptied.await;
        }
    }

    /// Drop every sink, e.g. when the last link is gone.
    pub fn abandon(&self) -> Vec<String> {
        let ids: Vec<String> = self.sinks.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.sinks.remove(id);
        }
        self.emptied.notify_waiters();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn chunk(seq: u64, data: &'static [u8]) -> Chunk {
        Chunk::new("s", "get:a.txt", seq, Bytes::from_static(data))
    }

    #[tokio::test]
    async fn out_of_order_arrivals_are_written_in_order() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let r = Reassembler::new(16, Some(tx));
        r.register("get:a.txt", Box::new(near));

        r.deliver(chunk(2, b"c")).await.unwrap();
        r.deliver(chunk(0, b"a")).await.unwrap();
        r.deliver(Chunk::fin("s", "get:a.txt", 3)).await.unwrap();
        r.deliver(chunk(1, b"b")).await.unwrap();

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"abc");
        assert_eq!(r.open_sinks(), 0);
        tokio::time::timeout(Duration::from_secs(1), r.wait_idle())
            .await
            .unwrap();

        let mut completed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::FileCompleted { name } = event {
                completed.push(name);
            }
        }
        assert_eq!(completed, vec!["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn unknown_socket_is_dropped() {
        let r = Reassembler::new(16, None);
        r.deliver(chunk(0, b"x")).await.unwrap();
        assert_eq!(r.open_sinks(), 0);
    }

    #[tokio::test]
    async fn overflow_closes_the_sink() {
        let (near, _far) = tokio::io::duplex(1024);
        let r = Reassembler::new(1, None);
        r.register("get:a.txt", Box::new(near));

        r.deliver(chunk(5, b"x")).await.unwrap();
        let err = r.deliver(chunk(6, b"y")).await.unwrap_err();
        assert!(matches!(err, ImuxError::SequenceGapTimeout { .. }));
        assert!(!r.is_registered("get:a.txt"));
    }
}
