//! Destination router — the forward path.
//!
//! Every inbound chunk is routed by (SessionID, SocketID) to that socket's
//! write queue. The first chunk for a socket dials its destination; concurrent
//! first arrivals wait on the same once-cell, so there is exactly one dial per
//! socket. The socket map is only locked for lookup and insert, never across
//! the dial or a write.
//!
//! Each write queue is drained by one writer task that resequences with a
//! [`ReorderBuffer`] and writes payloads in order. The end-of-stream marker
//! shuts the destination down and retires the socket.
//!
//! A retired socket keeps its slot until the session is evicted, so a late
//! duplicate finds the closed queue and is dropped instead of dialing the
//! destination a second time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use imux_core::Chunk;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OnceCell};

use crate::destination::{BoxWriter, Dialer};
use crate::error::{ImuxError, Result};
use crate::link::ChunkSink;
use crate::registry::{Session, SessionRegistry};
use crate::sequencer::ReorderBuffer;

type SocketKey = (String, String);
type SocketMap = Arc<DashMap<SocketKey, Arc<SocketSlot>>>;

#[derive(Default)]
struct SocketSlot {
    queue: OnceCell<WriteQueue>,
    /// Set once the end-of-stream marker was written.
    finished: AtomicBool,
}

/// Sending side of one destination's writer task. Sends fail once the
/// writer has stopped, which makes the queue inert.
struct WriteQueue {
    tx: mpsc::UnboundedSender<Chunk>,
}

pub struct DestinationRouter {
    registry: SessionRegistry,
    dialer: Arc<dyn Dialer>,
    sockets: SocketMap,
    reorder_limit: usize,
}

impl DestinationRouter {
    pub fn new(registry: SessionRegistry, dialer: Arc<dyn Dialer>, reorder_limit: usize) -> Self {
        let sockets: SocketMap = Arc::new(DashMap::new());
        {
            let sockets = sockets.clone();
            registry.on_evict(move |session_id| {
                sockets.retain(|(session, _), _| session != session_id);
            });
        }
        Self {
            registry,
            dialer,
            sockets,
            reorder_limit,
        }
    }

    /// Route one chunk that arrived on `link`.
    ///
    /// Also ensures the session exists, records the observed chunk size and
    /// makes `link` a serving link of the session.
    pub async fn route(&self, chunk: Chunk, link: Arc<dyn ChunkSink>) -> Result<()> {
        let session = self.registry.ensure(&chunk.session_id);
        session.observe_chunk_size(chunk.payload.len());
        session.record_in(chunk.payload.len());
        self.registry.attach_serving_link(&session, link);

        let key = (chunk.session_id.clone(), chunk.socket_id.clone());
        let slot = self.sockets.entry(key.clone()).or_default().clone();

        let queue = match slot
            .queue
            .get_or_try_init(|| self.open_socket(session.clone(), &chunk.socket_id, slot.clone()))
            .await
        {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(
                    session_id = %chunk.session_id,
                    socket_id = %chunk.socket_id,
                    sequence_id = chunk.sequence_id,
                    error = %e,
                    "dial failed, dropping chunk"
                );
                self.sockets
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                return Err(e);
            }
        };

        let sequence_id = chunk.sequence_id;
        if queue.tx.send(chunk).is_err() {
            if slot.finished.load(Ordering::Acquire) {
                tracing::debug!(
                    session_id = %key.0,
                    socket_id = %key.1,
                    sequence_id,
                    "chunk for finished socket, dropping"
                );
                return Ok(());
            }
            tracing::warn!(
                session_id = %key.0,
                socket_id = %key.1,
                sequence_id,
                "write queue closed, dropping chunk"
            );
            return Err(ImuxError::WriteFailure(format!(
                "socket {} is no longer writable",
                key.1
            )));
        }
        Ok(())
    }

    async fn open_socket(
        &self,
        session: Arc<Session>,
        socket_id: &str,
        slot: Arc<SocketSlot>,
    ) -> Result<WriteQueue> {
        let destination = self
            .dialer
            .dial(&session.id, socket_id)
            .await
            .map_err(|source| ImuxError::DialFailure {
                session_id: session.id.clone(),
                socket_id: socket_id.to_string(),
                source,
            })?;

        session.socket_opened();
        tracing::info!(session_id = %session.id, socket_id, "destination opened");

        if let Some(reader) = destination.reader {
            session.fanout.spawn_reader(
                socket_id.to_string(),
                reader,
                session.max_chunk_size.clone(),
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = SocketWriter {
            session,
            socket_id: socket_id.to_string(),
            writer: destination.writer,
            buffer: ReorderBuffer::new(socket_id, self.reorder_limit),
            rx,
            slot,
            registry: self.registry.clone(),
        };
        tokio::spawn(writer.run());
        Ok(WriteQueue { tx })
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }
}

/// The single writer of one destination.
struct SocketWriter {
    session: Arc<Session>,
    socket_id: String,
    writer: BoxWriter,
    buffer: ReorderBuffer,
    rx: mpsc::UnboundedReceiver<Chunk>,
    slot: Arc<SocketSlot>,
    registry: SessionRegistry,
}

enum WriterExit {
    Finished,
    Failed,
    Abandoned,
}

impl SocketWriter {
    async fn run(mut self) {
        let exit = self.drain().await;
        if matches!(exit, WriterExit::Finished) {
            self.slot.finished.store(true, Ordering::Release);
        }
        self.rx.close();

        // Finished and failed slots both stay until the session goes, so
        // later chunks hit the closed queue instead of redialing.
        match exit {
            WriterExit::Finished => {
                tracing::info!(
                    session_id = %self.session.id,
                    socket_id = %self.socket_id,
                    "destination closed by end of stream"
                );
            }
            WriterExit::Failed => {}
            WriterExit::Abandoned => {
                let _ = self.writer.shutdown().await;
            }
        }
        self.registry.socket_closed(&self.session);
    }

    async fn drain(&mut self) -> WriterExit {
        while let Some(chunk) = self.rx.recv().await {
            let run = match self.buffer.accept(chunk) {
                Ok(run) => run,
                Err(e) => {
                    tracing::error!(
                        session_id = %self.session.id,
                        socket_id = %self.socket_id,
                        error = %e,
                        "closing socket"
                    );
                    return WriterExit::Failed;
                }
            };

            for chunk in run {
                if chunk.is_fin() {
                    if let Err(e) = self.writer.shutdown().await {
                        tracing::warn!(socket_id = %self.socket_id, error = %e, "destination shutdown failed");
                    }
                    return WriterExit::Finished;
                }
                if let Err(e) = self.writer.write_all(&chunk.payload).await {
                    tracing::error!(
                        session_id = %self.session.id,
                        socket_id = %self.socket_id,
                        sequence_id = chunk.sequence_id,
                        error = %ImuxError::write_failure(e),
                        "destination write failed, closing socket"
                    );
                    return WriterExit::Failed;
                }
                tracing::debug!(
                    socket_id = %self.socket_id,
                    sequence_id = chunk.sequence_id,
                    bytes = chunk.payload.len(),
                    "chunk written"
                );
            }
        }
        WriterExit::Abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::link::LinkId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullSink(LinkId);

    #[async_trait]
    impl ChunkSink for NullSink {
        fn link_id(&self) -> LinkId {
            self.0
        }
        async fn send_chunk(&self, _chunk: &Chunk) -> Result<()> {
            Ok(())
        }
    }

    /// Fails the first `failures` dials, then hands out in-memory pipes.
    struct FlakyDialer {
        failures: AtomicUsize,
        dials: AtomicUsize,
        far_ends: std::sync::Mutex<Vec<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl Dialer for FlakyDialer {
        async fn dial(&self, _session: &str, _socket: &str) -> std::io::Result<Destination> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(std::io::ErrorKind::ConnectionRefused.into());
            }
            let (near, far) = tokio::io::duplex(1024);
            self.far_ends.lock().unwrap().push(far);
            Ok(Destination {
                reader: None,
                writer: Box::new(near),
            })
        }
    }

    fn flaky(failures: usize) -> Arc<FlakyDialer> {
        Arc::new(FlakyDialer {
            failures: AtomicUsize::new(failures),
            dials: AtomicUsize::new(0),
            far_ends: std::sync::Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn dial_failure_drops_chunk_and_is_retried() {
        let dialer = flaky(1);
        let registry = SessionRegistry::new(1024);
        let router = DestinationRouter::new(registry.clone(), dialer.clone(), 16);
        let link: Arc<dyn ChunkSink> = Arc::new(NullSink(1));

        let first = Chunk::new("s", "k", 0, bytes::Bytes::from_static(b"lost"));
        let err = router.route(first, link.clone()).await.unwrap_err();
        assert!(matches!(err, ImuxError::DialFailure { .. }));
        assert_eq!(router.socket_count(), 0);

        // The retry re-dials. Sequence 0 was dropped, so resend it.
        let again = Chunk::new("s", "k", 0, bytes::Bytes::from_static(b"ok"));
        router.route(again, link).await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(router.socket_count(), 1);
        assert_eq!(registry.ensure("s").open_sockets(), 1);
    }

    #[tokio::test]
    async fn fin_retires_the_socket() {
        let dialer = flaky(0);
        let registry = SessionRegistry::new(1024);
        let router = DestinationRouter::new(registry.clone(), dialer.clone(), 16);
        let link: Arc<dyn ChunkSink> = Arc::new(NullSink(1));

        router
            .route(Chunk::new("s", "k", 0, bytes::Bytes::from_static(b"abc")), link.clone())
            .await
            .unwrap();
        router.route(Chunk::fin("s", "k", 1), link.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The slot stays behind as a tombstone until the session goes.
        assert_eq!(router.socket_count(), 1);
        assert_eq!(registry.ensure("s").open_sockets(), 0);
        registry.detach_link(1);
        assert_eq!(router.socket_count(), 0);
        let mut far = dialer.far_ends.lock().unwrap().pop().unwrap();
        let mut got = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut far, &mut got)
            .await
            .unwrap();
        assert_eq!(got, b"abc");
    }

    /// Writes `put:` sockets as files under a directory.
    struct UploadDialer {
        root: std::path::PathBuf,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for UploadDialer {
        async fn dial(&self, _session: &str, socket: &str) -> std::io::Result<Destination> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let crate::destination::SocketTarget::Put { offset, name } =
                crate::destination::SocketTarget::parse(socket)
            else {
                return Err(std::io::ErrorKind::InvalidInput.into());
            };
            let file = crate::destination::open_upload(&self.root.join(name), offset).await?;
            Ok(Destination {
                reader: None,
                writer: Box::new(file),
            })
        }
    }

    #[tokio::test]
    async fn late_duplicate_does_not_reopen_a_finished_upload() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = Arc::new(UploadDialer {
            root: dir.path().to_path_buf(),
            dials: AtomicUsize::new(0),
        });
        let router = DestinationRouter::new(SessionRegistry::new(1024), dialer.clone(), 16);
        let link: Arc<dyn ChunkSink> = Arc::new(NullSink(1));
        let path = dir.path().join("f.bin");

        let hello = Chunk::new("s", "put:0:f.bin", 0, bytes::Bytes::from_static(b"hello "));
        let world = Chunk::new("s", "put:0:f.bin", 1, bytes::Bytes::from_static(b"world"));
        router.route(hello, link.clone()).await.unwrap();
        router.route(world.clone(), link.clone()).await.unwrap();
        router.route(Chunk::fin("s", "put:0:f.bin", 2), link.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");

        router.route(world, link.clone()).await.unwrap();
        router.route(Chunk::fin("s", "put:0:f.bin", 2), link).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn failed_socket_is_forgotten_when_its_session_is_evicted() {
        let dialer = flaky(0);
        let registry = SessionRegistry::new(1024);
        let router = DestinationRouter::new(registry.clone(), dialer.clone(), 16);
        let link: Arc<dyn ChunkSink> = Arc::new(NullSink(1));

        // Larger than the pipe, so the writer blocks until the far end goes.
        let big = bytes::Bytes::from(vec![0u8; 4096]);
        router.route(Chunk::new("s", "k", 0, big), link).await.unwrap();
        assert!(registry.detach_link(1).is_empty());
        assert_eq!(registry.len(), 1);

        drop(dialer.far_ends.lock().unwrap().pop());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(registry.is_empty());
        assert_eq!(router.socket_count(), 0);
    }
}
