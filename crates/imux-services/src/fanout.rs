//! Response fanout — the return path of a session.
//!
//! Destination readers stamp what they read and publish it onto one shared
//! [`WorkQueue`]. Every serving link has exactly one writer task competing for
//! the next chunk, so the session's return traffic spreads across whichever
//! links are free. The fanout offers delivery, not ordering: the client
//! resequences.
//!
//! A writer whose link fails puts its chunk back at the front of the queue and
//! retires. The serving-link set has its own lock, independent of the queue.
//!
//! The client tunnel runs the same machinery in the other direction, see
//! [`ResponseFanout::upstream`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use imux_core::Chunk;
use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::destination::BoxReader;
use crate::error::{ImuxError, Result};
use crate::link::{ChunkSink, LinkId};
use crate::sequencer::{ChunkSequencer, Direction};
use crate::work_queue::WorkQueue;

/// Smallest read buffer a destination reader uses.
const MIN_READ: usize = 16 * 1024;
/// Queued chunks per writer before readers pause.
const QUEUE_DEPTH_PER_WRITER: usize = 4;

#[derive(Clone)]
pub struct ResponseFanout {
    shared: Arc<FanoutShared>,
}

struct FanoutShared {
    session_id: String,
    queue: WorkQueue<Chunk>,
    writers: Mutex<HashMap<LinkId, WriterEntry>>,
    generation: AtomicU64,
    sequencer: Arc<ChunkSequencer>,
    direction: Direction,
    drained: Notify,
    bytes_out: AtomicU64,
}

struct WriterEntry {
    generation: u64,
    stop: watch::Sender<bool>,
}

impl ResponseFanout {
    pub fn new(session_id: impl Into<String>, sequencer: Arc<ChunkSequencer>) -> Self {
        Self::with_direction(session_id, sequencer, Direction::Downstream)
    }

    /// Fanout for client → server traffic, stamped with upstream ids.
    pub fn upstream(session_id: impl Into<String>, sequencer: Arc<ChunkSequencer>) -> Self {
        Self::with_direction(session_id, sequencer, Direction::Upstream)
    }

    fn with_direction(
        session_id: impl Into<String>,
        sequencer: Arc<ChunkSequencer>,
        direction: Direction,
    ) -> Self {
        Self {
            shared: Arc::new(FanoutShared {
                session_id: session_id.into(),
                queue: WorkQueue::new(),
                writers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                sequencer,
                direction,
                drained: Notify::new(),
                bytes_out: AtomicU64::new(0),
            }),
        }
    }

    /// Start a writer for `sink` unless that link already has one.
    ///
    /// Returns true if a writer was started.
    pub fn register_link(&self, sink: Arc<dyn ChunkSink>) -> bool {
        let link_id = sink.link_id();
        let (stop_tx, stop_rx) = watch::channel(false);
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut writers = self.shared.lock_writers();
            if writers.contains_key(&link_id) {
                return false;
            }
            writers.insert(
                link_id,
                WriterEntry {
                    generation,
                    stop: stop_tx,
                },
            );
        }

        tracing::debug!(
            session_id = %self.shared.session_id,
            link_id,
            "serving link registered"
        );
        let shared = self.shared.clone();
        tokio::spawn(write_loop(shared, sink, generation, stop_rx));
        true
    }

    /// Stop the writer of `link_id`. Returns false if it had none.
    pub fn unregister_link(&self, link_id: LinkId) -> bool {
        let entry = self.shared.lock_writers().remove(&link_id);
        match entry {
            Some(entry) => {
                let _ = entry.stop.send(true);
                tracing::debug!(
                    session_id = %self.shared.session_id,
                    link_id,
                    "serving link unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Queue a chunk for delivery on any serving link.
    ///
    /// With no serving links the chunk stays queued for a link that may still
    /// register, and `SessionUnreachable` is returned.
    pub fn publish(&self, chunk: Chunk) -> Result<()> {
        if !self.shared.queue.push(chunk) {
            return Err(ImuxError::SessionUnreachable(self.shared.session_id.clone()));
        }
        if self.writer_count() == 0 {
            return Err(ImuxError::SessionUnreachable(self.shared.session_id.clone()));
        }
        Ok(())
    }

    /// Read `reader` to EOF, publishing what it yields as chunks of
    /// `socket_id`. EOF (or a read error) publishes the end-of-stream marker.
    ///
    /// Losing every serving link does not end the stream: chunks stay queued
    /// for a link that registers later, and reading pauses at the queue
    /// limit. Only a closed fanout stops the reader early.
    ///
    /// `chunk_size` is read on every iteration so the buffer follows the
    /// session's observed maximum as it grows.
    pub fn spawn_reader(
        &self,
        socket_id: String,
        mut reader: BoxReader,
        chunk_size: Arc<AtomicUsize>,
    ) -> JoinHandle<()> {
        let fanout = self.clone();
        tokio::spawn(async move {
            let session_id = fanout.shared.session_id.clone();
            let mut unreachable_logged = false;
            loop {
                fanout.wait_for_room().await;

                let size = chunk_size.load(Ordering::Relaxed).max(MIN_READ);
                let mut buf = BytesMut::with_capacity(size);
                let read = reader.read_buf(&mut buf).await;
                let sequence_id =
                    fanout
                        .shared
                        .sequencer
                        .next(&session_id, &socket_id, fanout.shared.direction);

                let (chunk, done) = match read {
                    Ok(0) => (Chunk::fin(&*session_id, &*socket_id, sequence_id), true),
                    Ok(_) => (
                        Chunk::new(&*session_id, &*socket_id, sequence_id, buf.freeze()),
                        false,
                    ),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session_id,
                            socket_id = %socket_id,
                            error = %e,
                            "destination read failed, closing socket"
                        );
                        (Chunk::fin(&*session_id, &*socket_id, sequence_id), true)
                    }
                };

                if let Err(e) = fanout.publish(chunk) {
                    if fanout.shared.queue.is_closed() {
                        tracing::error!(
                            session_id = %session_id,
                            socket_id = %socket_id,
                            error = %e,
                            "fanout closed, stopping destination reader"
                        );
                        break;
                    }
                    if !unreachable_logged {
                        tracing::warn!(
                            session_id = %session_id,
                            socket_id = %socket_id,
                            error = %e,
                            "no serving links, holding chunks"
                        );
                        unreachable_logged = true;
                    }
                }
                if done {
                    tracing::debug!(session_id = %session_id, socket_id = %socket_id, "destination reached EOF");
                    break;
                }
            }
        })
    }

    async fn wait_for_room(&self) {
        loop {
            let limit = self.writer_count().max(1) * QUEUE_DEPTH_PER_WRITER;
            if self.shared.queue.len() < limit {
                return;
            }
            // Writers signal after every send; the timeout covers a signal
            // that fired before we started waiting.
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                self.shared.drained.notified(),
            )
            .await;
        }
    }

    pub fn writer_count(&self) -> usize {
        self.shared.lock_writers().len()
    }

    pub fn serving_links(&self) -> Vec<LinkId> {
        let mut links: Vec<_> = self.shared.lock_writers().keys().copied().collect();
        links.sort_unstable();
        links
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn bytes_out(&self) -> u64 {
        self.shared.bytes_out.load(Ordering::Relaxed)
    }

    /// Stop accepting chunks. Writers drain what is queued, then exit.
    pub fn close(&self) {
        self.shared.queue.close();
    }
}

impl FanoutShared {
    fn lock_writers(&self) -> std::sync::MutexGuard<'_, HashMap<LinkId, WriterEntry>> {
        self.writers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove a writer entry, but only the one this generation installed.
    fn retire(&self, link_id: LinkId, generation: u64) -> usize {
        let mut writers = self.lock_writers();
        if writers
            .get(&link_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            writers.remove(&link_id);
        }
        writers.len()
    }
}

async fn write_loop(
    shared: Arc<FanoutShared>,
    sink: Arc<dyn ChunkSink>,
    generation: u64,
    mut stop: watch::Receiver<bool>,
) {
    let link_id = sink.link_id();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = shared.queue.pop() => match next {
                Some(chunk) => chunk,
                None => break,
            },
        };

        match sink.send_chunk(&chunk).await {
            Ok(()) => {
                shared
                    .bytes_out
                    .fetch_add(chunk.payload.len() as u64, Ordering::Relaxed);
                shared.drained.notify_waiters();
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %shared.session_id,
                    socket_id = %chunk.socket_id,
                    sequence_id = chunk.sequence_id,
                    link_id,
                    error = %e,
                    "serving link failed, requeueing chunk"
                );
                shared.queue.requeue(chunk);
                let remaining = shared.retire(link_id, generation);
                if remaining == 0 {
                    tracing::error!(
                        session_id = %shared.session_id,
                        queued = shared.queue.len(),
                        "{}",
                        ImuxError::SessionUnreachable(shared.session_id.clone())
                    );
                }
                return;
            }
        }
    }
    shared.retire(link_id, generation);
}
