//! Chunk producer — slices files into sequenced chunks and hands them to
//! whichever pool worker asks next.
//!
//! `pull` reads the next piece and stamps its SequenceID under one lock, so a
//! piece is only ever issued once. A worker that cannot send its piece gives it
//! back with `requeue` and retires; another worker picks it up. A file is
//! complete when its end-of-stream marker has been read and every piece issued
//! for it has been confirmed.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use imux_core::Chunk;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;

use crate::destination::SocketTarget;
use crate::error::{ImuxError, Result};
use crate::link::ChunkSink;
use crate::progress::{flush_meters, spawn_sampler, ProgressEvent, WorkerMeter};

/// One local file to upload.
#[derive(Debug, Clone)]
pub struct FileJob {
    /// Name on the server, relative to the session directory.
    pub name: String,
    pub path: PathBuf,
    /// Bytes already present on the server; reading starts here.
    pub offset: u64,
}

/// A chunk plus the file it belongs to.
#[derive(Debug, Clone)]
pub struct Piece {
    file: usize,
    pub chunk: Chunk,
}

struct FileState {
    job: FileJob,
    socket_id: String,
    size: u64,
    next_sequence: u64,
    issued: u64,
    confirmed: u64,
    exhausted: bool,
    completed: bool,
}

struct SourceState {
    files: Vec<FileState>,
    current: usize,
    open: Option<tokio::fs::File>,
    returned: VecDeque<Piece>,
    in_flight: usize,
}

enum Next {
    Piece(Piece),
    Wait,
    Done,
}

pub struct ChunkProducer {
    session_id: String,
    chunk_size: usize,
    state: Mutex<SourceState>,
    changed: Notify,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

/// What a finished transfer moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub files: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl ChunkProducer {
    /// Stat every file up front so a missing file fails before any link is
    /// used.
    pub async fn new(
        session_id: impl Into<String>,
        jobs: Vec<FileJob>,
        chunk_size: usize,
        events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<Self> {
        let mut files = Vec::with_capacity(jobs.len());
        for job in jobs {
            let size = tokio::fs::metadata(&job.path).await?.len();
            let socket_id = SocketTarget::Put {
                offset: job.offset.min(size),
                name: job.name.clone(),
            }
            .to_string();
            files.push(FileState {
                job,
                socket_id,
                size,
                next_sequence: 0,
                issued: 0,
                confirmed: 0,
                exhausted: false,
                completed: false,
            });
        }
        Ok(Self {
            session_id: session_id.into(),
            chunk_size: chunk_size.max(1),
            state: Mutex::new(SourceState {
                files,
                current: 0,
                open: None,
                returned: VecDeque::new(),
                in_flight: 0,
            }),
            changed: Notify::new(),
            events,
        })
    }

    /// Bytes this producer will read in total.
    pub async fn total_bytes(&self) -> u64 {
        let state = self.state.lock().await;
        state
            .files
            .iter()
            .map(|f| f.size.saturating_sub(f.job.offset))
            .sum()
    }

    pub async fn file_count(&self) -> usize {
        self.state.lock().await.files.len()
    }

    /// Next piece to send, or `None` once every piece has been confirmed.
    ///
    /// While pieces are still in flight on other workers this waits, since a
    /// failing worker may hand its piece back.
    pub async fn pull(&self) -> Result<Option<Piece>> {
        loop {
            let changed = self.changed.notified();
            match self.next_piece().await? {
                Next::Piece(piece) => return Ok(Some(piece)),
                Next::Done => return Ok(None),
                Next::Wait => changed.await,
            }
        }
    }

    async fn next_piece(&self) -> Result<Next> {
        let mut state = self.state.lock().await;
        if let Some(piece) = state.returned.pop_front() {
            state.in_flight += 1;
            return Ok(Next::Piece(piece));
        }

        while state.current < state.files.len() {
            let index = state.current;
            if state.open.is_none() {
                let file = &state.files[index];
                let mut handle = tokio::fs::File::open(&file.job.path).await?;
                let start = file.job.offset.min(file.size);
                if start > 0 {
                    handle.seek(std::io::SeekFrom::Start(start)).await?;
                }
                state.open = Some(handle);
            }

            let mut buf = Vec::with_capacity(self.chunk_size);
            if let Some(handle) = state.open.as_mut() {
                handle
                    .take(self.chunk_size as u64)
                    .read_to_end(&mut buf)
                    .await?;
            }

            let file = &mut state.files[index];
            let sequence_id = file.next_sequence;
            file.next_sequence += 1;
            file.issued += 1;
            let chunk = if buf.is_empty() {
                file.exhausted = true;
                Chunk::fin(&*self.session_id, &*file.socket_id, sequence_id)
            } else {
                Chunk::new(&*self.session_id, &*file.socket_id, sequence_id, Bytes::from(buf))
            };
            if file.exhausted {
                state.current += 1;
                state.open = None;
            }
            state.in_flight += 1;
            return Ok(Next::Piece(Piece { file: index, chunk }));
        }

        Ok(if state.in_flight == 0 {
            Next::Done
        } else {
            Next::Wait
        })
    }

    /// Give back a piece that could not be sent.
    pub async fn requeue(&self, piece: Piece) {
        {
            let mut state = self.state.lock().await;
            state.in_flight -= 1;
            state.returned.push_back(piece);
        }
        self.changed.notify_waiters();
    }

    /// Record that a piece was handed to a link.
    pub async fn confirm(&self, piece: &Piece) {
        let finished = {
            let mut state = self.state.lock().await;
            state.in_flight -= 1;
            let file = &mut state.files[piece.file];
            file.confirmed += 1;
            if file.exhausted && !file.completed && file.confirmed == file.issued {
                file.completed = true;
                Some(file.job.name.clone())
            } else {
                None
            }
        };
        if let Some(name) = finished {
            tracing::info!(file = %name, "file sent");
            if let Some(events) = &self.events {
                let _ = events.send(ProgressEvent::FileCompleted { name });
            }
        }
        self.changed.notify_waiters();
    }

    /// Names of files not yet complete.
    pub async fn incomplete(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .files
            .iter()
            .filter(|f| !f.completed)
            .map(|f| f.job.name.clone())
            .collect()
    }

    /// Drive the transfer with one worker per sink until every piece is
    /// confirmed or every worker has failed.
    pub async fn run<S>(self: Arc<Self>, sinks: Vec<Arc<S>>) -> Result<TransferReport>
    where
        S: ChunkSink + ?Sized + 'static,
    {
        let started = Instant::now();
        let meters: Vec<_> = sinks.iter().map(|_| Arc::new(WorkerMeter::default())).collect();
        let sampler = self
            .events
            .clone()
            .map(|tx| spawn_sampler(meters.clone(), Duration::from_secs(1), tx));

        let mut workers = JoinSet::new();
        for (sink, meter) in sinks.into_iter().zip(meters.iter().cloned()) {
            workers.spawn(run_worker(self.clone(), sink, meter));
        }

        let mut local_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) | Ok(Err(ImuxError::WriteFailure(_))) => {}
                Ok(Err(e)) => {
                    // A local read error is not something another link can fix.
                    tracing::error!(error = %e, "transfer worker failed");
                    local_error.get_or_insert(e);
                    workers.abort_all();
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!(error = %e, "transfer worker panicked"),
            }
        }

        if let Some(sampler) = sampler {
            sampler.abort();
        }
        if let Some(events) = &self.events {
            let _ = flush_meters(&meters, started.elapsed().max(Duration::from_millis(1)), events);
        }
        if let Some(e) = local_error {
            return Err(e);
        }

        let incomplete = self.incomplete().await;
        if !incomplete.is_empty() {
            return Err(ImuxError::TransferAborted { incomplete });
        }

        let state = self.state.lock().await;
        Ok(TransferReport {
            files: state.files.len(),
            bytes: state
                .files
                .iter()
                .map(|f| f.size.saturating_sub(f.job.offset))
                .sum(),
            elapsed: started.elapsed(),
        })
    }
}

async fn run_worker<S>(
    producer: Arc<ChunkProducer>,
    sink: Arc<S>,
    meter: Arc<WorkerMeter>,
) -> Result<()>
where
    S: ChunkSink + ?Sized,
{
    while let Some(piece) = producer.pull().await? {
        match sink.send_chunk(&piece.chunk).await {
            Ok(()) => {
                meter.add(piece.chunk.payload.len() as u64);
                producer.confirm(&piece).await;
            }
            Err(e) => {
                tracing::warn!(
                    link_id = sink.link_id(),
                    socket_id = %piece.chunk.socket_id,
                    sequence_id = piece.chunk.sequence_id,
                    error = %e,
                    "link failed, returning piece"
                );
                producer.requeue(piece).await;
                return Err(ImuxError::write_failure(e));
            }
        }
    }
    Ok(())
}
