//! Session registry — SessionID → per-session routing state.
//!
//! A session is created on first sight (login or first chunk) and evicted
//! when nothing references it any more: no bound links and no open sockets.
//! Components holding per-session state elsewhere register an eviction hook
//! and drop it there.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::fanout::ResponseFanout;
use crate::link::{ChunkSink, LinkId};
use crate::sequencer::ChunkSequencer;

pub struct Session {
    pub id: String,
    pub fanout: ResponseFanout,
    /// Largest chunk payload seen from the client. Never decreases; sizes the
    /// read buffers of this session's destinations.
    pub max_chunk_size: Arc<AtomicUsize>,
    links: Mutex<HashSet<LinkId>>,
    open_sockets: AtomicUsize,
    bytes_in: AtomicU64,
    created_at: Instant,
}

impl Session {
    fn new(id: String, sequencer: Arc<ChunkSequencer>, initial_chunk_size: usize) -> Self {
        Self {
            fanout: ResponseFanout::new(id.clone(), sequencer),
            id,
            max_chunk_size: Arc::new(AtomicUsize::new(initial_chunk_size)),
            links: Mutex::new(HashSet::new()),
            open_sockets: AtomicUsize::new(0),
            bytes_in: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn observe_chunk_size(&self, len: usize) {
        self.max_chunk_size.fetch_max(len, Ordering::Relaxed);
    }

    pub fn record_in(&self, len: usize) {
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn socket_opened(&self) {
        self.open_sockets.fetch_add(1, Ordering::AcqRel);
    }

    pub fn open_sockets(&self) -> usize {
        self.open_sockets.load(Ordering::Acquire)
    }

    pub fn link_count(&self) -> usize {
        self.lock_links().len()
    }

    fn lock_links(&self) -> std::sync::MutexGuard<'_, HashSet<LinkId>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_idle(&self) -> bool {
        self.lock_links().is_empty() && self.open_sockets() == 0
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut links: Vec<_> = self.lock_links().iter().copied().collect();
        links.sort_unstable();
        SessionSnapshot {
            session_id: self.id.clone(),
            links,
            serving_links: self.fanout.serving_links(),
            max_chunk_size: self.max_chunk_size.load(Ordering::Relaxed),
            open_sockets: self.open_sockets(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.fanout.bytes_out(),
            queued_chunks: self.fanout.queued(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Point-in-time view of a session, as served by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub links: Vec<LinkId>,
    pub serving_links: Vec<LinkId>,
    pub max_chunk_size: usize,
    pub open_sockets: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub queued_chunks: usize,
    pub uptime_secs: u64,
}

/// Called with the id of every session that leaves the registry.
pub type EvictHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Cheap to clone; every link task holds one.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    sequencer: Arc<ChunkSequencer>,
    initial_chunk_size: usize,
    evict_hooks: Arc<RwLock<Vec<EvictHook>>>,
}

impl SessionRegistry {
    pub fn new(initial_chunk_size: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            sequencer: Arc::new(ChunkSequencer::new()),
            initial_chunk_size,
            evict_hooks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Run `hook` whenever a session is evicted or torn down.
    pub fn on_evict(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.evict_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    fn run_evict_hooks(&self, session_id: &str) {
        let hooks = self
            .evict_hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            hook(session_id);
        }
    }

    pub fn sequencer(&self) -> &Arc<ChunkSequencer> {
        &self.sequencer
    }

    /// Create a session with a fresh random id.
    pub fn open(&self) -> Arc<Session> {
        self.ensure(&uuid::Uuid::new_v4().to_string())
    }

    /// Look up a session, creating it if this is the first time it is seen.
    pub fn ensure(&self, session_id: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.get(session_id) {
            return session.clone();
        }
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::info!(session_id, "session created");
                Arc::new(Session::new(
                    session_id.to_string(),
                    self.sequencer.clone(),
                    self.initial_chunk_size,
                ))
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Bind a link to a session without making it a serving link.
    pub fn bind_link(&self, session: &Session, link_id: LinkId) {
        session.lock_links().insert(link_id);
    }

    /// Bind a link and start its fanout writer. Idempotent.
    pub fn attach_serving_link(&self, session: &Session, sink: Arc<dyn ChunkSink>) -> bool {
        self.bind_link(session, sink.link_id());
        session.fanout.register_link(sink)
    }

    /// Called when a link closes: unbind it everywhere and evict sessions that
    /// became idle. Returns the evicted session ids.
    pub fn detach_link(&self, link_id: LinkId) -> Vec<String> {
        let mut touched = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            let was_bound = session.lock_links().remove(&link_id);
            let was_serving = session.fanout.unregister_link(link_id);
            if was_bound || was_serving {
                touched.push(session.id.clone());
            }
        }
        touched
            .into_iter()
            .filter(|id| self.evict_if_idle(id))
            .collect()
    }

    /// Mark one of the session's sockets closed, evicting the session if that
    /// was the last thing keeping it alive.
    pub fn socket_closed(&self, session: &Session) {
        let _ = session
            .open_sockets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.evict_if_idle(&session.id);
    }

    fn evict_if_idle(&self, session_id: &str) -> bool {
        match self.sessions.remove_if(session_id, |_, s| s.is_idle()) {
            Some((_, session)) => {
                session.fanout.close();
                self.sequencer.forget_session(session_id);
                tracing::info!(session_id, "session evicted");
                self.run_evict_hooks(session_id);
                true
            }
            None => false,
        }
    }

    /// Remove a session regardless of references. Its fanout stops accepting
    /// chunks and drains what is queued.
    pub fn teardown(&self, session_id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(session_id)?;
        session.fanout.close();
        for link_id in session.fanout.serving_links() {
            session.fanout.unregister_link(link_id);
        }
        self.sequencer.forget_session(session_id);
        tracing::info!(session_id, "session torn down");
        self.run_evict_hooks(session_id);
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<_> = self.sessions.iter().map(|s| s.snapshot()).collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }
}
