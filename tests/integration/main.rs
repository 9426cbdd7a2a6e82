//! imux integration test harness.
//!
//! These tests drive the routing engine in-process: destinations are
//! `tokio::io::duplex` pipes and transport links are either test doubles or
//! real secure links over loopback TCP. No root or network setup needed.
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, DuplexStream};

use imux_core::Chunk;
use imux_services::destination::{Destination, Dialer};
use imux_services::{ChunkSink, ImuxError, LinkId, Result};

mod end_to_end;
mod pool;
mod producer;
mod redelivery;
mod sequencing;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Hands out an in-memory pipe per dial and keeps the far ends by SocketID.
pub struct PipeDialer {
    pub dials: AtomicUsize,
    /// Delay before each dial completes, to widen race windows.
    delay: Duration,
    far_ends: Mutex<HashMap<String, DuplexStream>>,
}

impl PipeDialer {
    pub fn new() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            dials: AtomicUsize::new(0),
            delay,
            far_ends: Mutex::new(HashMap::new()),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Take the destination side of a dialed socket.
    pub fn far_end(&self, socket_id: &str) -> DuplexStream {
        self.far_ends
            .lock()
            .unwrap()
            .remove(socket_id)
            .unwrap_or_else(|| panic!("socket {socket_id} was never dialed"))
    }
}

#[async_trait]
impl Dialer for PipeDialer {
    async fn dial(&self, _session_id: &str, socket_id: &str) -> std::io::Result<Destination> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let (near, far) = tokio::io::duplex(1 << 20);
        self.far_ends
            .lock()
            .unwrap()
            .insert(socket_id.to_string(), far);
        let (read, write) = tokio::io::split(near);
        Ok(Destination {
            reader: Some(Box::new(read)),
            writer: Box::new(write),
        })
    }
}

/// A link that records every chunk it is asked to send.
pub struct CollectSink {
    pub id: LinkId,
    pub got: Mutex<Vec<Chunk>>,
}

impl CollectSink {
    pub fn new(id: LinkId) -> Arc<Self> {
        Arc::new(Self {
            id,
            got: Mutex::new(Vec::new()),
        })
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.got.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkSink for CollectSink {
    fn link_id(&self) -> LinkId {
        self.id
    }

    async fn send_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.got.lock().unwrap().push(chunk.clone());
        Ok(())
    }
}

/// A link that always fails.
pub struct DeadSink(pub LinkId);

#[async_trait]
impl ChunkSink for DeadSink {
    fn link_id(&self) -> LinkId {
        self.0
    }

    async fn send_chunk(&self, _chunk: &Chunk) -> Result<()> {
        Err(ImuxError::WriteFailure("connection reset".into()))
    }
}

/// Read a destination until its writer shuts down.
pub async fn read_to_end(mut far: DuplexStream) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(WAIT, far.read_to_end(&mut out))
        .await
        .expect("destination never closed")
        .expect("destination read failed");
    out
}
