//! Chunk sequencing — stamping on the way out, resequencing on the way in.
//!
//! Ordering is per (session, socket, direction). Sending sides stamp chunks
//! with [`ChunkSequencer::next`]; every consuming side feeds arrivals through a
//! [`ReorderBuffer`], which releases only the contiguous run starting at the
//! next expected id. Nothing orders chunks across sockets.

use std::collections::BTreeMap;

use dashmap::DashMap;
use imux_core::Chunk;

use crate::error::{ImuxError, Result};

/// Which way a chunk travels relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client → destination.
    Upstream,
    /// Destination → client.
    Downstream,
}

/// Hands out sequence ids. Each (session, socket, direction) starts at 0.
#[derive(Default)]
pub struct ChunkSequencer {
    counters: DashMap<(String, String, Direction), u64>,
}

impl ChunkSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, session_id: &str, socket_id: &str, direction: Direction) -> u64 {
        let mut counter = self
            .counters
            .entry((session_id.to_string(), socket_id.to_string(), direction))
            .or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    /// Drop the counters of one socket once its stream has ended.
    pub fn forget(&self, session_id: &str, socket_id: &str) {
        for direction in [Direction::Upstream, Direction::Downstream] {
            self.counters
                .remove(&(session_id.to_string(), socket_id.to_string(), direction));
        }
    }

    pub fn forget_session(&self, session_id: &str) {
        self.counters.retain(|(session, _, _), _| session != session_id);
    }
}

/// Per-socket resequencing buffer.
///
/// Not shared: the single consumer of a socket owns its buffer, which keeps
/// release order identical to write order.
#[derive(Debug)]
pub struct ReorderBuffer {
    socket_id: String,
    expected: u64,
    pending: BTreeMap<u64, Chunk>,
    limit: usize,
}

impl ReorderBuffer {
    pub fn new(socket_id: impl Into<String>, limit: usize) -> Self {
        Self {
            socket_id: socket_id.into(),
            expected: 0,
            pending: BTreeMap::new(),
            limit,
        }
    }

    /// Accept one arrival and return whatever is now deliverable, in order.
    ///
    /// Duplicates of delivered or already held ids are discarded. Fails once
    /// holding another chunk would exceed the limit.
    pub fn accept(&mut self, chunk: Chunk) -> Result<Vec<Chunk>> {
        let id = chunk.sequence_id;
        if id < self.expected || self.pending.contains_key(&id) {
            tracing::debug!(
                socket_id = %self.socket_id,
                sequence_id = id,
                expected = self.expected,
                "discarding duplicate chunk"
            );
            return Ok(Vec::new());
        }

        if id != self.expected {
            if self.pending.len() >= self.limit {
                return Err(ImuxError::SequenceGapTimeout {
                    socket_id: self.socket_id.clone(),
                    expected: self.expected,
                    buffered: self.pending.len(),
                    limit: self.limit,
                });
            }
            self.pending.insert(id, chunk);
            return Ok(Vec::new());
        }

        let mut run = vec![chunk];
        self.expected += 1;
        while let Some(next) = self.pending.remove(&self.expected) {
            run.push(next);
            self.expected += 1;
        }
        Ok(run)
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
