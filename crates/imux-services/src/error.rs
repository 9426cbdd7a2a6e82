//! Error taxonomy for the routing and sequencing engine.

use imux_core::LinkError;

#[derive(Debug, thiserror::Error)]
pub enum ImuxError {
    /// Destination could not be reached. The triggering chunk is dropped and
    /// the socket is not remembered as failed.
    #[error("dial failed for session {session_id} socket {socket_id}: {source}")]
    DialFailure {
        session_id: String,
        socket_id: String,
        #[source]
        source: std::io::Error,
    },

    /// Too many chunks held while waiting for a missing sequence id.
    #[error(
        "socket {socket_id}: waiting for sequence {expected} with {buffered} chunks held (limit {limit})"
    )]
    SequenceGapTimeout {
        socket_id: String,
        expected: u64,
        buffered: usize,
        limit: usize,
    },

    /// A single write to a destination or a link failed.
    #[error("write failed: {0}")]
    WriteFailure(String),

    #[error("all {attempted} transport links failed")]
    AllLinksFailed { attempted: usize },

    #[error("session {0} has no serving links")]
    SessionUnreachable(String),

    #[error("transfer aborted with {} incomplete file(s): {}", incomplete.len(), incomplete.join(", "))]
    TransferAborted { incomplete: Vec<String> },

    #[error("link presented fingerprint {got}, expected {expected}")]
    UntrustedLink { expected: String, got: String },

    #[error("server refused: {0}")]
    Refused(String),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ImuxError {
    pub fn write_failure(e: impl std::fmt::Display) -> Self {
        ImuxError::WriteFailure(e.to_string())
    }
}

pub type Result<T, E = ImuxError> = std::result::Result<T, E>;
