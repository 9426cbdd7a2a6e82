//! /status and /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub listen_addr: String,
    pub uptime_secs: u64,
    pub sessions: usize,
    /// Distinct transport links bound to any session.
    pub links: usize,
    pub serving_links: usize,
    pub open_sockets: usize,
    pub routed_sockets: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let snapshots = state.registry.snapshot();

    let mut links: Vec<_> = snapshots.iter().flat_map(|s| s.links.iter().copied()).collect();
    links.sort_unstable();
    links.dedup();

    Json(StatusResponse {
        listen_addr: state.listen_addr.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        sessions: snapshots.len(),
        links: links.len(),
        serving_links: snapshots.iter().map(|s| s.serving_links.len()).sum(),
        open_sockets: snapshots.iter().map(|s| s.open_sockets).sum(),
        routed_sockets: state.router.socket_count(),
        bytes_in: snapshots.iter().map(|s| s.bytes_in).sum(),
        bytes_out: snapshots.iter().map(|s| s.bytes_out).sum(),
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
