//! `/sessions`: list, inspect and tear down sessions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use imux_services::SessionSnapshot;

use super::ApiState;

// ── /sessions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSnapshot>,
}

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry.snapshot(),
    })
}

// ── /sessions/{id} (GET) ──────────────────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let session = state
        .registry
        .get(&session_id)
        .ok_or((StatusCode::NOT_FOUND, "session not found".to_string()))?;
    Ok(Json(session.snapshot()))
}

// ── /sessions/{id} (DELETE) ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SessionDropResponse {
    pub session_id: String,
    pub dropped: bool,
}

pub async fn handle_session_drop(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Json<SessionDropResponse> {
    let dropped = state.registry.teardown(&session_id).is_some();
    if dropped {
        tracing::info!(session_id = %session_id, "session dropped via API");
    }

    Json(SessionDropResponse {
        session_id,
        dropped,
    })
}
