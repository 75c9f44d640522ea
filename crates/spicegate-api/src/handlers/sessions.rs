//! /sessions handlers: listing, inspection and removal.
//! One-time passwords never leave the process.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use spicegate_services::SessionEntry;

use super::{parse_session_id, ApiState};

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: u32,
    pub destination: String,
    pub uptime_secs: u64,
}

impl SessionInfo {
    fn from_entry(session_id: u32, entry: &SessionEntry) -> Self {
        Self {
            session_id,
            destination: entry.destination.clone(),
            uptime_secs: entry.established_at.elapsed().as_secs(),
        }
    }
}

// ── /sessions ─────────────────────────────────────────────────────────────────

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<Vec<SessionInfo>> {
    let mut sessions: Vec<SessionInfo> = state
        .sessions
        .iter()
        .map(|e| SessionInfo::from_entry(*e.key(), e.value()))
        .collect();
    sessions.sort_by_key(|s| s.session_id);
    Json(sessions)
}

// ── /sessions/{id} (GET) ──────────────────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    let entry = state
        .sessions
        .get(&id)
        .ok_or((StatusCode::NOT_FOUND, "session not found".to_string()))?;
    Ok(Json(SessionInfo::from_entry(id, entry.value())))
}

// ── /sessions/{id} (DELETE) ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SessionDropResponse {
    pub session_id: u32,
    pub dropped: bool,
}

pub async fn handle_session_drop(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDropResponse>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    let dropped = state.sessions.remove(&id).is_some();

    if dropped {
        tracing::info!(session_id = id, "session dropped via API");
    }

    Ok(Json(SessionDropResponse {
        session_id: id,
        dropped,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::state_with_sessions;

    #[tokio::test]
    async fn list_omits_otps() {
        let state = state_with_sessions();
        let Json(sessions) = handle_sessions(State(state)).await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, 7);
        assert_eq!(sessions[1].destination, "10.0.0.6:5900");

        let text = serde_json::to_string(&sessions).unwrap();
        assert!(!text.contains("secret-otp"));
        assert!(!text.contains("otp"));
    }

    #[tokio::test]
    async fn inspect_known_and_unknown() {
        let state = state_with_sessions();
        let Json(info) = handle_session_inspect(State(state.clone()), Path("7".to_string()))
            .await
            .unwrap();
        assert_eq!(info.destination, "10.0.0.5:5900");

        let (code, _) = handle_session_inspect(State(state.clone()), Path("99".to_string()))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _) = handle_session_inspect(State(state), Path("abc".to_string()))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn drop_removes_entry() {
        let state = state_with_sessions();
        let Json(resp) = handle_session_drop(State(state.clone()), Path("8".to_string()))
            .await
            .unwrap();
        assert!(resp.dropped);
        assert!(!state.sessions.contains_key(&8));

        let Json(resp) = handle_session_drop(State(state), Path("8".to_string()))
            .await
            .unwrap();
        assert!(!resp.dropped);
    }
}
