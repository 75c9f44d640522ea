//! /status handler.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

#[derive(Serialize)]
pub struct StatusResponse {
    pub listen_addr: String,
    pub auth_methods: Vec<String>,
    pub sessions: usize,
    pub handshakes: HandshakeCounters,
}

#[derive(Serialize)]
pub struct HandshakeCounters {
    pub accepted: u64,
    pub established: u64,
    pub failed: u64,
    pub active: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let stats = state.stats.snapshot();
    Json(StatusResponse {
        listen_addr: state.listen_addr.clone(),
        auth_methods: state.auth_methods.clone(),
        sessions: state.sessions.len(),
        handshakes: HandshakeCounters {
            accepted: stats.accepted,
            established: stats.established,
            failed: stats.failed,
            active: stats.active,
        },
    })
}
