//! HTTP API handlers. Exposes relay state as JSON.

pub mod sessions;
pub mod status;

use std::sync::Arc;

use axum::http::StatusCode;

use spicegate_proxy::ProxyStats;
use spicegate_services::SessionTable;

#[derive(Clone)]
pub struct ApiState {
    pub sessions: SessionTable,
    pub stats: Arc<ProxyStats>,
    /// Address tenants connect to, as configured.
    pub listen_addr: String,
    /// Registered authentication methods, e.g. "spice".
    pub auth_methods: Vec<String>,
}

/// Parse a decimal session id from a path segment.
fn parse_session_id(raw: &str) -> Result<u32, (StatusCode, String)> {
    raw.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "session id must be a u32".to_string()))
}

pub use sessions::{handle_session_drop, handle_session_inspect, handle_sessions};
pub use status::handle_status;
