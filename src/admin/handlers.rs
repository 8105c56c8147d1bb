use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::keepalive::KeepalivePolicy;
use crate::upstream::{ConnectionSnapshot, UpstreamStatus};

use super::AdminState;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub live_connections: usize,
    pub upstreams: Vec<UpstreamStatus>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        live_connections: state.pool.live_connections(),
        upstreams: state.pool.status(),
    })
}

pub async fn get_connections(State(state): State<AdminState>) -> Json<Vec<ConnectionSnapshot>> {
    Json(state.pool.snapshot())
}

pub async fn get_policy(State(state): State<AdminState>) -> Json<KeepalivePolicy> {
    Json(state.pool.policy().load().as_ref().clone())
}

/// Replace the keepalive policy. The body must carry every field; running
/// engines pick the new policy up on their next tick.
pub async fn put_policy(
    State(state): State<AdminState>,
    Json(policy): Json<KeepalivePolicy>,
) -> Result<Json<KeepalivePolicy>, (StatusCode, Json<ErrorBody>)> {
    match state.pool.policy().refresh(policy.clone()) {
        Ok(()) => Ok(Json(policy)),
        Err(e) => {
            tracing::warn!(error = %e, "Rejected keepalive policy update");
            Err((StatusCode::BAD_REQUEST, Json(ErrorBody { error: e.to_string() })))
        }
    }
}
