//! Admin API.
//!
//! # Routes
//! ```text
//! GET  /admin/status       process and per-upstream summary
//! GET  /admin/connections  live pooled connections with keepalive state
//! GET  /admin/policy       current keepalive policy
//! PUT  /admin/policy       replace the keepalive policy
//! ```
//!
//! Every route requires `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::upstream::UpstreamPool;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<UpstreamPool>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(pool: Arc<UpstreamPool>, api_key: &str) -> Self {
        Self {
            pool,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/connections", get(get_connections))
        .route("/admin/policy", get(get_policy).put(put_policy))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
