//! Sidecar proxy with adaptive upstream keepalive.
//!
//! # Architecture Overview
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │                        SIDECAR PROXY                         │
//!  │                                                              │
//!  │  ┌──────────┐   pick()   ┌───────────────┐   PING/PONG       │
//!  │  │ upstream │──────────▶ │  keepalive    │ ─────────────────┼──▶ Upstream
//!  │  │   pool   │ ◀── evict ─│  engine (per  │ ◀────────────────┼──
//!  │  └────┬─────┘            │  connection)  │                   │
//!  │       │ reconnect        └──────┬────────┘                   │
//!  │       ▼                         │ policy snapshot per tick   │
//!  │  ┌──────────┐            ┌──────▼────────┐                   │
//!  │  │resilience│            │ policy store  │◀── config watcher │
//!  │  │ backoff  │            │  (ArcSwap)    │◀── PUT /admin/... │
//!  │  └──────────┘            └───────────────┘                   │
//!  │                                                              │
//!  │  Cross-cutting: config · observability · lifecycle · admin   │
//!  └──────────────────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod config;
pub mod keepalive;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod upstream;

pub use config::schema::ProxyConfig;
pub use keepalive::{KeepAlive, KeepAliveConfig, KeepalivePolicy, PolicyStore};
pub use lifecycle::Shutdown;
pub use upstream::UpstreamPool;
