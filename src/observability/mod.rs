//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! keepalive engines, pool, config reload produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields (`connection_id`, `upstream`, `reason`) on every event
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
