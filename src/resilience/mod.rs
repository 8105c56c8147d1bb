//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Pooled connection evicted (keepalive closed it)
//!     → backoff.rs (exponential delay + jitter)
//!     → reconnect attempt
//! ```
//!
//! # Design Decisions
//! - Every connect has a deadline (reconnect.connect_timeout_ms)
//! - Jittered backoff prevents thundering herd against a recovering upstream

pub mod backoff;
