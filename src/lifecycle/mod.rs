//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Install policy → Start pool → Start admin
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop keepalive engines → Close connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then pool, then admin API
//! - Shutdown is a watch channel: late subscribers still observe it

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownListener};
