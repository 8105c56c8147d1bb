//! Upstream connection pool.
//!
//! Each configured upstream gets a fixed number of connection slots. Every
//! slot is owned by a supervisor task that keeps one keepalive-managed
//! connection published, evicts it when the engine closes it, and reconnects.

pub mod pool;

pub use pool::{ConnectionSnapshot, PoolError, Upstream, UpstreamConnection, UpstreamPool, UpstreamStatus};
