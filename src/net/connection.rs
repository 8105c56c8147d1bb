//! Upstream connection identity and activity tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count application streams opened on a connection (idle detection)

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough; IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts non-heartbeat streams opened on one connection.
///
/// The value only ever grows; readers compare it against an earlier reading
/// to learn whether the connection carried traffic in between.
#[derive(Debug, Default)]
pub struct StreamCounter {
    opened: AtomicU64,
}

impl StreamCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new application stream and return its sequence number.
    pub fn open(&self) -> u64 {
        self.opened.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn total(&self) -> u64 {
        self.opened.load(Ordering::Acquire)
    }
}
