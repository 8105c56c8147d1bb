//! Process-wide keepalive policy.
//!
//! # Responsibilities
//! - Hold the one current `KeepalivePolicy` visible to every engine
//! - Validate a candidate policy before it is accepted
//! - Swap the whole value atomically on reload
//!
//! # Design Decisions
//! - Readers never lock: `ArcSwap::load` hands out a snapshot
//! - Fields are never mutated in place; a reload replaces the value
//! - Engines read a fresh snapshot on every tick

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::metrics;

/// Default number of consecutive failures that closes a connection.
pub const DEFAULT_FAIL_COUNT_TO_CLOSE: u32 = 6;

/// Default retry interval while fast-failing.
pub const DEFAULT_FAST_SEND_INTERVAL: Duration = Duration::from_millis(20);

/// Tunables shared by every keepalive engine in the process.
///
/// Deserializing requires every field, so a policy update always replaces
/// the whole policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePolicy {
    /// Ticks between real probes while the connection is failing.
    pub tick_count_if_fail: u32,
    /// Ticks between real probes while the connection is healthy.
    pub tick_count_if_succ: u32,
    /// Consecutive failed probes that force-close the connection.
    pub fail_count_to_close: u32,
    /// Switch automatic retries to `fast_send_interval` after a failure.
    pub fast_fail: bool,
    /// Retry interval used while fast-failing.
    #[serde(with = "duration_ms")]
    pub fast_send_interval: Duration,
    /// Idle probe cycles before an unused connection is reclaimed (0 disables).
    pub max_idle_count: u32,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            tick_count_if_fail: 1,
            tick_count_if_succ: 1,
            fail_count_to_close: DEFAULT_FAIL_COUNT_TO_CLOSE,
            fast_fail: false,
            fast_send_interval: DEFAULT_FAST_SEND_INTERVAL,
            max_idle_count: 0,
        }
    }
}

impl KeepalivePolicy {
    /// Check the policy for values that would break the engine.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.tick_count_if_fail == 0 {
            return Err(PolicyError::ZeroTickCount("tick_count_if_fail"));
        }
        if self.tick_count_if_succ == 0 {
            return Err(PolicyError::ZeroTickCount("tick_count_if_succ"));
        }
        if self.fail_count_to_close == 0 {
            return Err(PolicyError::ZeroFailCount);
        }
        if self.fast_fail && self.fast_send_interval.is_zero() {
            return Err(PolicyError::ZeroFastSendInterval);
        }
        Ok(())
    }

    /// Tick threshold for the current failure count.
    pub fn tick_threshold(&self, fail_count: u32) -> u32 {
        if fail_count > 0 {
            self.tick_count_if_fail
        } else {
            self.tick_count_if_succ
        }
    }
}

/// Reasons a policy is rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("{0} must be at least 1")]
    ZeroTickCount(&'static str),

    #[error("fail_count_to_close must be at least 1")]
    ZeroFailCount,

    #[error("fast_send_interval must be non-zero when fast_fail is enabled")]
    ZeroFastSendInterval,
}

/// Atomically swappable holder of the current policy.
#[derive(Debug)]
pub struct PolicyStore {
    current: ArcSwap<KeepalivePolicy>,
}

static GLOBAL: OnceLock<Arc<PolicyStore>> = OnceLock::new();

impl PolicyStore {
    /// Create a store seeded with `policy`.
    ///
    /// The seed is trusted; use [`PolicyStore::refresh`] for external input.
    pub fn new(policy: KeepalivePolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
        }
    }

    /// The process-wide store, seeded with the default policy.
    pub fn global() -> Arc<PolicyStore> {
        GLOBAL
            .get_or_init(|| Arc::new(PolicyStore::default()))
            .clone()
    }

    /// Snapshot of the current policy.
    pub fn load(&self) -> Arc<KeepalivePolicy> {
        self.current.load_full()
    }

    /// Validate and install a complete policy.
    pub fn refresh(&self, policy: KeepalivePolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        let previous = self.current.swap(Arc::new(policy));
        let current = self.current.load();
        if *previous != **current {
            tracing::info!(
                tick_count_if_fail = current.tick_count_if_fail,
                tick_count_if_succ = current.tick_count_if_succ,
                fail_count_to_close = current.fail_count_to_close,
                fast_fail = current.fast_fail,
                fast_send_interval_ms = current.fast_send_interval.as_millis() as u64,
                max_idle_count = current.max_idle_count,
                "Keepalive policy refreshed"
            );
        }
        metrics::record_policy_reload();
        Ok(())
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(KeepalivePolicy::default())
    }
}

/// Install `policy` into the process-wide store.
pub fn refresh_keepalive_policy(policy: KeepalivePolicy) -> Result<(), PolicyError> {
    PolicyStore::global().refresh(policy)
}

/// Snapshot of the process-wide policy.
pub fn keepalive_policy() -> Arc<KeepalivePolicy> {
    PolicyStore::global().load()
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        let policy = KeepalivePolicy::default();
        assert_eq!(policy.tick_count_if_fail, 1);
        assert_eq!(policy.tick_count_if_succ, 1);
        assert_eq!(policy.fail_count_to_close, 6);
        assert!(!policy.fast_fail);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn refresh_rejects_invalid_policy() {
        let store = PolicyStore::default();

        let err = store
            .refresh(KeepalivePolicy {
                tick_count_if_succ: 0,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, PolicyError::ZeroTickCount("tick_count_if_succ"));

        let err = store
            .refresh(KeepalivePolicy {
                fast_fail: true,
                fast_send_interval: Duration::ZERO,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, PolicyError::ZeroFastSendInterval);

        // rejected reloads leave the current value untouched
        assert_eq!(*store.load(), KeepalivePolicy::default());
    }

    #[test]
    fn refresh_replaces_whole_value() {
        let store = PolicyStore::default();
        let before = store.load();

        store
            .refresh(KeepalivePolicy {
                tick_count_if_succ: 2,
                fail_count_to_close: 3,
                ..Default::default()
            })
            .unwrap();

        // old snapshots stay consistent
        assert_eq!(before.tick_count_if_succ, 1);
        assert_eq!(before.fail_count_to_close, 6);

        let after = store.load();
        assert_eq!(after.tick_count_if_succ, 2);
        assert_eq!(after.fail_count_to_close, 3);
    }

    #[test]
    fn tick_threshold_follows_failures() {
        let policy = KeepalivePolicy {
            tick_count_if_fail: 1,
            tick_count_if_succ: 4,
            ..Default::default()
        };
        assert_eq!(policy.tick_threshold(0), 4);
        assert_eq!(policy.tick_threshold(2), 1);
    }

    #[test]
    fn policy_deserializes_millis() {
        let policy: KeepalivePolicy = serde_json::from_str(
            r#"{"tick_count_if_fail":1,"tick_count_if_succ":2,"fail_count_to_close":4,
                "fast_fail":true,"fast_send_interval":15,"max_idle_count":0}"#,
        )
        .unwrap();
        assert!(policy.fast_fail);
        assert_eq!(policy.fast_send_interval, Duration::from_millis(15));
        assert_eq!(policy.tick_count_if_succ, 2);
        assert_eq!(policy.fail_count_to_close, 4);
    }

    #[test]
    fn partial_policy_is_rejected() {
        let err = serde_json::from_str::<KeepalivePolicy>(r#"{"fast_fail":true,"fast_send_interval":15}"#)
            .unwrap_err();
        assert!(err.to_string().contains("missing field"));
    }
}
