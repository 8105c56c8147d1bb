//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the sidecar.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keepalive::{KeepAliveConfig, KeepalivePolicy};

/// Root configuration for the sidecar proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream endpoints kept warm by the pool.
    pub upstreams: Vec<UpstreamConfig>,

    /// Keepalive timing and policy.
    pub keepalive: KeepaliveSection,

    /// Reconnect behaviour after an evicted connection.
    pub reconnect: ReconnectConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// One upstream endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Unique upstream identifier.
    pub name: String,

    /// Upstream address (e.g., "127.0.0.1:12200").
    pub address: String,

    /// Pooled connections to keep open.
    #[serde(default = "default_connections")]
    pub connections: usize,
}

fn default_connections() -> usize {
    1
}

/// Keepalive settings. Timing is per connection; the rest is installed into
/// the process-wide policy and may change on reload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveSection {
    /// Max wait for a heartbeat reply in milliseconds.
    pub timeout_ms: u64,

    /// Schedule loop period in milliseconds.
    pub interval_ms: u64,

    /// Ticks between probes while failing.
    pub tick_count_if_fail: u32,

    /// Ticks between probes while healthy.
    pub tick_count_if_succ: u32,

    /// Consecutive failures that close the connection.
    pub fail_count_to_close: u32,

    /// Retry at `fast_send_interval_ms` after a failure.
    pub fast_fail: bool,

    /// Fast-fail retry interval in milliseconds.
    pub fast_send_interval_ms: u64,

    /// Idle probe cycles before reclaiming a connection (0 disables).
    pub max_idle_count: u32,
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        let timing = KeepAliveConfig::default();
        let policy = KeepalivePolicy::default();
        Self {
            timeout_ms: timing.timeout.as_millis() as u64,
            interval_ms: timing.interval.as_millis() as u64,
            tick_count_if_fail: policy.tick_count_if_fail,
            tick_count_if_succ: policy.tick_count_if_succ,
            fail_count_to_close: policy.fail_count_to_close,
            fast_fail: policy.fast_fail,
            fast_send_interval_ms: policy.fast_send_interval.as_millis() as u64,
            max_idle_count: policy.max_idle_count,
        }
    }
}

impl KeepaliveSection {
    pub fn timing(&self) -> KeepAliveConfig {
        KeepAliveConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            interval: Duration::from_millis(self.interval_ms),
        }
    }

    pub fn policy(&self) -> KeepalivePolicy {
        KeepalivePolicy {
            tick_count_if_fail: self.tick_count_if_fail,
            tick_count_if_succ: self.tick_count_if_succ,
            fail_count_to_close: self.fail_count_to_close,
            fast_fail: self.fast_fail,
            fast_send_interval: Duration::from_millis(self.fast_send_interval_ms),
            max_idle_count: self.max_idle_count,
        }
    }
}

/// Reconnect configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
