//! Pool of keepalive-managed upstream connections.
//!
//! # Responsibilities
//! - Keep `connections` heartbeat connections open per upstream
//! - Evict connections whose keepalive engine closed them
//! - Reconnect evicted slots with backoff, idle-reclaimed slots on demand
//! - Hand out live connections round-robin
//!
//! # Slot lifecycle
//! ```text
//! connect ──▶ live (engine running) ──stop signal──▶ evicted
//!    ▲                                                  │
//!    ├──────────── backoff (failure / closed) ◀─────────┤
//!    └──────────── pick() demand (idle reclaim) ◀───────┘
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{ProxyConfig, ReconnectConfig, UpstreamConfig};
use crate::keepalive::{
    CloseReason, EngineState, HeartbeatTransport, KeepAlive, KeepAliveConfig, KeepaliveStatus, Mode,
    PolicyStore, TransportState,
};
use crate::lifecycle::{Shutdown, ShutdownListener};
use crate::net::connection::ConnectionId;
use crate::net::heartbeat::TcpHeartbeatTransport;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;

/// A pooled connection together with its keepalive engine.
pub type UpstreamConnection = KeepAlive<TcpHeartbeatTransport>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("unknown upstream '{0}'")]
    UnknownUpstream(String),

    #[error("no live connection to upstream '{0}'")]
    NoLiveConnection(String),
}

/// One configured upstream and its live connections.
#[derive(Debug)]
pub struct Upstream {
    name: String,
    address: String,
    slots: usize,
    connections: DashMap<ConnectionId, UpstreamConnection>,
    demand: Notify,
    next: AtomicUsize,
    probes_ok: AtomicU64,
    probes_failed: AtomicU64,
}

impl Upstream {
    fn new(config: &UpstreamConfig) -> Self {
        Self {
            name: config.name.clone(),
            address: config.address.clone(),
            slots: config.connections,
            connections: DashMap::new(),
            demand: Notify::new(),
            next: AtomicUsize::new(0),
            probes_ok: AtomicU64::new(0),
            probes_failed: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of connections currently published.
    pub fn live_connections(&self) -> usize {
        self.connections.len()
    }

    fn record(&self, status: KeepaliveStatus) {
        let counter = match status {
            KeepaliveStatus::Success => &self.probes_ok,
            KeepaliveStatus::Timeout => &self.probes_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn publish(&self, connection: UpstreamConnection) {
        self.connections.insert(connection.connection_id(), connection);
        metrics::record_active_connections(&self.name, self.connections.len());
    }

    fn evict(&self, id: ConnectionId) {
        self.connections.remove(&id);
        metrics::record_active_connections(&self.name, self.connections.len());
    }

    /// Round-robin over live connections. A connection whose socket is no
    /// longer open is skipped even before its supervisor evicts it.
    fn next_live(&self) -> Option<UpstreamConnection> {
        let mut live: Vec<UpstreamConnection> = self
            .connections
            .iter()
            .filter(|entry| {
                let connection = entry.value();
                !connection.is_stopped() && connection.transport().state() == TransportState::Open
            })
            .map(|entry| entry.value().clone())
            .collect();
        if live.is_empty() {
            return None;
        }
        live.sort_by_key(|connection| connection.connection_id().as_u64());
        let index = self.next.fetch_add(1, Ordering::Relaxed) % live.len();
        Some(live.swap_remove(index))
    }
}

/// Point-in-time view of one pooled connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub upstream: String,
    pub connection_id: ConnectionId,
    pub peer: String,
    pub state: EngineState,
    pub mode: Mode,
    pub heartbeat_fail_count: u32,
    pub idle_count: u32,
    pub streams: u64,
}

/// Per-upstream summary.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub name: String,
    pub address: String,
    pub slots: usize,
    pub live: usize,
    pub probes_ok: u64,
    pub probes_failed: u64,
}

/// Keepalive-managed connection pool.
#[derive(Debug)]
pub struct UpstreamPool {
    upstreams: Vec<Arc<Upstream>>,
    timing: KeepAliveConfig,
    reconnect: ReconnectConfig,
    policy: Arc<PolicyStore>,
}

impl UpstreamPool {
    pub fn new(config: &ProxyConfig, policy: Arc<PolicyStore>) -> Self {
        Self {
            upstreams: config
                .upstreams
                .iter()
                .map(|upstream| Arc::new(Upstream::new(upstream)))
                .collect(),
            timing: config.keepalive.timing(),
            reconnect: config.reconnect.clone(),
            policy,
        }
    }

    /// Spawn one supervisor per connection slot.
    pub fn start(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        for upstream in &self.upstreams {
            tracing::info!(
                upstream = %upstream.name,
                address = %upstream.address,
                slots = upstream.slots,
                "Starting upstream connections"
            );
            for slot in 0..upstream.slots {
                let supervisor = Supervisor {
                    upstream: upstream.clone(),
                    slot,
                    timing: self.timing,
                    reconnect: self.reconnect.clone(),
                    policy: self.policy.clone(),
                };
                tasks.push(tokio::spawn(supervisor.run(shutdown.subscribe())));
            }
        }
        tasks
    }

    pub fn upstream(&self, name: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.iter().find(|upstream| upstream.name == name)
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Take a live connection to `name` and record one application stream on
    /// it. With none live, wakes an idle-reclaimed slot and fails.
    pub fn pick(&self, name: &str) -> Result<UpstreamConnection, PoolError> {
        let upstream = self
            .upstream(name)
            .ok_or_else(|| PoolError::UnknownUpstream(name.to_string()))?;

        match upstream.next_live() {
            Some(connection) => {
                connection.transport().open_stream();
                Ok(connection)
            }
            None => {
                upstream.demand.notify_one();
                Err(PoolError::NoLiveConnection(name.to_string()))
            }
        }
    }

    pub fn live_connections(&self) -> usize {
        self.upstreams.iter().map(|upstream| upstream.live_connections()).sum()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut connections = Vec::new();
        for upstream in &self.upstreams {
            for entry in upstream.connections.iter() {
                let connection = entry.value();
                connections.push(ConnectionSnapshot {
                    upstream: upstream.name.clone(),
                    connection_id: connection.connection_id(),
                    peer: connection.transport().peer_addr().to_string(),
                    state: connection.state(),
                    mode: connection.mode(),
                    heartbeat_fail_count: connection.heartbeat_fail_count(),
                    idle_count: connection.idle_count(),
                    streams: connection.transport().streams(),
                });
            }
        }
        connections.sort_by_key(|c| c.connection_id.as_u64());
        connections
    }

    pub fn status(&self) -> Vec<UpstreamStatus> {
        self.upstreams
            .iter()
            .map(|upstream| UpstreamStatus {
                name: upstream.name.clone(),
                address: upstream.address.clone(),
                slots: upstream.slots,
                live: upstream.live_connections(),
                probes_ok: upstream.probes_ok.load(Ordering::Relaxed),
                probes_failed: upstream.probes_failed.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Stop every live engine. Supervisors observing shutdown will not
    /// reconnect.
    pub fn stop_all(&self) {
        for upstream in &self.upstreams {
            for entry in upstream.connections.iter() {
                entry.value().stop();
            }
        }
    }
}

struct Supervisor {
    upstream: Arc<Upstream>,
    slot: usize,
    timing: KeepAliveConfig,
    reconnect: ReconnectConfig,
    policy: Arc<PolicyStore>,
}

impl Supervisor {
    async fn run(self, mut shutdown: ShutdownListener) {
        let upstream = &self.upstream;
        let mut backoff = Backoff::new(&self.reconnect);

        while !shutdown.is_triggered() {
            let connected = tokio::select! {
                result = TcpHeartbeatTransport::connect(&upstream.address, self.reconnect.connect_timeout()) => result,
                _ = shutdown.wait() => break,
            };
            let transport = match connected {
                Ok(transport) => transport,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        upstream = %upstream.name,
                        slot = self.slot,
                        attempt = backoff.attempt(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream connect failed"
                    );
                    if !pause(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            backoff.reset();

            let id = transport.id();
            let connection = KeepAlive::builder(transport)
                .config(self.timing)
                .policy_store(self.policy.clone())
                .connection_id(id)
                .build();
            let stats = upstream.clone();
            connection.add_callback(move |status: KeepaliveStatus| stats.record(status));
            connection.start_idle_timeout();
            connection.start_schedule();

            let mut signal = connection.stop_signal();
            upstream.publish(connection.clone());
            tracing::info!(upstream = %upstream.name, slot = self.slot, connection_id = %id, "Upstream connection live");

            let closed = tokio::select! {
                _ = signal.wait() => true,
                _ = connection.transport().closed() => {
                    // a close already under way keeps its own reason
                    connection.connection_lost();
                    true
                }
                _ = shutdown.wait() => false,
            };
            let reason = if closed { Some(signal.wait().await) } else { None };
            upstream.evict(id);

            match reason {
                None => {
                    connection.stop();
                    break;
                }
                Some(CloseReason::IdleTimeout) => {
                    tracing::debug!(
                        upstream = %upstream.name,
                        slot = self.slot,
                        "Idle slot parked until demand"
                    );
                    tokio::select! {
                        _ = upstream.demand.notified() => {}
                        _ = shutdown.wait() => break,
                    }
                }
                Some(reason) => {
                    let delay = backoff.next_delay();
                    tracing::info!(
                        upstream = %upstream.name,
                        slot = self.slot,
                        connection_id = %id,
                        reason = %reason,
                        retry_in_ms = delay.as_millis() as u64,
                        "Upstream connection evicted"
                    );
                    if !pause(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        tracing::debug!(upstream = %upstream.name, slot = self.slot, "Slot supervisor exiting");
    }
}

/// Sleep for `delay`; false if shutdown arrived first.
async fn pause(delay: Duration, shutdown: &mut ShutdownListener) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait() => false,
    }
}
