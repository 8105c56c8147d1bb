//! Upstream pool: publication, eviction, reconnect and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, MockUpstream};
use sidecar_proxy::config::{KeepaliveSection, ProxyConfig, ReconnectConfig, UpstreamConfig};
use sidecar_proxy::keepalive::{
    CloseReason, EngineState, HeartbeatTransport, KeepalivePolicy, PolicyStore, TransportState,
};
use sidecar_proxy::upstream::PoolError;
use sidecar_proxy::{Shutdown, UpstreamPool};

fn config(upstream: &MockUpstream, connections: usize) -> ProxyConfig {
    ProxyConfig {
        upstreams: vec![UpstreamConfig {
            name: "orders".into(),
            address: upstream.addr().to_string(),
            connections,
        }],
        keepalive: KeepaliveSection {
            timeout_ms: 10,
            interval_ms: 10,
            ..Default::default()
        },
        reconnect: ReconnectConfig {
            connect_timeout_ms: 500,
            base_delay_ms: 10,
            max_delay_ms: 50,
        },
        ..Default::default()
    }
}

fn pool(config: &ProxyConfig, policy: KeepalivePolicy) -> Arc<UpstreamPool> {
    Arc::new(UpstreamPool::new(config, Arc::new(PolicyStore::new(policy))))
}

#[tokio::test]
async fn slots_are_filled_and_picked_round_robin() {
    let upstream = MockUpstream::start().await;
    let pool = pool(&config(&upstream, 2), KeepalivePolicy::default());
    let shutdown = Shutdown::new();
    let _tasks = pool.start(&shutdown);

    assert!(wait_until(Duration::from_secs(2), || pool.live_connections() == 2).await);

    let first = pool.pick("orders").unwrap();
    let second = pool.pick("orders").unwrap();
    let third = pool.pick("orders").unwrap();
    assert_ne!(first.connection_id(), second.connection_id());
    assert_eq!(first.connection_id(), third.connection_id());
    assert_eq!(first.transport().streams(), 2);

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|c| c.upstream == "orders" && c.state != EngineState::Closed));
    assert_eq!(snapshot.iter().map(|c| c.streams).sum::<u64>(), 3);

    shutdown.trigger();
}

#[tokio::test]
async fn failed_connection_is_evicted_and_replaced() {
    let upstream = MockUpstream::start().await;
    let policy = KeepalivePolicy {
        fail_count_to_close: 2,
        ..Default::default()
    };
    let pool = pool(&config(&upstream, 1), policy);
    let shutdown = Shutdown::new();
    let _tasks = pool.start(&shutdown);

    assert!(wait_until(Duration::from_secs(2), || pool.live_connections() == 1).await);
    let original = pool.pick("orders").unwrap().connection_id();

    upstream.set_delay(Duration::from_millis(200));
    assert!(wait_until(Duration::from_secs(2), || upstream.connections() >= 2).await);

    upstream.set_delay(Duration::ZERO);
    assert!(
        wait_until(Duration::from_secs(3), || {
            pool.snapshot()
                .iter()
                .any(|c| c.connection_id != original && c.heartbeat_fail_count == 0)
        })
        .await
    );
    assert_ne!(pool.pick("orders").unwrap().connection_id(), original);
    let status = pool.status();
    assert!(status[0].probes_failed >= 2);
    assert!(status[0].probes_ok >= 1);

    shutdown.trigger();
}

#[tokio::test]
async fn peer_hangup_evicts_and_replaces_connection() {
    let upstream = MockUpstream::start().await;
    let mut config = config(&upstream, 1);
    // no heartbeat runs before the hangup is noticed
    config.keepalive.interval_ms = 60_000;
    let pool = pool(&config, KeepalivePolicy::default());
    let shutdown = Shutdown::new();
    let _tasks = pool.start(&shutdown);

    assert!(wait_until(Duration::from_secs(2), || pool.live_connections() == 1).await);
    let dropped = pool.pick("orders").unwrap();

    upstream.disconnect_all();
    assert!(
        wait_until(Duration::from_secs(2), || {
            upstream.connections() == 2
                && pool.live_connections() == 1
                && pool.snapshot().iter().all(|c| c.connection_id != dropped.connection_id())
        })
        .await
    );

    assert_eq!(dropped.close_reason(), Some(CloseReason::ConnectionClosed));
    assert_eq!(dropped.transport().state(), TransportState::Closed);
    assert_ne!(pool.pick("orders").unwrap().connection_id(), dropped.connection_id());
    assert_eq!(upstream.pings(), 0);

    shutdown.trigger();
}

#[tokio::test]
async fn idle_slot_reconnects_on_demand() {
    let upstream = MockUpstream::start().await;
    let policy = KeepalivePolicy {
        max_idle_count: 2,
        ..Default::default()
    };
    let pool = pool(&config(&upstream, 1), policy);
    let shutdown = Shutdown::new();
    let _tasks = pool.start(&shutdown);

    assert!(wait_until(Duration::from_secs(2), || pool.status()[0].probes_ok >= 1).await);
    assert!(wait_until(Duration::from_secs(2), || pool.live_connections() == 0).await);

    // parked until someone asks for it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.connections(), 1);

    assert_eq!(
        pool.pick("orders").unwrap_err(),
        PoolError::NoLiveConnection("orders".to_string())
    );
    assert!(wait_until(Duration::from_secs(2), || upstream.connections() == 2).await);

    shutdown.trigger();
}

#[tokio::test]
async fn shutdown_stops_supervisors() {
    let upstream = MockUpstream::start().await;
    let pool = pool(&config(&upstream, 3), KeepalivePolicy::default());
    let shutdown = Shutdown::new();
    let tasks = pool.start(&shutdown);

    assert!(wait_until(Duration::from_secs(2), || pool.live_connections() == 3).await);
    let connections: Vec<_> = (0..3).map(|_| pool.pick("orders").unwrap()).collect();

    shutdown.trigger();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(pool.live_connections(), 0);
    assert!(connections.iter().all(|c| c.is_stopped()));
    assert_eq!(upstream.connections(), 3);
}

#[tokio::test]
async fn unreachable_upstream_keeps_retrying() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = ProxyConfig::default();
    config.upstreams.push(UpstreamConfig {
        name: "orders".into(),
        address: addr.to_string(),
        connections: 1,
    });
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 20;
    let pool = pool(&config, KeepalivePolicy::default());
    let shutdown = Shutdown::new();
    let tasks = pool.start(&shutdown);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.live_connections(), 0);
    assert!(matches!(pool.pick("orders"), Err(PoolError::NoLiveConnection(_))));

    shutdown.trigger();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
