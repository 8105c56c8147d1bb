//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};

use sidecar_proxy::net::heartbeat::{encode_pong, parse_ping};

/// Heartbeat upstream whose reply latency can be changed while running.
#[derive(Clone)]
pub struct MockUpstream {
    addr: SocketAddr,
    delay_ms: Arc<AtomicU64>,
    pings: Arc<AtomicU64>,
    accepted: Arc<AtomicU64>,
    hangup: Arc<watch::Sender<u64>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = Self {
            addr: listener.local_addr().unwrap(),
            delay_ms: Arc::new(AtomicU64::new(0)),
            pings: Arc::new(AtomicU64::new(0)),
            accepted: Arc::new(AtomicU64::new(0)),
            hangup: Arc::new(watch::channel(0).0),
        };

        let server = upstream.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                server.accepted.fetch_add(1, Ordering::SeqCst);
                let server = server.clone();
                let mut hangup = server.hangup.subscribe();
                tokio::spawn(async move {
                    let (read, write) = socket.into_split();
                    let write = Arc::new(Mutex::new(write));
                    let mut lines = BufReader::new(read).lines();
                    loop {
                        let line = tokio::select! {
                            line = lines.next_line() => line,
                            _ = hangup.changed() => {
                                let _ = write.lock().await.shutdown().await;
                                break;
                            }
                        };
                        let Ok(Some(line)) = line else { break };
                        let Some(id) = parse_ping(&line) else { continue };
                        server.pings.fetch_add(1, Ordering::SeqCst);
                        let delay = Duration::from_millis(server.delay_ms.load(Ordering::SeqCst));
                        let write = write.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = write.lock().await.write_all(encode_pong(id).as_bytes()).await;
                        });
                    }
                });
            }
        });

        upstream
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Heartbeat requests received across all connections.
    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    /// Drop every connection accepted so far. New connections are served
    /// normally.
    pub fn disconnect_all(&self) {
        self.hangup.send_modify(|generation| *generation += 1);
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
