//! Line-framed TCP heartbeat transport.
//!
//! # Wire Format
//! ```text
//! proxy → upstream:  PING <request-id>\n
//! upstream → proxy:  PONG <request-id>\n
//! ```
//!
//! # Design Decisions
//! - Request IDs multiplex concurrent probes over one connection
//! - A single reader task dispatches replies to waiting probes
//! - EOF or a read error marks the connection closed and fails pending probes

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::AbortHandle;

use crate::keepalive::transport::{AtomicTransportState, HeartbeatTransport, ProbeOutcome, TransportState};
use crate::net::connection::{ConnectionId, StreamCounter};

/// Errors establishing a heartbeat connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Encode a heartbeat request frame.
pub fn encode_ping(id: u64) -> String {
    format!("PING {}\n", id)
}

/// Encode a heartbeat reply frame.
pub fn encode_pong(id: u64) -> String {
    format!("PONG {}\n", id)
}

/// Parse a request line, returning its id.
pub fn parse_ping(line: &str) -> Option<u64> {
    parse_frame(line, "PING")
}

/// Parse a reply line, returning its id.
pub fn parse_pong(line: &str) -> Option<u64> {
    parse_frame(line, "PONG")
}

fn parse_frame(line: &str, verb: &str) -> Option<u64> {
    let rest = line.trim_end().strip_prefix(verb)?;
    rest.strip_prefix(' ')?.parse().ok()
}

type Pending = Arc<DashMap<u64, oneshot::Sender<()>>>;

/// Heartbeat transport over a dedicated upstream TCP connection.
#[derive(Debug)]
pub struct TcpHeartbeatTransport {
    id: ConnectionId,
    peer: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: Pending,
    next_request: AtomicU64,
    streams: StreamCounter,
    state: Arc<AtomicTransportState>,
    closed: Arc<watch::Sender<bool>>,
    reader: AbortHandle,
}

impl TcpHeartbeatTransport {
    /// Connect to `addr`, giving up after `connect_timeout`.
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout: connect_timeout,
                })
            }
        };
        Self::from_stream(stream)
    }

    /// Wrap an established stream. Must be called inside a Tokio runtime.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();

        let id = ConnectionId::new();
        let pending: Pending = Arc::new(DashMap::new());
        let state = Arc::new(AtomicTransportState::new(TransportState::Open));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let reader = tokio::spawn(read_replies(
            id,
            read,
            pending.clone(),
            state.clone(),
            closed.clone(),
        ));

        tracing::debug!(connection_id = %id, peer = %peer, "Heartbeat connection established");

        Ok(Self {
            id,
            peer,
            writer: Arc::new(Mutex::new(write)),
            pending,
            next_request: AtomicU64::new(1),
            streams: StreamCounter::new(),
            state,
            closed,
            reader: reader.abort_handle(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Record an application stream on this connection.
    pub fn open_stream(&self) -> u64 {
        self.streams.open()
    }

    /// Resolve once the connection is closed, by us or by the peer.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Application streams opened so far.
    pub fn streams(&self) -> u64 {
        self.streams.total()
    }

    async fn write_frame(&self, frame: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await
    }

    async fn exchange(&self, request: u64, reply: oneshot::Receiver<()>) -> Result<(), String> {
        self.write_frame(&encode_ping(request))
            .await
            .map_err(|e| format!("write failed: {}", e))?;
        reply.await.map_err(|_| "connection closed".to_string())
    }
}

impl HeartbeatTransport for TcpHeartbeatTransport {
    async fn send_probe(&self, timeout: Duration) -> ProbeOutcome {
        if self.state.load() != TransportState::Open {
            return ProbeOutcome::Error(format!("connection {}", self.state.load()));
        }

        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request, tx);

        let result = tokio::time::timeout(timeout, self.exchange(request, rx)).await;
        self.pending.remove(&request);

        match result {
            Ok(Ok(())) => ProbeOutcome::Success,
            Ok(Err(error)) => ProbeOutcome::Error(error),
            Err(_) => ProbeOutcome::Timeout,
        }
    }

    fn close(&self) {
        if !self.state.transition(TransportState::Open, TransportState::Closing) {
            return;
        }
        self.reader.abort();
        let writer = self.writer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = writer.lock().await.shutdown().await;
            });
        }
        self.state.store(TransportState::Closed);
        self.pending.clear();
        self.closed.send_replace(true);
        tracing::debug!(connection_id = %self.id, peer = %self.peer, "Heartbeat connection closed");
    }

    fn state(&self) -> TransportState {
        self.state.load()
    }

    fn activity(&self) -> u64 {
        self.streams.total()
    }
}

impl Drop for TcpHeartbeatTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(
    id: ConnectionId,
    read: OwnedReadHalf,
    pending: Pending,
    state: Arc<AtomicTransportState>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_pong(&line) {
                Some(request) => {
                    if let Some((_, waiter)) = pending.remove(&request) {
                        let _ = waiter.send(());
                    } else {
                        tracing::trace!(connection_id = %id, request, "Late heartbeat reply");
                    }
                }
                None => tracing::trace!(connection_id = %id, frame = %line, "Ignoring unknown frame"),
            },
            Ok(None) => {
                tracing::debug!(connection_id = %id, "Upstream closed connection");
                break;
            }
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "Heartbeat read failed");
                break;
            }
        }
    }
    state.store(TransportState::Closed);
    // dropping the senders fails every waiting probe
    pending.clear();
    closed.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn frames_parse() {
        assert_eq!(parse_ping(&encode_ping(42)), Some(42));
        assert_eq!(parse_pong("PONG 7\r\n"), Some(7));
        assert_eq!(parse_pong("PING 7"), None);
        assert_eq!(parse_pong("PONG"), None);
        assert_eq!(parse_pong("PONG x"), None);
        assert_eq!(parse_pong("PONGS 1"), None);
    }

    async fn echo_server(reply: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if let (true, Some(id)) = (reply, parse_ping(&line)) {
                            if write.write_all(encode_pong(id).as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_succeeds_against_responsive_peer() {
        let addr = echo_server(true).await;
        let transport = TcpHeartbeatTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(transport.state(), TransportState::Open);
        for _ in 0..3 {
            assert_eq!(transport.send_probe(Duration::from_secs(1)).await, ProbeOutcome::Success);
        }
        assert!(transport.pending.is_empty());
    }

    #[tokio::test]
    async fn probe_times_out_against_silent_peer() {
        let addr = echo_server(false).await;
        let transport = TcpHeartbeatTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();

        let outcome = transport.send_probe(Duration::from_millis(30)).await;
        assert_eq!(outcome, ProbeOutcome::Timeout);
        assert!(transport.pending.is_empty());
    }

    #[tokio::test]
    async fn closed_transport_reports_error() {
        let addr = echo_server(true).await;
        let transport = TcpHeartbeatTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();

        transport.close();
        transport.close();
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(matches!(
            transport.send_probe(Duration::from_millis(50)).await,
            ProbeOutcome::Error(_)
        ));
    }

    #[tokio::test]
    async fn streams_count_as_activity() {
        let addr = echo_server(true).await;
        let transport = TcpHeartbeatTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(transport.activity(), 0);
        transport.send_probe(Duration::from_secs(1)).await;
        assert_eq!(transport.activity(), 0);
        transport.open_stream();
        assert_eq!(transport.activity(), 1);
    }

    #[tokio::test]
    async fn peer_hangup_marks_transport_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = TcpHeartbeatTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();

        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        tokio::time::timeout(Duration::from_secs(1), transport.closed())
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn local_close_resolves_closed() {
        let addr = echo_server(true).await;
        let transport = TcpHeartbeatTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();

        transport.close();
        tokio::time::timeout(Duration::from_millis(100), transport.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connect_refused_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpHeartbeatTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
