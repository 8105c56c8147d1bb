//! Boundary between the keepalive engine and a pooled connection.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection state as reported by the transport.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl From<u8> for TransportState {
    fn from(val: u8) -> Self {
        match val {
            0 => TransportState::Open,
            1 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Open => "open",
            TransportState::Closing => "closing",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lock-free cell holding a [`TransportState`].
#[derive(Debug)]
pub struct AtomicTransportState(AtomicU8);

impl AtomicTransportState {
    pub fn new(state: TransportState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> TransportState {
        TransportState::from(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: TransportState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from` to `to`; false if the state was something else.
    pub fn transition(&self, from: TransportState, to: TransportState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Result of a single heartbeat exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The peer answered within the timeout.
    Success,
    /// No answer within the timeout.
    Timeout,
    /// The probe could not be sent or the connection failed underneath it.
    Error(String),
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }
}

/// A connection the engine can probe and, if needed, tear down.
///
/// Implementations carry the protocol framing; the engine only sees outcomes.
pub trait HeartbeatTransport: Send + Sync + 'static {
    /// Send one heartbeat and wait up to `timeout` for its reply.
    fn send_probe(&self, timeout: Duration) -> impl Future<Output = ProbeOutcome> + Send;

    /// Force the connection closed.
    fn close(&self);

    fn state(&self) -> TransportState;

    /// Monotonic count of non-heartbeat streams opened on this connection.
    fn activity(&self) -> u64;
}

impl<T: HeartbeatTransport> HeartbeatTransport for Arc<T> {
    fn send_probe(&self, timeout: Duration) -> impl Future<Output = ProbeOutcome> + Send {
        (**self).send_probe(timeout)
    }

    fn close(&self) {
        (**self).close()
    }

    fn state(&self) -> TransportState {
        (**self).state()
    }

    fn activity(&self) -> u64 {
        (**self).activity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [TransportState::Open, TransportState::Closing, TransportState::Closed] {
            assert_eq!(TransportState::from(state as u8), state);
        }
        assert_eq!(TransportState::from(42), TransportState::Closed);
    }

    #[test]
    fn transition_only_from_expected_state() {
        let state = AtomicTransportState::new(TransportState::Open);
        assert!(state.transition(TransportState::Open, TransportState::Closing));
        assert!(!state.transition(TransportState::Open, TransportState::Closed));
        assert_eq!(state.load(), TransportState::Closing);
    }
}
