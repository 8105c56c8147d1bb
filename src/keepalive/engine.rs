//! Per-connection keepalive state machine.
//!
//! # States
//! ```text
//! Idle ──start_schedule──▶ Scheduled ──timer──▶ Probing ──▶ Scheduled
//!   │                          │                   │
//!   └──────────── stop / failure threshold / idle ceiling ──▶ Closed
//! ```
//!
//! # Triggers
//! - `send_keep_alive`: one tick; sends a real probe once the tick threshold
//!   for the current mode is reached
//! - `start_schedule`: self-rescheduling loop of ticks
//! - `start_idle_timeout`: reclaim connections that stay idle
//! - `stop`: explicit shutdown
//!
//! Every close path goes through one compare-and-swap on `stopped`, so the
//! transport is closed and the stop signal fired exactly once no matter which
//! trigger gets there first.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;

use crate::keepalive::callback::{CallbackRegistry, KeepaliveCallback, KeepaliveStatus};
use crate::keepalive::idle::IdleTracker;
use crate::keepalive::policy::{KeepalivePolicy, PolicyStore};
use crate::keepalive::timer::{Timer, TimerHandle, TokioTimer};
use crate::keepalive::transport::{HeartbeatTransport, ProbeOutcome, TransportState};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;

/// Per-connection timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Max wait for one probe's reply.
    pub timeout: Duration,
    /// Base period of the schedule loop.
    pub interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            interval: Duration::from_secs(15),
        }
    }
}

/// Probing mode, derived from the failure count and the current policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Healthy,
    Failing,
    FastFailing,
}

impl Mode {
    pub fn derive(fail_count: u32, policy: &KeepalivePolicy) -> Self {
        match (fail_count, policy.fast_fail) {
            (0, _) => Mode::Healthy,
            (_, true) => Mode::FastFailing,
            (_, false) => Mode::Failing,
        }
    }
}

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Scheduled,
    Probing,
    Closed,
}

/// Why an engine closed its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `fail_count_to_close` consecutive probes failed.
    HeartbeatFailure,
    /// The connection stayed idle for `max_idle_count` probe cycles.
    IdleTimeout,
    /// `stop()` was called.
    Stopped,
    /// The transport was found closed underneath the engine.
    ConnectionClosed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::HeartbeatFailure => "heartbeat_failure",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Stopped => "stopped",
            CloseReason::ConnectionClosed => "connection_closed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot, multi-waiter notification that an engine closed.
///
/// Subscribing after the close still observes it.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl StopSignal {
    pub fn reason(&self) -> Option<CloseReason> {
        *self.rx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait for the close. An engine dropped without closing reports `Stopped`.
    pub async fn wait(&mut self) -> CloseReason {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(CloseReason::Stopped),
            Err(_) => CloseReason::Stopped,
        }
    }
}

/// Builder for [`KeepAlive`].
pub struct KeepAliveBuilder<T> {
    transport: T,
    config: KeepAliveConfig,
    policy: Option<Arc<PolicyStore>>,
    timer: Option<Arc<dyn Timer>>,
    connection_id: Option<ConnectionId>,
}

impl<T: HeartbeatTransport> KeepAliveBuilder<T> {
    pub fn config(mut self, config: KeepAliveConfig) -> Self {
        self.config = config;
        self
    }

    /// Read policy from `store` instead of the process-wide one.
    pub fn policy_store(mut self, store: Arc<PolicyStore>) -> Self {
        self.policy = Some(store);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    pub fn build(self) -> KeepAlive<T> {
        let (stop_tx, _) = watch::channel(None);
        KeepAlive {
            inner: Arc::new(Inner {
                id: self.connection_id.unwrap_or_default(),
                transport: self.transport,
                config: self.config,
                policy: self.policy.unwrap_or_else(PolicyStore::global),
                timer: self
                    .timer
                    .unwrap_or_else(|| Arc::new(TokioTimer) as Arc<dyn Timer>),
                callbacks: CallbackRegistry::new(),
                heartbeat_fail_count: AtomicU32::new(0),
                tick_count: AtomicU32::new(0),
                idle: Mutex::new(IdleTracker::new()),
                stopped: AtomicBool::new(false),
                scheduling: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                schedule_timer: Mutex::new(None),
                fast_retry: Mutex::new(None),
                stop_tx,
            }),
        }
    }
}

/// Keepalive engine bound to one upstream connection.
///
/// Cheap to clone; clones drive the same engine.
pub struct KeepAlive<T: HeartbeatTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: HeartbeatTransport> Clone for KeepAlive<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: HeartbeatTransport> fmt::Debug for KeepAlive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAlive")
            .field("connection_id", &self.inner.id)
            .field("state", &self.state())
            .field("heartbeat_fail_count", &self.heartbeat_fail_count())
            .finish()
    }
}

impl<T: HeartbeatTransport> KeepAlive<T> {
    /// Engine using the process-wide policy and a Tokio timer.
    pub fn new(transport: T, config: KeepAliveConfig) -> Self {
        Self::builder(transport).config(config).build()
    }

    pub fn builder(transport: T) -> KeepAliveBuilder<T> {
        KeepAliveBuilder {
            transport,
            config: KeepAliveConfig::default(),
            policy: None,
            timer: None,
            connection_id: None,
        }
    }

    /// One tick. Sends a real probe when the tick threshold is reached.
    ///
    /// Outcomes are reported to callbacks only; nothing is returned.
    pub async fn send_keep_alive(&self) {
        self.inner.tick().await;
    }

    /// Start the self-rescheduling probe loop. Calling it again while the
    /// loop runs has no effect.
    pub fn start_schedule(&self) {
        self.inner.start_schedule();
    }

    /// Begin reclaiming the connection once it stays idle for the policy's
    /// `max_idle_count` probe cycles.
    pub fn start_idle_timeout(&self) {
        let activity = self.inner.transport.activity();
        lock(&self.inner.idle).start(activity);
        tracing::debug!(connection_id = %self.inner.id, "Idle watchdog started");
    }

    pub fn add_callback<C>(&self, callback: C)
    where
        C: KeepaliveCallback + 'static,
    {
        self.inner.callbacks.add(Arc::new(callback));
    }

    /// Close the engine and its connection. Idempotent.
    pub fn stop(&self) {
        self.inner.close(CloseReason::Stopped);
    }

    /// Close with `ConnectionClosed` if the transport is already closed
    /// underneath the engine. Returns true if this call closed it.
    pub fn connection_lost(&self) -> bool {
        if self.inner.transport.state() != TransportState::Closed {
            return false;
        }
        self.inner.close(CloseReason::ConnectionClosed)
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            rx: self.inner.stop_tx.subscribe(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.stop_tx.borrow()
    }

    pub fn heartbeat_fail_count(&self) -> u32 {
        self.inner.heartbeat_fail_count.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> u32 {
        lock(&self.inner.idle).idle_count()
    }

    pub fn mode(&self) -> Mode {
        let policy = self.inner.policy.load();
        self.inner.mode(&policy)
    }

    pub fn state(&self) -> EngineState {
        let inner = &self.inner;
        if inner.is_stopped() {
            EngineState::Closed
        } else if inner.in_flight.load(Ordering::Acquire) > 0 {
            EngineState::Probing
        } else if inner.scheduling.load(Ordering::Acquire) || lock(&inner.fast_retry).is_some() {
            EngineState::Scheduled
        } else {
            EngineState::Idle
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn config(&self) -> KeepAliveConfig {
        self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }
}

struct Inner<T> {
    id: ConnectionId,
    transport: T,
    config: KeepAliveConfig,
    policy: Arc<PolicyStore>,
    timer: Arc<dyn Timer>,
    callbacks: CallbackRegistry,
    heartbeat_fail_count: AtomicU32,
    tick_count: AtomicU32,
    idle: Mutex<IdleTracker>,
    stopped: AtomicBool,
    scheduling: AtomicBool,
    in_flight: AtomicUsize,
    schedule_timer: Mutex<Option<TimerHandle>>,
    fast_retry: Mutex<Option<TimerHandle>>,
    stop_tx: watch::Sender<Option<CloseReason>>,
}

impl<T: HeartbeatTransport> Inner<T> {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn mode(&self, policy: &KeepalivePolicy) -> Mode {
        Mode::derive(self.heartbeat_fail_count.load(Ordering::Acquire), policy)
    }

    async fn tick(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        if self.transport.state() == TransportState::Closed {
            self.close(CloseReason::ConnectionClosed);
            return;
        }

        let policy = self.policy.load();
        if !self.advance_tick(&policy) {
            return;
        }
        if self.idle_exhausted(&policy) {
            self.close(CloseReason::IdleTimeout);
            return;
        }
        self.probe().await;
    }

    /// Count one tick; true when it reaches the threshold for the current mode.
    fn advance_tick(&self, policy: &KeepalivePolicy) -> bool {
        let threshold = policy.tick_threshold(self.heartbeat_fail_count.load(Ordering::Acquire));
        let previous = match self
            .tick_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                let next = count.saturating_add(1);
                Some(if next >= threshold { 0 } else { next })
            }) {
            Ok(prev) | Err(prev) => prev,
        };
        let reached = previous.saturating_add(1) >= threshold;
        if !reached {
            tracing::trace!(
                connection_id = %self.id,
                tick = previous + 1,
                threshold,
                "Keepalive tick below threshold"
            );
        }
        reached
    }

    fn idle_exhausted(&self, policy: &KeepalivePolicy) -> bool {
        let mut idle = lock(&self.idle);
        let exhausted = idle.observe(self.transport.activity(), policy.max_idle_count);
        if exhausted {
            tracing::debug!(
                connection_id = %self.id,
                idle_count = idle.idle_count(),
                max_idle_count = policy.max_idle_count,
                "Connection idle ceiling reached"
            );
        }
        exhausted
    }

    async fn probe(self: &Arc<Self>) {
        let outcome = {
            let _probing = InFlight::enter(&self.in_flight);
            let timeout = self.config.timeout;
            match tokio::time::timeout(timeout, self.transport.send_probe(timeout)).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Timeout,
            }
        };
        self.handle_outcome(outcome);
    }

    fn handle_outcome(self: &Arc<Self>, outcome: ProbeOutcome) {
        if self.is_stopped() {
            tracing::trace!(connection_id = %self.id, ?outcome, "Probe resolved after close, dropped");
            return;
        }
        let policy = self.policy.load();

        match outcome {
            ProbeOutcome::Success => {
                let previous = self.heartbeat_fail_count.swap(0, Ordering::AcqRel);
                if self.is_stopped() {
                    return;
                }
                if previous > 0 {
                    tracing::info!(
                        connection_id = %self.id,
                        failures = previous,
                        "Upstream heartbeat recovered"
                    );
                    self.cancel_fast_retry();
                } else {
                    tracing::debug!(connection_id = %self.id, "Heartbeat ok");
                }
                metrics::record_probe(KeepaliveStatus::Success.as_str());
                self.callbacks.notify(KeepaliveStatus::Success);
            }
            ProbeOutcome::Timeout | ProbeOutcome::Error(_) => {
                let failures = self.heartbeat_fail_count.fetch_add(1, Ordering::AcqRel) + 1;
                // a close may have landed since the check above
                if self.is_stopped() {
                    self.heartbeat_fail_count.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                match &outcome {
                    ProbeOutcome::Error(error) => tracing::debug!(
                        connection_id = %self.id,
                        failures,
                        error = %error,
                        "Heartbeat send failed"
                    ),
                    _ => tracing::debug!(connection_id = %self.id, failures, "Heartbeat timed out"),
                }
                if failures == 1 {
                    tracing::warn!(
                        connection_id = %self.id,
                        fast_fail = policy.fast_fail,
                        "Upstream heartbeat failing"
                    );
                }
                metrics::record_probe(KeepaliveStatus::Timeout.as_str());

                if failures >= policy.fail_count_to_close {
                    // only the probe that wins the close reports the final timeout
                    if self.begin_close() {
                        self.callbacks.notify(KeepaliveStatus::Timeout);
                        self.finish_close(CloseReason::HeartbeatFailure);
                    }
                    return;
                }

                self.callbacks.notify(KeepaliveStatus::Timeout);
                if policy.fast_fail && !self.scheduling.load(Ordering::Acquire) {
                    self.arm_fast_retry(policy.fast_send_interval);
                }
            }
        }
    }

    fn start_schedule(self: &Arc<Self>) {
        if self.is_stopped() || self.scheduling.swap(true, Ordering::AcqRel) {
            return;
        }
        // the loop owns fast retries from here on
        self.cancel_fast_retry();
        tracing::debug!(
            connection_id = %self.id,
            interval_ms = self.config.interval.as_millis() as u64,
            "Keepalive schedule started"
        );
        self.arm_schedule(self.config.interval);
    }

    fn arm_schedule(self: &Arc<Self>, delay: Duration) {
        let mut slot = lock(&self.schedule_timer);
        if self.is_stopped() {
            return;
        }
        let inner = self.clone();
        let task = async move {
            inner.tick().await;
            inner.reschedule();
        }
        .boxed();
        *slot = Some(self.timer.schedule(delay, task));
    }

    fn reschedule(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let policy = self.policy.load();
        let delay = match self.mode(&policy) {
            Mode::FastFailing => policy.fast_send_interval,
            Mode::Healthy | Mode::Failing => self.config.interval,
        };
        self.arm_schedule(delay);
    }

    fn arm_fast_retry(self: &Arc<Self>, delay: Duration) {
        // held across schedule() so the task cannot clear the slot before it is filled
        let mut slot = lock(&self.fast_retry);
        if slot.is_some() || self.is_stopped() {
            return;
        }
        let inner = self.clone();
        let task = async move {
            lock(&inner.fast_retry).take();
            if inner.is_stopped() {
                return;
            }
            let policy = inner.policy.load();
            if inner.mode(&policy) != Mode::FastFailing {
                return;
            }
            tracing::trace!(connection_id = %inner.id, "Fast-fail retry");
            inner.probe().await;
        }
        .boxed();
        *slot = Some(self.timer.schedule(delay, task));
    }

    fn cancel_fast_retry(&self) {
        if let Some(handle) = lock(&self.fast_retry).take() {
            handle.cancel();
        }
    }

    fn close(&self, reason: CloseReason) -> bool {
        if !self.begin_close() {
            return false;
        }
        self.finish_close(reason);
        true
    }

    fn begin_close(&self) -> bool {
        self.stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish_close(&self, reason: CloseReason) {
        if let Some(handle) = lock(&self.schedule_timer).take() {
            handle.cancel();
        }
        self.cancel_fast_retry();
        self.scheduling.store(false, Ordering::Release);

        if self.transport.state() != TransportState::Closed {
            self.transport.close();
        }
        self.stop_tx.send_replace(Some(reason));

        match reason {
            CloseReason::HeartbeatFailure => tracing::warn!(
                connection_id = %self.id,
                failures = self.heartbeat_fail_count.load(Ordering::Acquire),
                "Closing connection: heartbeat failure threshold reached"
            ),
            CloseReason::IdleTimeout => tracing::info!(
                connection_id = %self.id,
                "Closing idle connection"
            ),
            CloseReason::ConnectionClosed => tracing::info!(
                connection_id = %self.id,
                "Connection closed underneath keepalive"
            ),
            CloseReason::Stopped => tracing::debug!(
                connection_id = %self.id,
                "Keepalive stopped"
            ),
        }
        metrics::record_connection_closed(reason.as_str());
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
