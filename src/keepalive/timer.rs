//! Delayed task scheduling.
//!
//! The engine never sleeps on its own; it hands delayed work to a [`Timer`]
//! so tests can swap in [`ManualTimer`] and step the schedule by hand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::AbortHandle;

/// Runs a task once after a delay.
pub trait Timer: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;
}

/// Cancels a scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Prevent the task from running. A task that already started is aborted
    /// at its next suspension point when the timer supports it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Production timer backed by a spawned Tokio task.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::Acquire) {
                task.await;
            }
        });
        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }
}

struct Pending {
    delay: Duration,
    cancelled: Arc<AtomicBool>,
    task: BoxFuture<'static, ()>,
}

/// Deterministic timer: tasks run only when the test calls [`ManualTimer::fire_next`].
#[derive(Clone, Default)]
pub struct ManualTimer {
    queue: Arc<Mutex<VecDeque<Pending>>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to fire, cancelled ones excluded.
    pub fn pending(&self) -> usize {
        self.lock()
            .iter()
            .filter(|p| !p.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Delays of the waiting tasks, in scheduling order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.lock()
            .iter()
            .filter(|p| !p.cancelled.load(Ordering::Acquire))
            .map(|p| p.delay)
            .collect()
    }

    /// Run the oldest live task to completion. Returns false when nothing was queued.
    pub async fn fire_next(&self) -> bool {
        let next = {
            let mut queue = self.lock();
            loop {
                match queue.pop_front() {
                    Some(p) if p.cancelled.load(Ordering::Acquire) => continue,
                    other => break other,
                }
            }
        };
        match next {
            Some(pending) => {
                pending.task.await;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Pending>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.lock().push_back(Pending {
            delay,
            cancelled: cancelled.clone(),
            task,
        });
        TimerHandle::new(cancelled, None)
    }
}
