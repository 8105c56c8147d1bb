//! Probe outcome observers.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Outcome of one keepalive probe, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeepaliveStatus {
    Success,
    Timeout,
}

impl KeepaliveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeepaliveStatus::Success => "success",
            KeepaliveStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for KeepaliveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer notified after every probe. May be called from several tasks at once.
pub trait KeepaliveCallback: Send + Sync {
    fn on_outcome(&self, status: KeepaliveStatus);
}

impl<F> KeepaliveCallback for F
where
    F: Fn(KeepaliveStatus) + Send + Sync,
{
    fn on_outcome(&self, status: KeepaliveStatus) {
        self(status)
    }
}

/// Copy-on-write list of observers.
///
/// Registration swaps in a new list; notification walks whatever list was
/// current when it started.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: ArcSwap<Vec<Arc<dyn KeepaliveCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: Arc<dyn KeepaliveCallback>) {
        self.callbacks.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(callback.clone());
            next
        });
    }

    pub fn notify(&self, status: KeepaliveStatus) {
        let snapshot = self.callbacks.load();
        for callback in snapshot.iter() {
            callback.on_outcome(status);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("len", &self.len())
            .finish()
    }
}
