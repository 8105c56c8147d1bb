//! Idle connection accounting.
//!
//! Counts consecutive probe cycles in which the transport carried no
//! application traffic. Activity is detected by comparing the transport's
//! monotonic activity marker with the one seen on the previous cycle.

/// Per-engine idle counter.
#[derive(Debug, Default)]
pub struct IdleTracker {
    enabled: bool,
    idle_count: u32,
    last_activity: u64,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin counting from the given activity marker.
    pub fn start(&mut self, activity: u64) {
        self.enabled = true;
        self.idle_count = 0;
        self.last_activity = activity;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }

    /// Account one probe cycle. Returns true once the connection has been idle
    /// for `max_idle_count` cycles. A ceiling of zero never reclaims.
    pub fn observe(&mut self, activity: u64, max_idle_count: u32) -> bool {
        if !self.enabled || max_idle_count == 0 {
            return false;
        }
        if activity != self.last_activity {
            self.last_activity = activity;
            self.idle_count = 0;
            return false;
        }
        self.idle_count = self.idle_count.saturating_add(1);
        self.idle_count >= max_idle_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_until_started() {
        let mut tracker = IdleTracker::new();
        for _ in 0..10 {
            assert!(!tracker.observe(0, 3));
        }
        assert_eq!(tracker.idle_count(), 0);
    }

    #[test]
    fn reclaims_after_max_idle_cycles() {
        let mut tracker = IdleTracker::new();
        tracker.start(7);
        assert!(!tracker.observe(7, 3));
        assert!(!tracker.observe(7, 3));
        assert!(tracker.observe(7, 3));
    }

    #[test]
    fn activity_resets_count() {
        let mut tracker = IdleTracker::new();
        tracker.start(0);
        assert!(!tracker.observe(0, 3));
        assert!(!tracker.observe(0, 3));
        assert!(!tracker.observe(1, 3));
        assert_eq!(tracker.idle_count(), 0);
        assert!(!tracker.observe(1, 3));
        assert!(!tracker.observe(1, 3));
        assert!(tracker.observe(1, 3));
    }

    #[test]
    fn zero_ceiling_disables_reclamation() {
        let mut tracker = IdleTracker::new();
        tracker.start(0);
        for _ in 0..100 {
            assert!(!tracker.observe(0, 0));
        }
    }
}
