//! Warmup gate
//!
//! The first executions after startup are skewed by cold caches and lazy
//! initialization, so nothing is monitored until both a request count and a
//! time window have passed.

use apm_types::Clock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Count- and time-based warmup tracker
pub struct Warmup {
    warmup_requests: u64,
    deadline_nanos: u64,
    requests: AtomicU64,
    warmed_up: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl Warmup {
    /// Start the warmup window now
    ///
    /// # Arguments
    ///
    /// * `warmup_requests` - executions that are never monitored
    /// * `warmup_period` - time after creation during which nothing is monitored
    pub fn new(warmup_requests: u64, warmup_period: Duration, clock: Arc<dyn Clock>) -> Self {
        let deadline_nanos = clock.now_nanos().saturating_add(warmup_period.as_nanos() as u64);
        Self {
            warmup_requests,
            deadline_nanos,
            requests: AtomicU64::new(0),
            warmed_up: AtomicBool::new(false),
            clock,
        }
    }

    /// Count one execution and report whether warmup is over
    ///
    /// The Nth call with N <= `warmup_requests` returns false. Once true,
    /// it stays true and stops counting.
    pub fn check(&self) -> bool {
        if self.warmed_up.load(Ordering::Relaxed) {
            return true;
        }
        let seen = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let warmed_up = seen > self.warmup_requests && self.clock.now_nanos() >= self.deadline_nanos;
        if warmed_up {
            self.warmed_up.store(true, Ordering::Relaxed);
        }
        warmed_up
    }

    /// Whether warmup is over, without counting an execution
    pub fn is_warmed_up(&self) -> bool {
        self.warmed_up.load(Ordering::Relaxed)
    }

    /// Executions counted during warmup
    pub fn requests_seen(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}
