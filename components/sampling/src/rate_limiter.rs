//! Token bucket rate limiter
//!
//! Best effort: concurrent callers serialize on a short lock, and a caller
//! racing a refill may be admitted or denied one credit early.

use apm_types::{Clock, UNLIMITED_RATE_PER_MINUTE};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
struct Bucket {
    balance: f64,
    last_refill: u64,
}

/// Token bucket that starts full
pub struct RateLimiter {
    credits_per_nanosecond: f64,
    max_balance: f64,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter
    ///
    /// # Arguments
    ///
    /// * `credits_per_second` - refill rate
    /// * `max_balance` - bucket size, also the initial balance
    /// * `clock` - time source for refills
    pub fn new(credits_per_second: f64, max_balance: f64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_nanos();
        Self {
            credits_per_nanosecond: credits_per_second / 1e9,
            max_balance,
            bucket: Mutex::new(Bucket {
                balance: max_balance,
                last_refill: now,
            }),
            clock,
        }
    }

    /// Try to take `cost` credits
    pub fn check_credit(&self, cost: f64) -> bool {
        let now = self.clock.now_nanos();
        let mut bucket = self.bucket.lock();

        let elapsed = now.saturating_sub(bucket.last_refill);
        bucket.balance = (bucket.balance + elapsed as f64 * self.credits_per_nanosecond).min(self.max_balance);
        bucket.last_refill = now;

        if bucket.balance >= cost {
            bucket.balance -= cost;
            true
        } else {
            false
        }
    }

    /// Refill rate in credits per second
    pub fn credits_per_second(&self) -> f64 {
        self.credits_per_nanosecond * 1e9
    }

    /// Bucket size
    pub fn max_balance(&self) -> f64 {
        self.max_balance
    }

    /// Current balance, without refilling
    pub fn balance(&self) -> f64 {
        self.bucket.lock().balance
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("credits_per_second", &self.credits_per_second())
            .field("max_balance", &self.max_balance)
            .field("bucket", &*self.bucket.lock())
            .finish()
    }
}

/// Admission gate built from a per-minute rate
#[derive(Debug)]
pub enum RateLimit {
    /// Every call is admitted without touching a bucket
    Unlimited,
    /// Calls are admitted through a token bucket
    Limited(RateLimiter),
}

impl RateLimit {
    /// Build a gate for `rate_per_minute` admissions per minute
    ///
    /// Rates at or above [`UNLIMITED_RATE_PER_MINUTE`] admit everything;
    /// zero (or anything not positive) admits nothing. Otherwise the bucket
    /// holds one minute's worth per second, at least one credit.
    pub fn per_minute(rate_per_minute: f64, clock: Arc<dyn Clock>) -> Self {
        if rate_per_minute >= UNLIMITED_RATE_PER_MINUTE {
            return RateLimit::Unlimited;
        }
        if rate_per_minute.is_nan() || rate_per_minute <= 0.0 {
            return RateLimit::Limited(RateLimiter::new(0.0, 0.0, clock));
        }
        let credits_per_second = rate_per_minute / 60.0;
        RateLimit::Limited(RateLimiter::new(credits_per_second, credits_per_second.max(1.0), clock))
    }

    /// Admit one call
    pub fn check_credit(&self) -> bool {
        match self {
            RateLimit::Unlimited => true,
            RateLimit::Limited(limiter) => limiter.check_credit(1.0),
        }
    }

    /// Whether the gate admits everything
    pub fn is_unlimited(&self) -> bool {
        matches!(self, RateLimit::Unlimited)
    }
}
