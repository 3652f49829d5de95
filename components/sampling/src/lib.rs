//! Sampling and rate limiting
//!
//! Decides, cheaply and per execution, whether a call tree is recorded at
//! all and whether a finished tree is handed to reporters.
//!
//! # Features
//!
//! - **RateLimiter**: thread-safe token bucket
//! - **RateLimit**: per-minute admission gate with unlimited and closed shortcuts
//! - **Warmup**: request-count and time based startup window
//! - **SamplingPolicy**: combines the above into profiling and reporting decisions

mod policy;
mod rate_limiter;
mod warmup;

pub use policy::SamplingPolicy;
pub use rate_limiter::{RateLimit, RateLimiter};
pub use warmup::Warmup;
