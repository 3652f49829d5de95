//! Profiling and reporting admission decisions

use apm_types::{Clock, OperationType, ProfilerConfig};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::rate_limiter::RateLimit;
use crate::warmup::Warmup;

/// Limits derived from the hot-reloadable part of the configuration
#[derive(Debug)]
struct Limits {
    every_x_requests: Option<i64>,
    profiler: RateLimit,
    reporting: HashMap<OperationType, RateLimit>,
}

impl Limits {
    fn from_config(config: &ProfilerConfig, clock: &Arc<dyn Clock>) -> Self {
        Self {
            every_x_requests: config.call_stack_every_x_requests_to_group(),
            profiler: RateLimit::per_minute(config.profiler_rate_limit_per_minute(), Arc::clone(clock)),
            reporting: config
                .reporting_rate_limits()
                .iter()
                .map(|(operation_type, rate)| (*operation_type, RateLimit::per_minute(*rate, Arc::clone(clock))))
                .collect(),
        }
    }
}

/// Decides which executions are profiled and which trees are reported
pub struct SamplingPolicy {
    warmup: Warmup,
    limits: RwLock<Limits>,
    executions_by_name: DashMap<String, u64>,
    clock: Arc<dyn Clock>,
}

impl SamplingPolicy {
    /// Create a policy; the warmup window starts now
    pub fn new(config: &ProfilerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            warmup: Warmup::new(
                config.warmup_requests(),
                Duration::from_secs(config.warmup_seconds()),
                Arc::clone(&clock),
            ),
            limits: RwLock::new(Limits::from_config(config, &clock)),
            executions_by_name: DashMap::new(),
            clock,
        }
    }

    /// Count one execution against the warmup window
    pub fn is_warmed_up(&self) -> bool {
        self.warmup.check()
    }

    /// Whether the execution called `name` should record a call tree
    ///
    /// With grouping configured, every Xth execution of the same name is
    /// profiled (1 means all, less than 1 means none). Otherwise the
    /// profiler rate limit decides.
    pub fn should_profile(&self, name: &str) -> bool {
        let limits = self.limits.read();
        match limits.every_x_requests {
            Some(every) => self.is_xth_execution(name, every),
            None => limits.profiler.check_credit(),
        }
    }

    fn is_xth_execution(&self, name: &str, every: i64) -> bool {
        if every == 1 {
            return true;
        }
        if every < 1 {
            return false;
        }
        let seen = match self.executions_by_name.get_mut(name) {
            Some(mut count) => {
                let seen = *count;
                *count += 1;
                seen
            }
            None => {
                let mut count = self.executions_by_name.entry(name.to_string()).or_insert(0);
                let seen = *count;
                *count += 1;
                seen
            }
        };
        seen % every as u64 == 0
    }

    /// Whether a finished tree of this operation type may be reported
    pub fn should_report(&self, operation_type: OperationType) -> bool {
        self.limits
            .read()
            .reporting
            .get(&operation_type)
            .map_or(true, RateLimit::check_credit)
    }

    /// Rebuild the limits from a new configuration
    ///
    /// Warmup progress and per-name execution counts are kept.
    pub fn reconfigure(&self, config: &ProfilerConfig) {
        debug!("Reconfiguring sampling policy");
        *self.limits.write() = Limits::from_config(config, &self.clock);
    }
}
