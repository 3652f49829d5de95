//! Timers and error counters fed by every monitored execution

use apm_types::MetricsError;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the aggregate timer and error counter updated by every execution
pub const ALL: &str = "All";

/// Destination for per-execution timings and error counts
pub trait MetricsSink: Send + Sync {
    /// Record one execution of `name` that took `elapsed`
    fn update_timer(&self, name: &str, elapsed: Duration) -> Result<(), MetricsError>;

    /// Record one failed execution of `name`
    fn increment_errors(&self, name: &str) -> Result<(), MetricsError>;
}

/// Aggregated timings of one name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerStats {
    /// Number of executions
    pub count: u64,
    /// Sum of all durations in nanoseconds
    pub total_nanos: u64,
    /// Fastest execution in nanoseconds
    pub min_nanos: u64,
    /// Slowest execution in nanoseconds
    pub max_nanos: u64,
}

impl TimerStats {
    fn first(nanos: u64) -> Self {
        Self {
            count: 1,
            total_nanos: nanos,
            min_nanos: nanos,
            max_nanos: nanos,
        }
    }

    fn record(&mut self, nanos: u64) {
        self.count += 1;
        self.total_nanos = self.total_nanos.saturating_add(nanos);
        self.min_nanos = self.min_nanos.min(nanos);
        self.max_nanos = self.max_nanos.max(nanos);
    }

    /// Mean duration in nanoseconds
    pub fn mean_nanos(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_nanos / self.count
        }
    }
}

/// Point-in-time copy of all metrics, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Timers by name
    pub timers: BTreeMap<String, TimerStats>,
    /// Error counters by name
    pub errors: BTreeMap<String, u64>,
}

/// In-process [`MetricsSink`]
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    timers: DashMap<String, TimerStats>,
    errors: DashMap<String, u64>,
}

impl InMemoryMetrics {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Timer of `name`, if it was ever updated
    pub fn timer(&self, name: &str) -> Option<TimerStats> {
        self.timers.get(name).map(|stats| *stats)
    }

    /// Error count of `name`
    pub fn errors(&self, name: &str) -> u64 {
        self.errors.get(name).map_or(0, |count| *count)
    }

    /// Copy all timers and counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timers: self
                .timers
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            errors: self
                .errors
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }

    /// Serialize a snapshot as JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    /// Drop all timers and counters
    pub fn clear(&self) {
        self.timers.clear();
        self.errors.clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn update_timer(&self, name: &str, elapsed: Duration) -> Result<(), MetricsError> {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        if let Some(mut stats) = self.timers.get_mut(name) {
            stats.record(nanos);
            return Ok(());
        }
        self.timers
            .entry(name.to_string())
            .and_modify(|stats| stats.record(nanos))
            .or_insert_with(|| TimerStats::first(nanos));
        Ok(())
    }

    fn increment_errors(&self, name: &str) -> Result<(), MetricsError> {
        *self.errors.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }
}
