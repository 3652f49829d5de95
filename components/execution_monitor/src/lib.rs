//! Execution monitoring
//!
//! Wraps units of work (requests, jobs, outgoing calls) with call tree
//! profiling, timers, error counters and report hand-off.
//!
//! # Features
//!
//! - **ExecutionMonitor**: warmup, sampling, timing and post-execute lifecycle
//! - **MonitoredExecution** / **AsyncMonitoredExecution**: work descriptors
//! - **MetricsSink**: timer and error counter destination, with
//!   [`InMemoryMetrics`] as the in-process implementation
//! - **CallTreeReporter**: consumers of finished executions, with
//!   [`LogCallTreeReporter`] writing rendered trees to the log

mod execution;
mod metrics;
mod monitor;
mod reporter;

pub use execution::{AsyncMonitoredExecution, ExecutionInfo, FnExecution, MonitoredExecution};
pub use metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot, TimerStats, ALL};
pub use monitor::ExecutionMonitor;
pub use reporter::{CallTreeReporter, ExecutionReport, LogCallTreeReporter};
