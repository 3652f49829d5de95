//! Public API of the APM profiler
//!
//! [`ApmAgent`] wires the profiler, sampling policy, metrics and reporters
//! from one [`ProfilerConfig`] and is the handle applications keep for the
//! lifetime of the process.
//!
//! # Example
//!
//! ```
//! use apm_api::{ApmAgent, CallStack, FnExecution, ProfilerConfig};
//!
//! let agent = ApmAgent::new(ProfilerConfig::default()).unwrap();
//! let mut stack = agent.call_stack();
//!
//! let total = agent.monitor(
//!     &mut stack,
//!     FnExecution::new("GET /orders", |stack: &mut CallStack| {
//!         let _load = stack.scope("loadOrders");
//!         Ok::<_, std::io::Error>(3)
//!     }),
//! );
//! assert_eq!(total.unwrap(), 3);
//! assert_eq!(agent.metrics().timer("GET /orders").unwrap().count, 1);
//! ```

#![warn(missing_docs)]

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// Re-export public types of the component crates
pub use apm_types::{
    Clock, ConfigError, ManualClock, MetricsError, MonotonicClock, OperationType, ProfilerConfig,
    ProfilerConfigBuilder, ProfilerError, ReportError, SharedConfig, UNLIMITED_RATE_PER_MINUTE,
};
pub use call_tree::{
    task_context, CallNode, CallStack, CallStackState, CallTree, CallTreeSnapshot, NodePool, NodeRef, Profiler,
    ScopeGuard, TreeRenderer,
};
pub use execution_monitor::{
    AsyncMonitoredExecution, CallTreeReporter, ExecutionInfo, ExecutionMonitor, ExecutionReport, FnExecution,
    InMemoryMetrics, LogCallTreeReporter, MetricsSink, MetricsSnapshot, MonitoredExecution, TimerStats, ALL,
};
pub use sampling::{RateLimit, RateLimiter, SamplingPolicy, Warmup};

/// Process-wide profiling agent
pub struct ApmAgent {
    profiler: Arc<Profiler>,
    metrics: Arc<InMemoryMetrics>,
    monitor: ExecutionMonitor,
}

impl ApmAgent {
    /// Create an agent with a monotonic clock
    ///
    /// # Arguments
    ///
    /// * `config` - initial configuration
    ///
    /// # Returns
    ///
    /// Returns `Err(ConfigError)` when the configuration is invalid.
    pub fn new(config: ProfilerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Create an agent that measures time with `clock`
    pub fn with_clock(config: ProfilerConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!("Creating APM agent: {:?}", config);

        let profiler = Profiler::from_config(&config, Arc::clone(&clock));
        let policy = Arc::new(SamplingPolicy::new(&config, clock));
        let metrics = Arc::new(InMemoryMetrics::new());
        let shared = SharedConfig::new(config);
        let monitor = ExecutionMonitor::new(Arc::clone(&profiler), policy, metrics.clone(), shared.clone());
        monitor.add_reporter(Arc::new(LogCallTreeReporter::new(shared)));

        Ok(Self {
            profiler,
            metrics,
            monitor,
        })
    }

    /// Create an agent from a JSON configuration document
    ///
    /// Missing keys take their default values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Self::new(ProfilerConfig::from_json(json)?)
    }

    /// Create an agent from a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profiler config {}", path.display()))?;
        let agent = Self::from_json_str(&json)
            .with_context(|| format!("invalid profiler config {}", path.display()))?;
        info!("Loaded profiler config from {}", path.display());
        Ok(agent)
    }

    /// New inactive call stack for one execution
    pub fn call_stack(&self) -> CallStack {
        self.profiler.call_stack()
    }

    /// Profiler shared by all call stacks
    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    /// Run `execution` under monitoring, see [`ExecutionMonitor::monitor`]
    pub fn monitor<E>(&self, stack: &mut CallStack, execution: E) -> Result<E::Output, E::Error>
    where
        E: MonitoredExecution,
    {
        self.monitor.monitor(stack, execution)
    }

    /// Run an async `execution` under monitoring, see
    /// [`ExecutionMonitor::monitor_async`]
    pub async fn monitor_async<E>(&self, stack: &mut CallStack, execution: E) -> Result<E::Output, E::Error>
    where
        E: AsyncMonitoredExecution,
    {
        self.monitor.monitor_async(stack, execution).await
    }

    /// Run an async `execution` nested in the current task's call stack,
    /// see [`ExecutionMonitor::monitor_in_task`]
    pub async fn monitor_in_task<E>(&self, execution: E) -> Result<E::Output, E::Error>
    where
        E: AsyncMonitoredExecution,
    {
        self.monitor.monitor_in_task(execution).await
    }

    /// Register an additional reporter
    pub fn add_reporter(&self, reporter: Arc<dyn CallTreeReporter>) {
        self.monitor.add_reporter(reporter);
    }

    /// In-process metrics
    pub fn metrics(&self) -> &Arc<InMemoryMetrics> {
        &self.metrics
    }

    /// Underlying execution monitor
    pub fn execution_monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    /// Copy of the current configuration
    pub fn config(&self) -> ProfilerConfig {
        self.monitor.config().snapshot()
    }

    /// Replace the configuration at runtime
    ///
    /// Invalid configurations are rejected and the current one stays in place.
    pub fn reload_config(&self, config: ProfilerConfig) -> Result<(), ConfigError> {
        self.monitor.reconfigure(config)?;
        info!("Profiler configuration reloaded");
        Ok(())
    }
}
