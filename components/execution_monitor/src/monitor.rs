//! Monitored execution lifecycle
//!
//! [`ExecutionMonitor::monitor`] wraps one unit of work:
//!
//! 1. while monitoring is switched off or warming up, the work runs bare
//! 2. otherwise the sampling policy decides whether the call stack records
//!    a tree rooted at the execution's name
//! 3. the work runs and is timed; panics are caught
//! 4. the post-execute hook runs, the root is closed, timers and error
//!    counters are updated and reporters receive the finished report
//! 5. the work's own result is returned, or its panic resumed
//!
//! Nothing in steps 2 and 4 can change the work's result: instrumentation
//! failures are logged and dropped.

use apm_types::{Clock, ConfigError, OperationType, ProfilerConfig, SharedConfig};
use call_tree::{task_context, CallStack, CallTree, Profiler};
use futures::FutureExt;
use parking_lot::RwLock;
use sampling::SamplingPolicy;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::execution::{AsyncMonitoredExecution, ExecutionInfo, MonitoredExecution};
use crate::metrics::{MetricsSink, ALL};
use crate::reporter::{CallTreeReporter, ExecutionReport};

type PanicPayload = Box<dyn Any + Send + 'static>;

/// How an execution is handled, decided before the work runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Run without any bookkeeping
    Bare,
    /// Runs inside another monitored execution, as a child node
    Nested { entry_depth: usize, forwardable: bool },
    /// Top-level execution, recording a tree when `profiled`
    TopLevel { profiled: bool },
}

/// Result of the work, as seen by the monitor
struct Finished {
    duration: Duration,
    error_message: Option<String>,
    failed: bool,
}

/// Wraps executions with profiling, metrics and reporting
pub struct ExecutionMonitor {
    profiler: Arc<Profiler>,
    policy: Arc<SamplingPolicy>,
    metrics: Arc<dyn MetricsSink>,
    reporters: RwLock<Vec<Arc<dyn CallTreeReporter>>>,
    config: SharedConfig,
}

impl ExecutionMonitor {
    /// Create a monitor
    ///
    /// # Arguments
    ///
    /// * `profiler` - source of call stacks and the time base
    /// * `policy` - warmup, profiling and reporting admission
    /// * `metrics` - destination of timers and error counters
    /// * `config` - live configuration, read on every execution
    pub fn new(
        profiler: Arc<Profiler>,
        policy: Arc<SamplingPolicy>,
        metrics: Arc<dyn MetricsSink>,
        config: SharedConfig,
    ) -> Self {
        Self {
            profiler,
            policy,
            metrics,
            reporters: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Register a reporter for finished executions
    pub fn add_reporter(&self, reporter: Arc<dyn CallTreeReporter>) {
        debug!("Registering call tree reporter: {}", reporter.name());
        self.reporters.write().push(reporter);
    }

    /// Number of registered reporters
    pub fn reporter_count(&self) -> usize {
        self.reporters.read().len()
    }

    /// Profiler whose call stacks this monitor drives
    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    /// Sampling policy
    pub fn policy(&self) -> &Arc<SamplingPolicy> {
        &self.policy
    }

    /// Metrics sink
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Live configuration
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Apply a new configuration
    ///
    /// Rate limits, grouping, the pruning thresholds, the master switch and
    /// the logging flags take effect for the next execution. Warmup and
    /// pooling are fixed at startup.
    pub fn reconfigure(&self, config: ProfilerConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.policy.reconfigure(&config);
        self.profiler
            .set_min_execution_time_nanos(config.min_execution_time_nanos());
        self.config.update(config)?;
        debug!("Execution monitor reconfigured");
        Ok(())
    }

    /// Run `execution` under monitoring
    ///
    /// Returns exactly what the execution returned. A panic in the work is
    /// resumed after the post-execute step.
    pub fn monitor<E>(&self, stack: &mut CallStack, mut execution: E) -> Result<E::Output, E::Error>
    where
        E: MonitoredExecution,
    {
        let name = execution.name().to_string();
        let operation_type = execution.operation_type();
        let mode = self.pre_execute(stack, &name, execution.is_forwardable());
        if mode == Mode::Bare {
            return execution.execute(stack);
        }

        let start = self.now_nanos();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| execution.execute(stack)));
        let finished = self.finished(start, &outcome);

        let info = finished.info(&name, operation_type);
        if panic::catch_unwind(AssertUnwindSafe(|| execution.on_post_execute(&info))).is_err() {
            warn!("Post-execute hook of {} panicked", name);
        }
        self.post_execute(stack, mode, &name, operation_type, &finished);

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Run an async `execution` under monitoring
    ///
    /// `stack` is moved into the task's context while the work runs, so
    /// [`call_tree::task_context`] functions inside the work record into it.
    pub async fn monitor_async<E>(&self, stack: &mut CallStack, mut execution: E) -> Result<E::Output, E::Error>
    where
        E: AsyncMonitoredExecution,
    {
        let name = execution.name().to_string();
        let operation_type = execution.operation_type();
        let mode = self.pre_execute(stack, &name, execution.is_forwardable());

        let start = self.now_nanos();
        let work = AssertUnwindSafe(execution.execute()).catch_unwind();
        let (returned, outcome) = task_context::scope_call_stack(stack.take(), work).await;
        *stack = returned;

        if mode == Mode::Bare {
            return match outcome {
                Ok(result) => result,
                Err(payload) => panic::resume_unwind(payload),
            };
        }

        let finished = self.finished(start, &outcome);
        let info = finished.info(&name, operation_type);
        if panic::catch_unwind(AssertUnwindSafe(|| execution.on_post_execute(&info))).is_err() {
            warn!("Post-execute hook of {} panicked", name);
        }
        self.post_execute(stack, mode, &name, operation_type, &finished);

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Run an async `execution` against the current task's call stack
    ///
    /// Inside the work of [`monitor_async`](Self::monitor_async) the stack
    /// lives in the task's context, so there is no `&mut CallStack` to hand
    /// to a nested execution. This borrows it from the task context for the
    /// duration of `execution`, which then nests (and forwards) exactly as
    /// it would under [`monitor`](Self::monitor). Outside a task context it
    /// runs as a top-level execution on a fresh stack.
    pub async fn monitor_in_task<E>(&self, execution: E) -> Result<E::Output, E::Error>
    where
        E: AsyncMonitoredExecution,
    {
        let Some(mut stack) = task_context::take_call_stack() else {
            let mut stack = self.profiler.call_stack();
            return self.monitor_async(&mut stack, execution).await;
        };
        let outcome = AssertUnwindSafe(self.monitor_async(&mut stack, execution))
            .catch_unwind()
            .await;
        task_context::restore_call_stack(stack);
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.profiler.clock().now_nanos()
    }

    fn pre_execute(&self, stack: &mut CallStack, name: &str, forwardable: bool) -> Mode {
        if !self.config.read(|c| c.monitoring_active()) {
            return Mode::Bare;
        }
        if stack.is_active() {
            let entry_depth = stack.depth();
            stack.start(name);
            return Mode::Nested {
                entry_depth,
                forwardable,
            };
        }
        if !self.policy.is_warmed_up() {
            return Mode::Bare;
        }

        let profiled = self.policy.should_profile(name) && {
            match stack.activate(name) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Not profiling {}: {}", name, e);
                    false
                }
            }
        };
        Mode::TopLevel { profiled }
    }

    fn finished<T, E>(&self, start: u64, outcome: &Result<Result<T, E>, PanicPayload>) -> Finished
    where
        E: std::fmt::Display,
    {
        let duration = Duration::from_nanos(self.now_nanos().saturating_sub(start));
        let (failed, error_message) = match outcome {
            Ok(Ok(_)) => (false, None),
            Ok(Err(e)) => (true, Some(e.to_string())),
            Err(payload) => (true, Some(panic_message(&**payload))),
        };
        Finished {
            duration,
            error_message,
            failed,
        }
    }

    fn post_execute(
        &self,
        stack: &mut CallStack,
        mode: Mode,
        name: &str,
        operation_type: OperationType,
        finished: &Finished,
    ) {
        match mode {
            Mode::Bare => {}
            Mode::Nested {
                entry_depth,
                forwardable,
            } => {
                unwind_to(stack, entry_depth);
                if forwardable {
                    self.record_metrics(name, finished);
                }
            }
            Mode::TopLevel { profiled } => {
                let tree = if profiled { close_root(stack) } else { None };
                self.record_metrics(name, finished);
                if let Some(mut tree) = tree {
                    self.trim(&mut tree);
                    self.report(name, operation_type, finished, Some(&tree));
                    tree.recycle();
                } else {
                    self.report(name, operation_type, finished, None);
                }
            }
        }
    }

    fn record_metrics(&self, name: &str, finished: &Finished) {
        for key in [name, ALL] {
            match panic::catch_unwind(AssertUnwindSafe(|| self.metrics.update_timer(key, finished.duration))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to update timer {}: {}", key, e),
                Err(_) => warn!("Metrics sink panicked updating timer {}", key),
            }
            if finished.failed {
                match panic::catch_unwind(AssertUnwindSafe(|| self.metrics.increment_errors(key))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to count error of {}: {}", key, e),
                    Err(_) => warn!("Metrics sink panicked counting error of {}", key),
                }
            }
        }
    }

    fn trim(&self, tree: &mut CallTree) {
        let percent = self.config.read(|c| c.min_execution_time_percent());
        if percent <= 0.0 {
            return;
        }
        let threshold = (tree.total_execution_time_nanos() as f64 * percent / 100.0) as u64;
        tree.remove_calls_faster_than(threshold);
    }

    fn report(
        &self,
        name: &str,
        operation_type: OperationType,
        finished: &Finished,
        call_tree: Option<&CallTree>,
    ) {
        let reporters = self.reporters.read();
        if reporters.is_empty() {
            return;
        }
        if !self.policy.should_report(operation_type) {
            debug!("Reporting rate limit reached for {} ({})", name, operation_type);
            return;
        }

        let report = ExecutionReport {
            id: Uuid::new_v4(),
            name,
            operation_type,
            duration: finished.duration,
            error: finished.failed,
            error_message: finished.error_message.as_deref(),
            call_tree,
        };
        for reporter in reporters.iter() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                if reporter.is_active(&report) {
                    reporter.report(&report)
                } else {
                    Ok(())
                }
            }));
            match delivered {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Reporter {} failed for {}: {}", reporter.name(), name, e),
                Err(_) => warn!("Reporter {} panicked for {}", reporter.name(), name),
            }
        }
    }
}

impl Finished {
    fn info<'a>(&'a self, name: &'a str, operation_type: OperationType) -> ExecutionInfo<'a> {
        ExecutionInfo {
            name,
            operation_type,
            duration: self.duration,
            error: self.failed,
            error_message: self.error_message.as_deref(),
        }
    }
}

/// Close nodes the work left open until `depth` nodes remain
fn unwind_to(stack: &mut CallStack, depth: usize) {
    while stack.depth() > depth {
        if let Some(tree) = stack.stop() {
            debug!("Nested execution closed the root; discarding the tree");
            tree.recycle();
            return;
        }
    }
}

/// Close every open node including the root and take the tree
fn close_root(stack: &mut CallStack) -> Option<CallTree> {
    while stack.is_active() {
        if let Some(tree) = stack.stop() {
            return Some(tree);
        }
    }
    None
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::FnExecution;
    use crate::metrics::InMemoryMetrics;
    use apm_types::ManualClock;
    use call_tree::NodePool;

    struct Fixture {
        monitor: ExecutionMonitor,
        metrics: Arc<InMemoryMetrics>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: ProfilerConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let profiler = Profiler::new(
            Arc::new(NodePool::new(true)),
            clock.clone(),
            config.min_execution_time_nanos(),
        );
        let policy = Arc::new(SamplingPolicy::new(&config, clock.clone()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let monitor = ExecutionMonitor::new(profiler, policy, metrics.clone(), SharedConfig::new(config));
        Fixture {
            monitor,
            metrics,
            clock,
        }
    }

    #[test]
    fn test_result_is_passed_through() {
        let f = fixture(ProfilerConfig::default());
        let mut stack = f.monitor.profiler().call_stack();

        let ok = f
            .monitor
            .monitor(&mut stack, FnExecution::new("ok", |_: &mut CallStack| Ok::<_, String>(7)));
        let err = f.monitor.monitor(
            &mut stack,
            FnExecution::new("err", |_: &mut CallStack| Err::<(), _>("boom".to_string())),
        );

        assert_eq!(ok, Ok(7));
        assert_eq!(err, Err("boom".to_string()));
        assert!(!stack.is_active());
    }

    #[test]
    fn test_timers_and_error_counters() {
        let f = fixture(ProfilerConfig::default());
        let mut stack = f.monitor.profiler().call_stack();
        let clock = f.clock.clone();

        let _ = f.monitor.monitor(
            &mut stack,
            FnExecution::new("job", move |_: &mut CallStack| {
                clock.advance_millis(3);
                Err::<(), _>("failed")
            }),
        );

        let timer = f.metrics.timer("job").unwrap();
        assert_eq!(timer.count, 1);
        assert_eq!(timer.total_nanos, 3_000_000);
        assert_eq!(f.metrics.timer(ALL).unwrap().count, 1);
        assert_eq!(f.metrics.errors("job"), 1);
        assert_eq!(f.metrics.errors(ALL), 1);
    }

    #[test]
    fn test_inactive_monitoring_runs_bare() {
        let f = fixture(ProfilerConfig::builder().monitoring_active(false).build());
        let mut stack = f.monitor.profiler().call_stack();

        let active = f.monitor.monitor(
            &mut stack,
            FnExecution::new("job", |stack: &mut CallStack| Ok::<_, String>(stack.is_active())),
        );

        assert_eq!(active, Ok(false));
        assert!(f.metrics.timer("job").is_none());
    }

    #[test]
    fn test_profiled_execution_records_tree() {
        let f = fixture(ProfilerConfig::builder().min_execution_time_nanos(0).build());
        let mut stack = f.monitor.profiler().call_stack();

        let depth = f.monitor.monitor(
            &mut stack,
            FnExecution::new("job", |stack: &mut CallStack| {
                stack.start("child");
                let depth = stack.depth();
                stack.stop();
                Ok::<_, String>(depth)
            }),
        );

        assert_eq!(depth, Ok(2));
        assert!(!stack.is_active());
        assert_eq!(f.monitor.profiler().pool().available(), 2);
    }

    #[test]
    fn test_open_nodes_are_closed_after_error() {
        let f = fixture(ProfilerConfig::default());
        let mut stack = f.monitor.profiler().call_stack();

        let _ = f.monitor.monitor(
            &mut stack,
            FnExecution::new("job", |stack: &mut CallStack| {
                stack.start("never stopped");
                stack.start("neither");
                Err::<(), _>("early return")
            }),
        );

        assert!(!stack.is_active());
        assert_eq!(f.monitor.profiler().pool().available(), 3);
    }

    #[test]
    fn test_nested_execution_is_a_child_node() {
        let f = fixture(ProfilerConfig::builder().min_execution_time_nanos(0).build());
        let mut stack = f.monitor.profiler().call_stack();
        stack.activate("outer").unwrap();

        let inner = f.monitor.monitor(
            &mut stack,
            FnExecution::new("inner", |stack: &mut CallStack| {
                Ok::<_, String>(stack.current_signature().map(str::to_string))
            }),
        );

        assert_eq!(inner, Ok(Some("inner".to_string())));
        assert_eq!(stack.depth(), 1);
        assert!(f.metrics.timer("inner").is_none());

        let tree = stack.stop().unwrap();
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_forwardable_nested_execution_updates_metrics() {
        let f = fixture(ProfilerConfig::default());
        let mut stack = f.monitor.profiler().call_stack();
        stack.activate("outer").unwrap();

        let _ = f.monitor.monitor(
            &mut stack,
            FnExecution::new("inner", |_: &mut CallStack| Ok::<_, String>(())).forwardable(true),
        );

        assert_eq!(f.metrics.timer("inner").unwrap().count, 1);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_panic_is_resumed_after_cleanup() {
        let f = fixture(ProfilerConfig::default());
        let mut stack = f.monitor.profiler().call_stack();

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            f.monitor.monitor(
                &mut stack,
                FnExecution::new("job", |stack: &mut CallStack| -> Result<(), String> {
                    stack.start("child");
                    panic!("work panicked");
                }),
            )
        }));

        assert!(caught.is_err());
        assert!(!stack.is_active());
        assert_eq!(f.metrics.errors("job"), 1);
    }

    #[test]
    fn test_reconfigure_switches_monitoring_off() {
        let f = fixture(ProfilerConfig::default());
        let mut stack = f.monitor.profiler().call_stack();

        f.monitor
            .reconfigure(ProfilerConfig::builder().monitoring_active(false).build())
            .unwrap();
        let _ = f
            .monitor
            .monitor(&mut stack, FnExecution::new("job", |_: &mut CallStack| Ok::<_, String>(())));

        assert!(f.metrics.timer("job").is_none());
    }

    #[test]
    fn test_reconfigure_rejects_invalid_config() {
        let f = fixture(ProfilerConfig::default());
        let invalid = ProfilerConfig::builder().min_execution_time_percent(150.0).build();

        assert!(f.monitor.reconfigure(invalid).is_err());
        assert!(f.monitor.config().read(|c| c.monitoring_active()));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&42), "panic");
    }
}
