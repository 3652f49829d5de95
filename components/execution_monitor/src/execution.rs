//! Work descriptors handed to the monitor

use apm_types::OperationType;
use async_trait::async_trait;
use call_tree::CallStack;
use std::fmt;
use std::time::Duration;

/// Outcome of one monitored execution, passed to post-execute hooks
#[derive(Debug, Clone, Copy)]
pub struct ExecutionInfo<'a> {
    /// Name the execution was monitored under
    pub name: &'a str,
    /// Kind of operation
    pub operation_type: OperationType,
    /// Wall-clock duration of the work
    pub duration: Duration,
    /// Whether the work returned an error or panicked
    pub error: bool,
    /// Display form of the error or panic payload
    pub error_message: Option<&'a str>,
}

/// A unit of synchronous work wrapped by [`crate::ExecutionMonitor::monitor`]
pub trait MonitoredExecution {
    /// Value returned by successful work
    type Output;
    /// Error returned by failed work; passed through to the caller unchanged
    type Error: fmt::Display;

    /// Name used for the root node, timers and reports
    fn name(&self) -> &str;

    /// Kind of operation, selects the reporting rate limit
    fn operation_type(&self) -> OperationType {
        OperationType::Server
    }

    /// Whether this execution is also monitored when it runs inside
    /// another monitored execution
    fn is_forwardable(&self) -> bool {
        false
    }

    /// Run the work
    fn execute(&mut self, stack: &mut CallStack) -> Result<Self::Output, Self::Error>;

    /// Called once the work finished, successfully or not
    fn on_post_execute(&mut self, _info: &ExecutionInfo<'_>) {}
}

/// Async counterpart of [`MonitoredExecution`]
///
/// The call stack is reachable from inside `execute` through
/// [`call_tree::task_context`].
#[async_trait]
pub trait AsyncMonitoredExecution: Send {
    /// Value returned by successful work
    type Output: Send;
    /// Error returned by failed work; passed through to the caller unchanged
    type Error: fmt::Display + Send;

    /// Name used for the root node, timers and reports
    fn name(&self) -> &str;

    /// Kind of operation, selects the reporting rate limit
    fn operation_type(&self) -> OperationType {
        OperationType::Server
    }

    /// Whether this execution is also monitored when nested
    fn is_forwardable(&self) -> bool {
        false
    }

    /// Run the work
    async fn execute(&mut self) -> Result<Self::Output, Self::Error>;

    /// Called once the work finished, successfully or not
    fn on_post_execute(&mut self, _info: &ExecutionInfo<'_>) {}
}

/// [`MonitoredExecution`] built from a name and a closure
///
/// ```
/// use call_tree::CallStack;
/// use execution_monitor::FnExecution;
///
/// let execution = FnExecution::new("nightly-export", |_stack: &mut CallStack| {
///     Ok::<_, std::io::Error>(42)
/// })
/// .forwardable(true);
/// ```
pub struct FnExecution<F> {
    name: String,
    operation_type: OperationType,
    forwardable: bool,
    work: F,
}

impl<F> FnExecution<F> {
    /// Wrap `work` as a server execution called `name`
    pub fn new(name: impl Into<String>, work: F) -> Self {
        Self {
            name: name.into(),
            operation_type: OperationType::Server,
            forwardable: false,
            work,
        }
    }

    /// Set the operation type
    pub fn with_operation_type(mut self, operation_type: OperationType) -> Self {
        self.operation_type = operation_type;
        self
    }

    /// Monitor this execution when nested
    pub fn forwardable(mut self, forwardable: bool) -> Self {
        self.forwardable = forwardable;
        self
    }
}

impl<F, T, E> MonitoredExecution for FnExecution<F>
where
    F: FnMut(&mut CallStack) -> Result<T, E>,
    E: fmt::Display,
{
    type Output = T;
    type Error = E;

    fn name(&self) -> &str {
        &self.name
    }

    fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    fn is_forwardable(&self) -> bool {
        self.forwardable
    }

    fn execute(&mut self, stack: &mut CallStack) -> Result<T, E> {
        (self.work)(stack)
    }
}
