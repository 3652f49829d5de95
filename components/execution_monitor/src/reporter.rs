//! Execution reports and the reporters that consume them

use apm_types::{OperationType, ReportError, SharedConfig};
use call_tree::{CallTree, CallTreeSnapshot, TreeRenderer};
use serde::Serialize;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Everything known about one finished top-level execution
///
/// The call tree is borrowed; it is recycled once all reporters returned.
#[derive(Debug)]
pub struct ExecutionReport<'a> {
    /// Unique id of this report
    pub id: Uuid,
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
    /// Recorded tree, when the execution was profiled
    pub call_tree: Option<&'a CallTree>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportDocument<'a> {
    id: Uuid,
    name: &'a str,
    operation_type: OperationType,
    duration_nanos: u64,
    error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_tree: Option<CallTreeSnapshot>,
}

impl ExecutionReport<'_> {
    /// Serialize the report, including the call tree, as JSON
    pub fn to_json(&self) -> Result<String, ReportError> {
        let document = ReportDocument {
            id: self.id,
            name: self.name,
            operation_type: self.operation_type,
            duration_nanos: u64::try_from(self.duration.as_nanos()).unwrap_or(u64::MAX),
            error: self.error,
            error_message: self.error_message,
            call_tree: self.call_tree.and_then(CallTree::snapshot),
        };
        Ok(serde_json::to_string(&document)?)
    }
}

/// Consumer of execution reports
///
/// Reporters run on the thread that finished the execution; failures are
/// logged by the monitor and never reach the monitored code.
pub trait CallTreeReporter: Send + Sync {
    /// Name used in log messages
    fn name(&self) -> &str;

    /// Whether this reporter wants `report`
    fn is_active(&self, report: &ExecutionReport<'_>) -> bool;

    /// Consume one report
    fn report(&self, report: &ExecutionReport<'_>) -> Result<(), ReportError>;
}

/// Writes rendered call trees to the log at info level
///
/// Reads `log_call_stacks` and `ascii_call_tree` from the shared
/// configuration on every report, so both follow configuration reloads.
#[derive(Debug, Clone)]
pub struct LogCallTreeReporter {
    config: SharedConfig,
}

impl LogCallTreeReporter {
    /// Create a reporter driven by `config`
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    /// Text that would be logged for `report`
    pub fn render(&self, report: &ExecutionReport<'_>) -> Option<String> {
        let tree = report.call_tree?;
        let renderer = TreeRenderer::new(self.config.read(|c| c.ascii_call_tree()));
        Some(format!(
            "########## PROFILER ##########\n{} ({} ms{})\n{}",
            report.name,
            report.duration.as_millis(),
            if report.error { ", failed" } else { "" },
            renderer.render(tree)
        ))
    }
}

impl CallTreeReporter for LogCallTreeReporter {
    fn name(&self) -> &str {
        "log"
    }

    fn is_active(&self, report: &ExecutionReport<'_>) -> bool {
        report.call_tree.is_some() && self.config.read(|c| c.log_call_stacks())
    }

    fn report(&self, report: &ExecutionReport<'_>) -> Result<(), ReportError> {
        if let Some(text) = self.render(report) {
            info!("{}", text);
        }
        Ok(())
    }
}
