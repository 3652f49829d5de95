//! Integration tests for the APM public API
//!
//! These tests verify that the agent wires configuration, profiling,
//! metrics and reporting together correctly.

use apm_api::{
    task_context, ApmAgent, AsyncMonitoredExecution, CallStack, CallTreeReporter, CallTreeSnapshot, ExecutionReport,
    FnExecution, ManualClock, OperationType, ProfilerConfig, ReportError, ALL,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct TreeCollector {
    trees: Mutex<Vec<CallTreeSnapshot>>,
}

impl CallTreeReporter for TreeCollector {
    fn name(&self) -> &str {
        "tree-collector"
    }

    fn is_active(&self, report: &ExecutionReport<'_>) -> bool {
        report.call_tree.is_some()
    }

    fn report(&self, report: &ExecutionReport<'_>) -> Result<(), ReportError> {
        if let Some(snapshot) = report.call_tree.and_then(|tree| tree.snapshot()) {
            self.trees.lock().unwrap().push(snapshot);
        }
        Ok(())
    }
}

fn agent_with_collector(config: ProfilerConfig) -> (ApmAgent, Arc<TreeCollector>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let agent = ApmAgent::with_clock(config, clock.clone()).expect("Failed to create agent");
    let collector = Arc::new(TreeCollector::default());
    agent.add_reporter(collector.clone());
    (agent, collector, clock)
}

#[test]
fn test_full_agent_lifecycle() {
    let (agent, collector, clock) = agent_with_collector(ProfilerConfig::default());
    let mut stack = agent.call_stack();

    let result = agent.monitor(
        &mut stack,
        FnExecution::new("GET /orders", |stack: &mut CallStack| {
            {
                let _load = stack.scope("loadOrders");
                clock.advance_millis(8);
            }
            clock.advance_millis(2);
            Ok::<_, String>(())
        }),
    );

    assert!(result.is_ok());
    let trees = collector.trees.lock().unwrap().clone();
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].execution_time, 10_000_000);
    assert_eq!(trees[0].net_execution_time, 2_000_000);
    assert_eq!(trees[0].children[0].signature, "loadOrders");

    let timer = agent.metrics().timer("GET /orders").unwrap();
    assert_eq!(timer.count, 1);
    assert_eq!(timer.total_nanos, 10_000_000);
    assert_eq!(agent.metrics().timer(ALL).unwrap().count, 1);
}

#[test]
fn test_reload_config_applies_to_next_execution() {
    let (agent, collector, clock) = agent_with_collector(ProfilerConfig::default());
    let mut stack = agent.call_stack();

    agent
        .reload_config(ProfilerConfig::builder().profiler_rate_limit_per_minute(0.0).build())
        .expect("Failed to reload config");

    let _ = agent.monitor(
        &mut stack,
        FnExecution::new("job", |_: &mut CallStack| {
            clock.advance_millis(1);
            Ok::<_, String>(())
        }),
    );

    assert!(collector.trees.lock().unwrap().is_empty());
    assert_eq!(agent.metrics().timer("job").unwrap().count, 1);
}

#[test]
fn test_invalid_reload_keeps_current_config() {
    let agent = ApmAgent::new(ProfilerConfig::builder().warmup_requests(4).build()).unwrap();

    let invalid = ProfilerConfig::builder().profiler_rate_limit_per_minute(-1.0).build();
    assert!(agent.reload_config(invalid).is_err());
    assert_eq!(agent.config().warmup_requests(), 4);
}

#[test]
fn test_from_json_file() {
    let path = std::env::temp_dir().join(format!("apm-profiler-config-{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{
            "min_execution_time_nanos": 0,
            "call_stack_every_x_requests_to_group": 2,
            "reporting_rate_limit_per_minute_per_operation_type": {"external": 10.0}
        }"#,
    )
    .unwrap();

    let agent = ApmAgent::from_json_file(&path).expect("Failed to load config file");
    std::fs::remove_file(&path).ok();

    let config = agent.config();
    assert_eq!(config.min_execution_time_nanos(), 0);
    assert_eq!(config.call_stack_every_x_requests_to_group(), Some(2));
    assert_eq!(config.reporting_rate_limit_per_minute(OperationType::External), 10.0);
    assert!(config.monitoring_active());
}

#[test]
fn test_from_json_file_with_invalid_values() {
    let path = std::env::temp_dir().join(format!("apm-profiler-invalid-{}.json", std::process::id()));
    std::fs::write(&path, r#"{"min_execution_time_percent": 250.0}"#).unwrap();

    let result = ApmAgent::from_json_file(&path);
    std::fs::remove_file(&path).ok();

    let message = format!("{:#}", result.err().unwrap());
    assert!(message.contains("invalid profiler config"));
    assert!(message.contains("min_execution_time_percent"));
}

#[test]
fn test_metrics_snapshot_as_json() {
    let (agent, _, _) = agent_with_collector(ProfilerConfig::default());
    let mut stack = agent.call_stack();

    let _ = agent.monitor(
        &mut stack,
        FnExecution::new("job", |_: &mut CallStack| Err::<(), _>("failed")),
    );

    let json: serde_json::Value = serde_json::from_str(&agent.metrics().to_json().unwrap()).unwrap();
    assert_eq!(json["timers"]["job"]["count"], 1);
    assert_eq!(json["errors"]["All"], 1);
}

struct LoadProfile;

#[async_trait]
impl AsyncMonitoredExecution for LoadProfile {
    type Output = ();
    type Error = String;

    fn name(&self) -> &str {
        "GET /profile"
    }

    async fn execute(&mut self) -> Result<(), String> {
        let _query = task_context::enter("SELECT * FROM users");
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_monitor_async_through_agent() {
    let (agent, collector, _) =
        agent_with_collector(ProfilerConfig::builder().min_execution_time_nanos(0).build());
    let mut stack = agent.call_stack();

    agent.monitor_async(&mut stack, LoadProfile).await.unwrap();

    let trees = collector.trees.lock().unwrap().clone();
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].signature, "GET /profile");
    assert_eq!(trees[0].children[0].signature, "SELECT * FROM users");
    assert!(!stack.is_active());
}

#[test]
fn test_monitor_async_on_blocking_executor() {
    let (agent, collector, _) =
        agent_with_collector(ProfilerConfig::builder().min_execution_time_nanos(0).build());
    let mut stack = agent.call_stack();

    tokio_test::block_on(agent.monitor_async(&mut stack, LoadProfile)).unwrap();

    let trees = collector.trees.lock().unwrap().clone();
    assert_eq!(trees[0].children[0].signature, "SELECT * FROM users");
}

struct RenderPage {
    agent: Arc<ApmAgent>,
}

#[async_trait]
impl AsyncMonitoredExecution for RenderPage {
    type Output = ();
    type Error = String;

    fn name(&self) -> &str {
        "GET /page"
    }

    async fn execute(&mut self) -> Result<(), String> {
        self.agent.monitor_in_task(LoadProfile).await
    }
}

#[tokio::test]
async fn test_monitor_in_task_nests_async_executions() {
    let (agent, collector, _) =
        agent_with_collector(ProfilerConfig::builder().min_execution_time_nanos(0).build());
    let agent = Arc::new(agent);
    let mut stack = agent.call_stack();

    agent
        .monitor_async(&mut stack, RenderPage { agent: Arc::clone(&agent) })
        .await
        .unwrap();

    let trees = collector.trees.lock().unwrap().clone();
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].signature, "GET /page");
    assert_eq!(trees[0].children[0].signature, "GET /profile");
    assert_eq!(trees[0].children[0].children[0].signature, "SELECT * FROM users");
}
