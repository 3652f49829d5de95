//! Configuration for the profiler core
//!
//! All knobs are read-only for the core. They are supplied externally,
//! either programmatically through [`ProfilerConfig::builder`] or as JSON,
//! and can be swapped at runtime through a [`SharedConfig`] handle.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ConfigError;
use crate::OperationType;

/// Rate limits at or above this many credits per minute are treated as unlimited
pub const UNLIMITED_RATE_PER_MINUTE: f64 = 1_000_000.0;

/// Configuration for call-tree recording, sampling and reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Master switch; when off executions run unmonitored
    monitoring_active: bool,

    /// Nested calls faster than this are dropped while recording
    min_execution_time_nanos: u64,

    /// Calls faster than this share of the root's total time are trimmed
    /// before the tree is reported (0 disables)
    min_execution_time_percent: f64,

    /// Number of executions that are never monitored after startup
    warmup_requests: u64,

    /// Seconds after startup during which executions are never monitored
    warmup_seconds: u64,

    /// Profile every Xth execution of the same name instead of using the
    /// profiler rate limit
    call_stack_every_x_requests_to_group: Option<i64>,

    /// Maximum number of profiled executions per minute
    profiler_rate_limit_per_minute: f64,

    /// Maximum number of reported call trees per minute, per operation type
    reporting_rate_limit_per_minute_per_operation_type: HashMap<OperationType, f64>,

    /// Whether call nodes are recycled through the node pool
    pooling_enabled: bool,

    /// Whether finished call trees are written to the log
    log_call_stacks: bool,

    /// Render call trees with plain ASCII instead of block characters
    ascii_call_tree: bool,
}

impl ProfilerConfig {
    /// Create a new builder for ProfilerConfig
    ///
    /// # Example
    ///
    /// ```
    /// use apm_types::ProfilerConfig;
    ///
    /// let config = ProfilerConfig::builder()
    ///     .min_execution_time_nanos(50_000)
    ///     .warmup_requests(10)
    ///     .build();
    /// assert_eq!(config.warmup_requests(), 10);
    /// ```
    pub fn builder() -> ProfilerConfigBuilder {
        ProfilerConfigBuilder::default()
    }

    /// Parse a JSON document; missing keys take their default values
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ProfilerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every knob for values the core cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.min_execution_time_percent) {
            return Err(ConfigError::InvalidValue(format!(
                "min_execution_time_percent must be within 0..=100, got {}",
                self.min_execution_time_percent
            )));
        }
        check_rate("profiler_rate_limit_per_minute", self.profiler_rate_limit_per_minute)?;
        for (operation_type, rate) in &self.reporting_rate_limit_per_minute_per_operation_type {
            check_rate(
                &format!("reporting_rate_limit_per_minute_per_operation_type.{}", operation_type),
                *rate,
            )?;
        }
        Ok(())
    }

    /// Get whether monitoring is switched on
    pub fn monitoring_active(&self) -> bool {
        self.monitoring_active
    }

    /// Get the live pruning threshold in nanoseconds
    pub fn min_execution_time_nanos(&self) -> u64 {
        self.min_execution_time_nanos
    }

    /// Get the post-hoc trimming threshold in percent of the root's time
    pub fn min_execution_time_percent(&self) -> f64 {
        self.min_execution_time_percent
    }

    /// Get the number of warmup executions
    pub fn warmup_requests(&self) -> u64 {
        self.warmup_requests
    }

    /// Get the warmup period in seconds
    pub fn warmup_seconds(&self) -> u64 {
        self.warmup_seconds
    }

    /// Get the grouping interval, if grouping replaces the rate limit
    pub fn call_stack_every_x_requests_to_group(&self) -> Option<i64> {
        self.call_stack_every_x_requests_to_group
    }

    /// Get the profiler rate limit per minute
    pub fn profiler_rate_limit_per_minute(&self) -> f64 {
        self.profiler_rate_limit_per_minute
    }

    /// Get the reporting rate limit for one operation type
    ///
    /// Types without an explicit limit are unlimited.
    pub fn reporting_rate_limit_per_minute(&self, operation_type: OperationType) -> f64 {
        self.reporting_rate_limit_per_minute_per_operation_type
            .get(&operation_type)
            .copied()
            .unwrap_or(UNLIMITED_RATE_PER_MINUTE)
    }

    /// Get all explicitly configured reporting rate limits
    pub fn reporting_rate_limits(&self) -> &HashMap<OperationType, f64> {
        &self.reporting_rate_limit_per_minute_per_operation_type
    }

    /// Get whether node pooling is enabled
    pub fn pooling_enabled(&self) -> bool {
        self.pooling_enabled
    }

    /// Get whether call trees are logged
    pub fn log_call_stacks(&self) -> bool {
        self.log_call_stacks
    }

    /// Get whether call trees are rendered in plain ASCII
    pub fn ascii_call_tree(&self) -> bool {
        self.ascii_call_tree
    }
}

fn check_rate(name: &str, rate: f64) -> Result<(), ConfigError> {
    if rate.is_nan() || rate < 0.0 {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be a non-negative number, got {}",
            name, rate
        )));
    }
    Ok(())
}

impl Default for ProfilerConfig {
    /// Create a default configuration
    ///
    /// Default values:
    /// - monitoring_active: true
    /// - min_execution_time_nanos: 100 µs
    /// - min_execution_time_percent: 0 (disabled)
    /// - warmup_requests / warmup_seconds: 0
    /// - call_stack_every_x_requests_to_group: None
    /// - profiler_rate_limit_per_minute: unlimited
    /// - reporting limits: none (unlimited)
    /// - pooling_enabled, log_call_stacks, ascii_call_tree: true
    fn default() -> Self {
        Self {
            monitoring_active: true,
            min_execution_time_nanos: 100_000,
            min_execution_time_percent: 0.0,
            warmup_requests: 0,
            warmup_seconds: 0,
            call_stack_every_x_requests_to_group: None,
            profiler_rate_limit_per_minute: UNLIMITED_RATE_PER_MINUTE,
            reporting_rate_limit_per_minute_per_operation_type: HashMap::new(),
            pooling_enabled: true,
            log_call_stacks: true,
            ascii_call_tree: true,
        }
    }
}

/// Builder for ProfilerConfig
///
/// Provides a fluent interface for constructing ProfilerConfig instances.
#[derive(Debug, Clone, Default)]
pub struct ProfilerConfigBuilder {
    monitoring_active: Option<bool>,
    min_execution_time_nanos: Option<u64>,
    min_execution_time_percent: Option<f64>,
    warmup_requests: Option<u64>,
    warmup_seconds: Option<u64>,
    call_stack_every_x_requests_to_group: Option<i64>,
    profiler_rate_limit_per_minute: Option<f64>,
    reporting_rate_limits: HashMap<OperationType, f64>,
    pooling_enabled: Option<bool>,
    log_call_stacks: Option<bool>,
    ascii_call_tree: Option<bool>,
}

impl ProfilerConfigBuilder {
    /// Switch monitoring on or off
    pub fn monitoring_active(mut self, active: bool) -> Self {
        self.monitoring_active = Some(active);
        self
    }

    /// Set the live pruning threshold
    ///
    /// # Arguments
    ///
    /// * `nanos` - Nested calls faster than this are not recorded
    pub fn min_execution_time_nanos(mut self, nanos: u64) -> Self {
        self.min_execution_time_nanos = Some(nanos);
        self
    }

    /// Set the post-hoc trimming threshold in percent of the root's time
    pub fn min_execution_time_percent(mut self, percent: f64) -> Self {
        self.min_execution_time_percent = Some(percent);
        self
    }

    /// Set the number of warmup executions
    pub fn warmup_requests(mut self, requests: u64) -> Self {
        self.warmup_requests = Some(requests);
        self
    }

    /// Set the warmup period
    pub fn warmup_seconds(mut self, seconds: u64) -> Self {
        self.warmup_seconds = Some(seconds);
        self
    }

    /// Profile every Xth execution of the same name
    ///
    /// # Arguments
    ///
    /// * `every` - 1 profiles everything, values below 1 profile nothing
    pub fn call_stack_every_x_requests_to_group(mut self, every: i64) -> Self {
        self.call_stack_every_x_requests_to_group = Some(every);
        self
    }

    /// Set the profiler rate limit per minute
    pub fn profiler_rate_limit_per_minute(mut self, rate: f64) -> Self {
        self.profiler_rate_limit_per_minute = Some(rate);
        self
    }

    /// Set the reporting rate limit for one operation type
    pub fn reporting_rate_limit_per_minute(mut self, operation_type: OperationType, rate: f64) -> Self {
        self.reporting_rate_limits.insert(operation_type, rate);
        self
    }

    /// Enable or disable node pooling
    pub fn pooling_enabled(mut self, enabled: bool) -> Self {
        self.pooling_enabled = Some(enabled);
        self
    }

    /// Enable or disable logging of call trees
    pub fn log_call_stacks(mut self, enabled: bool) -> Self {
        self.log_call_stacks = Some(enabled);
        self
    }

    /// Render call trees in ASCII or with block characters
    pub fn ascii_call_tree(mut self, ascii: bool) -> Self {
        self.ascii_call_tree = Some(ascii);
        self
    }

    /// Build the ProfilerConfig
    ///
    /// Uses default values for any options not explicitly set.
    pub fn build(self) -> ProfilerConfig {
        let default = ProfilerConfig::default();

        ProfilerConfig {
            monitoring_active: self.monitoring_active.unwrap_or(default.monitoring_active),
            min_execution_time_nanos: self
                .min_execution_time_nanos
                .unwrap_or(default.min_execution_time_nanos),
            min_execution_time_percent: self
                .min_execution_time_percent
                .unwrap_or(default.min_execution_time_percent),
            warmup_requests: self.warmup_requests.unwrap_or(default.warmup_requests),
            warmup_seconds: self.warmup_seconds.unwrap_or(default.warmup_seconds),
            call_stack_every_x_requests_to_group: self
                .call_stack_every_x_requests_to_group
                .or(default.call_stack_every_x_requests_to_group),
            profiler_rate_limit_per_minute: self
                .profiler_rate_limit_per_minute
                .unwrap_or(default.profiler_rate_limit_per_minute),
            reporting_rate_limit_per_minute_per_operation_type: self.reporting_rate_limits,
            pooling_enabled: self.pooling_enabled.unwrap_or(default.pooling_enabled),
            log_call_stacks: self.log_call_stacks.unwrap_or(default.log_call_stacks),
            ascii_call_tree: self.ascii_call_tree.unwrap_or(default.ascii_call_tree),
        }
    }
}

/// Hot-reloadable handle to the current configuration
///
/// Readers take cheap snapshots; writers replace the whole value.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<ProfilerConfig>>,
}

impl SharedConfig {
    /// Wrap a configuration
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> ProfilerConfig {
        self.inner.read().clone()
    }

    /// Read one value without cloning the whole configuration
    pub fn read<R>(&self, f: impl FnOnce(&ProfilerConfig) -> R) -> R {
        f(&self.inner.read())
    }

    /// Replace the configuration after validating it
    pub fn update(&self, config: ProfilerConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.inner.write() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProfilerConfig::default();

        assert!(config.monitoring_active());
        assert_eq!(config.min_execution_time_nanos(), 100_000);
        assert_eq!(config.min_execution_time_percent(), 0.0);
        assert_eq!(config.warmup_requests(), 0);
        assert_eq!(config.warmup_seconds(), 0);
        assert_eq!(config.call_stack_every_x_requests_to_group(), None);
        assert_eq!(config.profiler_rate_limit_per_minute(), UNLIMITED_RATE_PER_MINUTE);
        assert!(config.pooling_enabled());
        assert!(config.log_call_stacks());
        assert!(config.ascii_call_tree());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_all_options() {
        let config = ProfilerConfig::builder()
            .monitoring_active(false)
            .min_execution_time_nanos(1_000)
            .min_execution_time_percent(2.5)
            .warmup_requests(5)
            .warmup_seconds(30)
            .call_stack_every_x_requests_to_group(3)
            .profiler_rate_limit_per_minute(120.0)
            .reporting_rate_limit_per_minute(OperationType::External, 10.0)
            .pooling_enabled(false)
            .log_call_stacks(false)
            .ascii_call_tree(false)
            .build();

        assert!(!config.monitoring_active());
        assert_eq!(config.min_execution_time_nanos(), 1_000);
        assert_eq!(config.min_execution_time_percent(), 2.5);
        assert_eq!(config.warmup_requests(), 5);
        assert_eq!(config.warmup_seconds(), 30);
        assert_eq!(config.call_stack_every_x_requests_to_group(), Some(3));
        assert_eq!(config.profiler_rate_limit_per_minute(), 120.0);
        assert_eq!(config.reporting_rate_limit_per_minute(OperationType::External), 10.0);
        assert!(!config.pooling_enabled());
        assert!(!config.log_call_stacks());
        assert!(!config.ascii_call_tree());
    }

    #[test]
    fn test_builder_no_options() {
        let config = ProfilerConfig::builder().build();
        assert_eq!(config, ProfilerConfig::default());
    }

    #[test]
    fn test_missing_reporting_limit_is_unlimited() {
        let config = ProfilerConfig::builder()
            .reporting_rate_limit_per_minute(OperationType::External, 1.0)
            .build();

        assert_eq!(
            config.reporting_rate_limit_per_minute(OperationType::Server),
            UNLIMITED_RATE_PER_MINUTE
        );
    }

    #[test]
    fn test_from_json_partial() {
        let config = ProfilerConfig::from_json(
            r#"{
                "warmup_requests": 3,
                "reporting_rate_limit_per_minute_per_operation_type": { "external": 6.0 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.warmup_requests(), 3);
        assert_eq!(config.reporting_rate_limit_per_minute(OperationType::External), 6.0);
        assert_eq!(config.min_execution_time_nanos(), 100_000);
    }

    #[test]
    fn test_from_json_rejects_invalid_values() {
        let result = ProfilerConfig::from_json(r#"{ "profiler_rate_limit_per_minute": -1.0 }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));

        let result = ProfilerConfig::from_json(r#"{ "min_execution_time_percent": 150.0 }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));

        let result = ProfilerConfig::from_json("[1, 2");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_shared_config_update() {
        let shared = SharedConfig::new(ProfilerConfig::default());
        let updated = ProfilerConfig::builder().warmup_requests(9).build();

        shared.update(updated).unwrap();
        assert_eq!(shared.snapshot().warmup_requests(), 9);
        assert_eq!(shared.read(|c| c.warmup_requests()), 9);

        let invalid = ProfilerConfig::builder().min_execution_time_percent(-1.0).build();
        assert!(shared.update(invalid).is_err());
        assert_eq!(shared.snapshot().warmup_requests(), 9);
    }
}
