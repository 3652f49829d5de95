// Shared types, configuration and error definitions
//
// This module is part of the APM profiler core.

pub mod clock;
pub mod config;
pub mod errors;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ProfilerConfig, ProfilerConfigBuilder, SharedConfig, UNLIMITED_RATE_PER_MINUTE};
pub use errors::{ConfigError, MetricsError, ProfilerError, ReportError, Result};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin class of a monitored execution
///
/// Reporting rate limits are configured per operation type, so a burst of
/// outgoing calls cannot starve the reports of incoming requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Work that originates in this process (an incoming HTTP request, a job)
    #[default]
    Server,
    /// Work performed on behalf of an external caller or against a remote system
    External,
}

impl OperationType {
    /// Stable lowercase name, used as a metric tag
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Server => "server",
            OperationType::External => "external",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_default() {
        assert_eq!(OperationType::default(), OperationType::Server);
    }

    #[test]
    fn test_operation_type_serialization() {
        let json = serde_json::to_string(&OperationType::External).unwrap();
        assert_eq!(json, "\"external\"");

        let parsed: OperationType = serde_json::from_str("\"server\"").unwrap();
        assert_eq!(parsed, OperationType::Server);
    }

    #[test]
    fn test_operation_type_display() {
        assert_eq!(OperationType::Server.to_string(), "server");
        assert_eq!(OperationType::External.to_string(), "external");
    }
}
