// Error types for the profiler core
// Separates discipline violations, configuration problems and sink failures

use thiserror::Error;

/// Errors raised by the call-tree engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfilerError {
    /// `activate` was called while a tree was already being recorded
    #[error("Call stack is already active (current node: {0})")]
    AlreadyActive(String),

    /// An operation that requires an open tree was called on an idle stack
    #[error("Call stack is not active")]
    NotActive,

    /// A node handle outlived the node it pointed to
    #[error("Stale node handle: index {index}, generation {generation}")]
    StaleNode {
        /// Arena slot of the handle
        index: u32,
        /// Generation the handle was issued for
        generation: u32,
    },
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A knob has a value outside its allowed range
    #[error("Invalid configuration: {0}")]
    InvalidValue(String),

    /// JSON parse error
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures inside a metrics sink
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The sink rejected an update
    #[error("Metrics sink rejected update for {name}: {reason}")]
    Rejected {
        /// Metric name
        name: String,
        /// Reason given by the sink
        reason: String,
    },

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures while handing a finished execution to a reporter
#[derive(Error, Debug)]
pub enum ReportError {
    /// The reporter could not accept the report
    #[error("Reporter {reporter} failed: {reason}")]
    Failed {
        /// Reporter name
        reporter: String,
        /// Reason given by the reporter
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for call-tree operations
pub type Result<T> = std::result::Result<T, ProfilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProfilerError::NotActive;
        assert_eq!(err.to_string(), "Call stack is not active");

        let err = ProfilerError::AlreadyActive("GET /".to_string());
        assert_eq!(err.to_string(), "Call stack is already active (current node: GET /)");

        let err = ProfilerError::StaleNode {
            index: 3,
            generation: 7,
        };
        assert_eq!(err.to_string(), "Stale node handle: index 3, generation 7");
    }

    #[test]
    fn test_config_error_from_json() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: ConfigError = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("Failed to parse configuration"));
    }

    #[test]
    fn test_report_error_display() {
        let err = ReportError::Failed {
            reporter: "log".to_string(),
            reason: "closed".to_string(),
        };
        assert_eq!(err.to_string(), "Reporter log failed: closed");
    }
}
