use std::fmt;

use serde::Serialize;
use ts_rs::TS;

/// Structured error type for the orchestration engine. Callers match on the
/// code to decide between "show a validation hint", "report a failed
/// execution", and "stay quiet because the work was superseded".
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(tag = "code", content = "detail")]
#[ts(export)]
pub enum FlowError {
    NotFound { what: String },
    ValidationError { message: String },
    InvalidValue { parameter: String, message: String },
    ExecutionFailed { namespace: String, message: String },
    Rejected { namespace: String },
    AlreadyExecuting { namespace: String },
    HistoryIndexOutOfRange { index: usize, len: usize },
    HistoryEntryNotFound { time: i64 },
    Interrupted { reason: String },
    DependencyCycle { namespaces: Vec<String> },
    IoError { message: String },
    ConfigError { message: String },
}

impl FlowError {
    pub fn not_found(what: impl Into<String>) -> Self {
        FlowError::NotFound { what: what.into() }
    }

    pub fn execution(namespace: &str, message: impl Into<String>) -> Self {
        FlowError::ExecutionFailed {
            namespace: namespace.to_string(),
            message: message.into(),
        }
    }

    /// True when a newer request superseded this one. Callers should not
    /// surface these to the user.
    pub fn is_interruption(&self) -> bool {
        matches!(self, FlowError::Interrupted { .. })
    }

    /// True for errors produced before anything was queued or executed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FlowError::ValidationError { .. } | FlowError::InvalidValue { .. }
        )
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::NotFound { what } => write!(f, "{what} not found"),
            FlowError::ValidationError { message } => write!(f, "{message}"),
            FlowError::InvalidValue { parameter, message } => {
                write!(f, "Invalid value for parameter {parameter}: {message}")
            }
            FlowError::ExecutionFailed { namespace, message } => {
                write!(f, "Execution failed for {namespace}: {message}")
            }
            FlowError::Rejected { namespace } => write!(f, "Changes rejected for {namespace}"),
            FlowError::AlreadyExecuting { namespace } => {
                write!(f, "Changes for {namespace} are already executing")
            }
            FlowError::HistoryIndexOutOfRange { index, len } => {
                write!(f, "History index {index} out of range (length {len})")
            }
            FlowError::HistoryEntryNotFound { time } => {
                write!(f, "No history entry with timestamp {time}")
            }
            FlowError::Interrupted { reason } => write!(f, "Interrupted: {reason}"),
            FlowError::DependencyCycle { namespaces } => {
                write!(f, "Dependency cycle between namespaces: {}", namespaces.join(", "))
            }
            FlowError::IoError { message } => write!(f, "I/O error: {message}"),
            FlowError::ConfigError { message } => write!(f, "Configuration error: {message}"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<std::io::Error> for FlowError {
    fn from(e: std::io::Error) -> Self {
        FlowError::IoError {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::ConfigError {
            message: e.to_string(),
        }
    }
}

/// Allow converting FlowError to String for callers that only display it.
impl From<FlowError> for String {
    fn from(e: FlowError) -> String {
        e.to_string()
    }
}

impl From<String> for FlowError {
    fn from(s: String) -> Self {
        FlowError::ValidationError { message: s }
    }
}

impl From<&str> for FlowError {
    fn from(s: &str) -> Self {
        FlowError::ValidationError {
            message: s.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_code_tag() {
        let err = FlowError::Rejected {
            namespace: "m1".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "Rejected");
        assert_eq!(json["detail"]["namespace"], "m1");
    }

    #[test]
    fn test_interruption_is_distinguished() {
        let superseded = FlowError::Interrupted {
            reason: "newer request".into(),
        };
        assert!(superseded.is_interruption());
        assert!(!FlowError::execution("m1", "boom").is_interruption());
        assert_eq!(
            FlowError::execution("m1", "boom").to_string(),
            "Execution failed for m1: boom"
        );
    }
}
