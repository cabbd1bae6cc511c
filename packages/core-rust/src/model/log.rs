//! Log message model carried by `SYS-MSG` notifications.

use serde::{Deserialize, Serialize};

/// Severity levels for a single server log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// A single log entry forwarded to clients in a `SYS-MSG` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub message: String,
    pub severity: Severity,
    /// Id of the object the message originates from (e.g. a UAV) when the
    /// server is relaying; absent for messages of the server itself.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<u64>,
}

impl LogMessage {
    /// Creates an informational message with no sender or timestamp.
    #[must_use]
    pub fn info(message: &str) -> Self {
        Self {
            message: message.to_owned(),
            severity: Severity::Info,
            sender: None,
            timestamp: None,
        }
    }

    /// Creates a message with the given severity.
    #[must_use]
    pub fn with_severity(message: &str, severity: Severity) -> Self {
        Self {
            severity,
            ..Self::info(message)
        }
    }
}
