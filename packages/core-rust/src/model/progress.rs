//! Progress reports yielded by long-running commands.

use serde::{Deserialize, Serialize};

/// Progress of an asynchronous command, carried by `ASYNC-ST` notifications.
///
/// Both fields are optional: a handler may report only a percentage, only a
/// human-readable message, or both.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl Progress {
    /// Creates a progress report with a percentage only.
    #[must_use]
    pub fn percentage(percentage: u8) -> Self {
        Self {
            percentage: Some(percentage),
            message: None,
        }
    }

    /// Creates a progress report with a message only.
    #[must_use]
    pub fn message(message: &str) -> Self {
        Self {
            percentage: None,
            message: Some(message.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_single_field() {
        assert_eq!(Progress::percentage(40).percentage, Some(40));
        assert!(Progress::percentage(40).message.is_none());
        assert_eq!(
            Progress::message("calibrating").message.as_deref(),
            Some("calibrating")
        );
    }

    #[test]
    fn empty_progress_serializes_to_empty_object() {
        let value = serde_json::to_value(Progress::default()).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn roundtrip() {
        let progress = Progress {
            percentage: Some(75),
            message: Some("uploading".to_owned()),
        };
        let value = serde_json::to_value(&progress).unwrap();
        let decoded: Progress = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, progress);
    }
}
