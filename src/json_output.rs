//! JSON Output for CLI Commands
//!
//! Every result the CLI prints is one JSON object per line with a `type`
//! field, so output can be piped into other tools.

use serde::{Deserialize, Serialize};

use crate::error::KHIError;
use crate::upload::{SyntaxErrorRecord, UploadOutcome};

/// Current time as f64 seconds since UNIX epoch, rounded to microseconds
pub fn current_timestamp() -> f64 {
    let micros = chrono::Utc::now().timestamp_micros();
    micros as f64 / 1_000_000.0
}

/// Command execution status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Completed,
    Failed,
}

/// Command status event output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusEvent {
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    /// CLI command name, e.g. `pc-exec`
    pub command: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error event; `kind` is the error variant in snake_case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub error: String,
}

/// Query result wrapping any serializable payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEvent<T> {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: T,
}

/// Program upload result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub program: String,
    pub complete: bool,
    pub syntax_errors: Vec<SyntaxErrorRecord>,
}

impl CommandStatusEvent {
    pub fn new(command: &str, status: CommandStatus, message: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "command_status".to_string(),
            command: command.to_string(),
            status,
            message,
        }
    }

    pub fn completed(command: &str) -> Self {
        Self::new(command, CommandStatus::Completed, None)
    }

    pub fn failed(command: &str, error_msg: &str) -> Self {
        Self::new(command, CommandStatus::Failed, Some(error_msg.to_string()))
    }
}

impl ErrorEvent {
    pub fn new(error: &str, command: Option<&str>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            command: command.map(str::to_string),
            kind: None,
            error: error.to_string(),
        }
    }

    /// Error raised by the driver, tagged with its variant
    pub fn from_driver(command: &str, err: &KHIError) -> Self {
        Self {
            kind: Some(err.kind().to_string()),
            ..Self::new(&err.to_string(), Some(command))
        }
    }
}

impl<T: Serialize> DataEvent<T> {
    pub fn new(event_type: &str, data: T) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: event_type.to_string(),
            data,
        }
    }
}

impl UploadEvent {
    pub fn new(program: &str, outcome: &UploadOutcome) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "upload".to_string(),
            program: program.to_string(),
            complete: outcome.errors().is_empty(),
            syntax_errors: outcome.errors().to_vec(),
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;

    pub fn command_completed(command: &str) {
        output_event(&CommandStatusEvent::completed(command));
    }

    pub fn command_failed(command: &str, err: &KHIError) {
        output_event(&CommandStatusEvent::failed(command, &err.to_string()));
        output_event(&ErrorEvent::from_driver(command, err));
    }

    pub fn data<T: Serialize>(event_type: &str, data: T) {
        output_event(&DataEvent::new(event_type, data));
    }

    pub fn upload(program: &str, outcome: &UploadOutcome) {
        output_event(&UploadEvent::new(program, outcome));
    }

    pub fn error(error: &str) {
        output_event(&ErrorEvent::new(error, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_driver_error_event_carries_kind() {
        let event = ErrorEvent::from_driver("pc-exec", &KHIError::ThreadBusy(2));
        let json: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "thread_busy");
        assert_eq!(json["command"], "pc-exec");
        assert_eq!(json["error"], "Another program is running in thread 2");
    }

    #[test]
    fn test_completed_event_omits_message() {
        let json = serde_json::to_string(&CommandStatusEvent::completed("ereset")).unwrap();
        assert!(json.contains(r#""type":"command_status""#));
        assert!(json.contains(r#""status":"completed""#));
        assert!(!json.contains("message"));
    }

    #[test]
    fn test_upload_event_lists_syntax_errors() {
        let outcome = UploadOutcome::LoadedWithErrors(vec![SyntaxErrorRecord {
            line_number: 2,
            offending_text: "LMOVE".into(),
            error_code: "P1013".into(),
            description: "Missing argument.".into(),
        }]);
        let json: Value = serde_json::to_value(UploadEvent::new("weld", &outcome)).unwrap();
        assert_eq!(json["complete"], false);
        assert_eq!(json["syntax_errors"][0]["line_number"], 2);
        assert_eq!(
            serde_json::to_value(UploadEvent::new("weld", &UploadOutcome::Loaded)).unwrap()["complete"],
            true
        );
    }

    #[test]
    fn test_timestamp_is_recent() {
        assert!(current_timestamp() > 1_600_000_000.0);
    }
}
