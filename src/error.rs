//! Error types for AS terminal operations

use std::time::Duration;
use thiserror::Error;

use crate::protocol::Slot;
use crate::upload::SyntaxErrorRecord;

pub type Result<T> = std::result::Result<T, KHIError>;

#[derive(Error, Debug)]
pub enum KHIError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out after {waited:?} waiting for {expected}")]
    Timeout { waited: Duration, expected: String },

    #[error("Session is desynchronized from the controller and must be reconnected")]
    SessionDesynced,

    #[error("Session is busy with another command")]
    SessionBusy,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("AS protocol error: {0}")]
    Protocol(String),

    #[error("Program transmission error: {0}")]
    ProgTransmission(String),

    #[error("{}", syntax_summary(.program, .errors, .aborted))]
    ProgSyntax {
        program: String,
        errors: Vec<SyntaxErrorRecord>,
        aborted: bool,
    },

    #[error("Program {0} does not exist")]
    ProgNotExist(String),

    #[error("Program {0} is already running in another thread")]
    ProgRunning(String),

    #[error("Program {0} is halted via abort, but still loaded")]
    ProgLoaded(String),

    #[error("Another program is running in thread {0}")]
    ThreadBusy(u8),

    #[error("Program is running in {0}")]
    ProgActive(Slot),

    #[error("Cannot execute motion instructions in TEACH mode")]
    TeachMode,

    #[error("Cannot execute motion instructions when teach pendant lock is ON")]
    TeachLock,

    #[error("Cannot execute motion instructions with motors powered off")]
    MotorsOff,

    #[error("Program {0} uses a variable that is not defined")]
    VarNotDefined(String),

    #[error("Program {program} held: {status}")]
    ProgHeld { program: String, status: String },

    #[error("Program {program} stopped on controller fault: {status}")]
    ProgFaulted { program: String, status: String },

    #[error("Thread number {0} is out of range 1..=5")]
    InvalidThread(u8),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Pattern error: {0}")]
    Regex(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl KHIError {
    /// True for failures of the connection itself rather than a controller rejection.
    ///
    /// Transport failures leave the session unusable; the caller decides whether to
    /// reconnect and retry. Domain errors repeat unless the caller changes robot state first.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            KHIError::Connection(_)
                | KHIError::Timeout { .. }
                | KHIError::SessionDesynced
                | KHIError::Io(_)
        )
    }

    /// Stable snake_case name of the variant for machine-readable output
    pub fn kind(&self) -> &'static str {
        match self {
            KHIError::Connection(_) => "connection",
            KHIError::Timeout { .. } => "timeout",
            KHIError::SessionDesynced => "session_desynced",
            KHIError::SessionBusy => "session_busy",
            KHIError::Config(_) => "config",
            KHIError::Protocol(_) => "protocol",
            KHIError::ProgTransmission(_) => "prog_transmission",
            KHIError::ProgSyntax { .. } => "prog_syntax",
            KHIError::ProgNotExist(_) => "prog_not_exist",
            KHIError::ProgRunning(_) => "prog_running",
            KHIError::ProgLoaded(_) => "prog_loaded",
            KHIError::ThreadBusy(_) => "thread_busy",
            KHIError::ProgActive(_) => "prog_active",
            KHIError::TeachMode => "teach_mode",
            KHIError::TeachLock => "teach_lock",
            KHIError::MotorsOff => "motors_off",
            KHIError::VarNotDefined(_) => "var_not_defined",
            KHIError::ProgHeld { .. } => "prog_held",
            KHIError::ProgFaulted { .. } => "prog_faulted",
            KHIError::InvalidThread(_) => "invalid_thread",
            KHIError::Task(_) => "task",
            KHIError::Regex(_) => "regex",
            KHIError::Io(_) => "io",
            KHIError::Yaml(_) => "yaml",
        }
    }
}

fn syntax_summary(program: &str, errors: &[SyntaxErrorRecord], aborted: &bool) -> String {
    let head = if *aborted {
        format!("Transmission of {} aborted on syntax error", program)
    } else {
        format!(
            "File transmission of {} not complete - {} errors found",
            program,
            errors.len()
        )
    };
    errors
        .iter()
        .fold(head, |acc, err| format!("{}\n{}", acc, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(KHIError::Connection("refused".into()).is_transport());
        assert!(KHIError::SessionDesynced.is_transport());
        assert!(KHIError::Timeout {
            waited: Duration::from_secs(1),
            expected: "prompt".into()
        }
        .is_transport());
        assert!(!KHIError::TeachMode.is_transport());
        assert!(!KHIError::ThreadBusy(2).is_transport());
        assert!(!KHIError::ProgNotExist("kep".into()).is_transport());
    }

    #[test]
    fn test_syntax_error_message_lists_every_line() {
        let err = KHIError::ProgSyntax {
            program: "weld".into(),
            errors: vec![
                SyntaxErrorRecord {
                    line_number: 3,
                    offending_text: "LMOVE".into(),
                    error_code: "P1013".into(),
                    description: "Missing argument.".into(),
                },
                SyntaxErrorRecord {
                    line_number: 7,
                    offending_text: "FOO 1".into(),
                    error_code: "P1000".into(),
                    description: "Unknown instruction.".into(),
                },
            ],
            aborted: false,
        };
        let text = err.to_string();
        assert!(text.starts_with("File transmission of weld not complete - 2 errors found"));
        assert!(text.contains("at line 3 (LMOVE)"));
        assert!(text.contains("(P1000) at line 7"));
    }
}
