//! Error types shared by the engine and its collaborators
//!
//! Collaborators report typed errors; actions turn them into named signals
//! whose message carries the source location of the failing element.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ResultCode, SignalKind};

/// File name used for definitions that were not loaded from a file
pub const INLINE_DATA: &str = "<inline data>";

/// Where an action definition came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub element: String,
    pub file: String,
    pub machine: String,
    pub line: u32,
}

impl Location {
    pub fn new(
        element: impl Into<String>,
        file: impl Into<String>,
        machine: impl Into<String>,
        line: u32,
    ) -> Self {
        Self {
            element: element.into(),
            file: file.into(),
            machine: machine.into(),
            line,
        }
    }

    /// Location for a definition built in memory
    pub fn inline(element: impl Into<String>) -> Self {
        Self::new(element, INLINE_DATA, "local", 0)
    }

    pub fn is_inline(&self) -> bool {
        self.file == INLINE_DATA
    }
}

/// Format a diagnostic message for an element, optionally naming the attribute
pub fn format_error(location: &Location, attribute: Option<&str>, message: &str) -> String {
    let mut text = format!(
        "File: {}, Machine: {}\nLine {}: Error in element type \"{}\"",
        location.file, location.machine, location.line, location.element
    );

    if let Some(attribute) = attribute {
        text.push_str(&format!(" attribute \"{}\"", attribute));
    }

    text.push_str(":\n\n");
    text.push_str(message);
    text
}

/// Failure reported by the expression evaluator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("Name '{0}' is not defined")]
    UndefinedVariable(String),

    #[error("Invalid expression '{expr}': {reason}")]
    Invalid { expr: String, reason: String },

    #[error("Expected {expected}, got: {actual}")]
    TypeMismatch { expected: &'static str, actual: String },
}

/// Failure while fetching or parsing an external definition file
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("Error getting file {file} from machine {machine}.  RC: {rc}, Result: {message}")]
    Copy {
        machine: String,
        file: String,
        rc: ResultCode,
        message: String,
    },

    #[error("No response from machine {machine} when getting file {file}")]
    NoResponse { machine: String, file: String },

    #[error("Error parsing file {file} on machine {machine}:\n{message}")]
    Parse {
        machine: String,
        file: String,
        message: String,
    },
}

impl FetchError {
    /// Signal raised when this failure aborts an action
    pub fn signal(&self) -> SignalKind {
        match self {
            FetchError::Copy { .. } => SignalKind::FileCopyError,
            FetchError::NoResponse { .. } => SignalKind::NoResponseFromMachine,
            FetchError::Parse { .. } => SignalKind::ParseError,
        }
    }
}

/// Internal engine failure; never fatal to the process
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} does not exist")]
    DoesNotExist(String),

    #[error("Job {0} is not currently running")]
    JobNotRunning(u64),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Eval(#[from] EvalError),
}
