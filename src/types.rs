use serde::{Deserialize, Serialize};
use std::fmt;

/// Values held in thread variables and passed through the evaluator
pub type Value = serde_json::Value;

/// Result code reported by the command-execution substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(0);
    pub const INVALID_REQUEST_STRING: ResultCode = ResultCode(7);
    pub const TIMEOUT: ResultCode = ResultCode(37);
    pub const DOES_NOT_EXIST: ResultCode = ResultCode(48);
    pub const NO_RESPONSE: ResultCode = ResultCode(16);
    /// Used by the engine itself when an expression could not be evaluated
    pub const EVALUATION_FAILED: ResultCode = ResultCode(-1);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a thread finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadEndCode {
    Normal,
    DuplicateSignal,
    StoppedByParent,
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Terminating,
    Complete,
}

/// How a job ended, as seen by whoever waited for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Normal,
    Abnormal,
    Terminated,
    Unknown,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Normal => "Normal",
            JobStatus::Abnormal => "Abnormal",
            JobStatus::Terminated => "Terminated",
            JobStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Named signals raised on a thread when an action fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    EvaluationError,
    ProcessStartError,
    ProcessStartTimeout,
    FunctionDoesNotExist,
    FunctionArgValidate,
    ImportError,
    FileCopyError,
    NoResponseFromMachine,
    ParseError,
    InvalidTimerValue,
    InvalidValue,
    InvalidTestcaseMode,
    NoTestcaseActive,
    InternalError,
}

impl SignalKind {
    pub fn name(self) -> &'static str {
        match self {
            SignalKind::EvaluationError => "EvaluationError",
            SignalKind::ProcessStartError => "ProcessStartError",
            SignalKind::ProcessStartTimeout => "ProcessStartTimeout",
            SignalKind::FunctionDoesNotExist => "FunctionDoesNotExist",
            SignalKind::FunctionArgValidate => "FunctionArgValidate",
            SignalKind::ImportError => "ImportError",
            SignalKind::FileCopyError => "FileCopyError",
            SignalKind::NoResponseFromMachine => "NoResponseFromMachine",
            SignalKind::ParseError => "ParseError",
            SignalKind::InvalidTimerValue => "InvalidTimerValue",
            SignalKind::InvalidValue => "InvalidValue",
            SignalKind::InvalidTestcaseMode => "InvalidTestcaseMode",
            SignalKind::NoTestcaseActive => "NoTestcaseActive",
            SignalKind::InternalError => "InternalError",
        }
    }

    /// Variable that receives the signal's message
    pub fn message_var(self) -> String {
        format!("{}Msg", self.name())
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Well-known thread variable names
pub mod vars {
    pub const RC: &str = "RC";
    pub const RESULT: &str = "Result";
    pub const SUBSTRATE_RESULT: &str = "SubstrateResult";
    pub const PROCESS_HANDLE: &str = "ProcessHandle";
    pub const PROCESS_TIMESTAMP: &str = "ProcessTimestamp";
    pub const SUB_JOB_ID: &str = "SubJobID";
    pub const SUB_JOB_STATUS: &str = "SubJobStatus";
    pub const CURRENT_FUNCTION: &str = "CurrentFunction";
    pub const CURRENT_FILE: &str = "CurrentFile";
    pub const CURRENT_MACHINE: &str = "CurrentMachine";
    pub const CURRENT_BLOCK: &str = "CurrentBlock";
    pub const CURRENT_TESTCASE: &str = "CurrentTestcase";
    pub const FUNCTION_ARG: &str = "FunctionArg";
    pub const FUNCTION_ERROR: &str = "FunctionError";
}
