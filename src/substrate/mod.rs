//! Command-execution substrate
//!
//! The engine starts processes and sub-jobs by submitting typed requests to a
//! [`Substrate`]. Asynchronous submissions report back through a
//! [`RequestCompleteListener`]; the end of a started process arrives later as
//! a [`ProcessEnd`] routed to the owning job.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::job::JobOutcome;
use crate::timestamp::Timestamp;
use crate::types::{ResultCode, Value};

pub mod local;

pub use local::LocalSubstrate;

pub type RequestId = u64;

/// Where a process stream is redirected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redirect {
    pub file: String,
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStartRequest {
    pub job_id: u64,
    pub command: String,
    pub parms: Option<String>,
    pub workdir: Option<String>,
    pub title: Option<String>,
    pub env: Vec<String>,
    pub vars: Vec<String>,
    pub stdin: Option<String>,
    pub stdout: Option<Redirect>,
    pub stderr: Option<Redirect>,
    pub stderr_to_stdout: bool,
    pub return_stdout: bool,
    pub return_stderr: bool,
    pub other: Option<String>,
    /// Correlation key the substrate must echo back in the process end
    pub notify_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubJobRequest {
    pub parent_job: u64,
    pub job_file: Option<String>,
    pub file_machine: Option<String>,
    pub job_data: Option<String>,
    pub name: Option<String>,
    pub clear_logs: bool,
    pub log_tc_elapsed_time: bool,
    pub log_tc_num_starts: bool,
    pub log_tc_start_stop: bool,
    pub function: Option<String>,
    pub args: Option<String>,
    pub scripts: Vec<String>,
    pub script_files: Vec<String>,
    pub script_file_machine: Option<String>,
    pub hold: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    StartProcess(ProcessStartRequest),
    StopProcess { handle: String },
    FreeProcess { handle: String },
    ExecuteJob(SubJobRequest),
    TerminateJob { job_id: u64 },
}

/// Optional protocol features a target may or may not support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Process end notifications carry a caller-chosen key
    NotifyKey,
}

/// Result of a submitted request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestResult {
    Ok(String),
    /// The target rejected the request because it lacks a capability
    Unsupported(Capability),
    Failed { rc: ResultCode, message: String },
}

impl RequestResult {
    pub fn failed(rc: ResultCode, message: impl Into<String>) -> Self {
        RequestResult::Failed {
            rc,
            message: message.into(),
        }
    }

    pub fn rc(&self) -> ResultCode {
        match self {
            RequestResult::Ok(_) => ResultCode::OK,
            RequestResult::Unsupported(_) => ResultCode::INVALID_REQUEST_STRING,
            RequestResult::Failed { rc, .. } => *rc,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RequestResult::Ok(result) => result.clone(),
            RequestResult::Unsupported(capability) => {
                format!("Target does not support {:?}", capability)
            }
            RequestResult::Failed { message, .. } => message.clone(),
        }
    }
}

/// Receives the completion of an asynchronous submission
pub trait RequestCompleteListener: Send + Sync {
    fn request_complete(&self, request: RequestId, result: RequestResult);
}

/// Receives process ends and serves sub-job requests for a substrate
pub trait CompletionRouter: Send + Sync {
    fn process_ended(&self, job_id: u64, end: ProcessEnd);

    fn execute_job(&self, request: &SubJobRequest) -> RequestResult;

    fn terminate_job(&self, job_id: u64) -> RequestResult;
}

pub trait Substrate: Send + Sync {
    /// Submit a request; `listener` is called exactly once, never on the
    /// caller's stack. An immediate rejection is returned as `Err`.
    fn submit_async(
        &self,
        target: &str,
        request: Request,
        listener: Arc<dyn RequestCompleteListener>,
    ) -> Result<RequestId, RequestResult>;

    fn submit_sync(&self, target: &str, request: Request) -> RequestResult;

    /// Best-effort submission with no completion notification
    fn submit_async_forget(&self, target: &str, request: Request);

    fn supports(&self, _target: &str, _capability: Capability) -> bool {
        true
    }

    /// Called once by the engine that owns this substrate
    fn attach_router(&self, _router: Weak<dyn CompletionRouter>) {}
}

/// A started process has ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEnd {
    pub machine: String,
    pub handle: String,
    pub key: Option<String>,
    pub rc: i64,
    pub files: Vec<Value>,
    pub timestamp: Timestamp,
}

impl ProcessEnd {
    pub fn new(machine: impl Into<String>, handle: impl Into<String>, rc: i64) -> Self {
        Self {
            machine: machine.into(),
            handle: handle.into(),
            key: None,
            rc,
            files: Vec::new(),
            timestamp: Timestamp::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Key under which the waiting action registered
    pub fn correlation_key(&self) -> String {
        match &self.key {
            Some(key) => key.clone(),
            None => handle_key(&self.machine, &self.handle),
        }
    }
}

/// Correlation key for a process started without a notify key
pub fn handle_key(machine: &str, handle: &str) -> String {
    format!("{}/{}", machine, handle).to_lowercase()
}

/// Key of the running-process index used for operator lookups
pub fn request_key(machine: &str, handle: &str) -> String {
    format!("{}:{}", machine, handle).to_lowercase()
}

/// Outcome of a sub-job as reported to the job that started it
pub type SubJobOutcome = JobOutcome;
