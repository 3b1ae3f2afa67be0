//! Substrate that runs processes on the local machine with `tokio::process`
//!
//! Sub-job requests are handed to the attached [`CompletionRouter`], which is
//! the engine itself.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;

use super::{
    Capability, CompletionRouter, ProcessEnd, ProcessStartRequest, Redirect, Request,
    RequestCompleteListener, RequestId, RequestResult, Substrate,
};
use crate::types::ResultCode;

pub struct LocalSubstrate {
    machine: String,
    next_request: AtomicU64,
    next_handle: AtomicU64,
    /// Kill switches for running processes, by handle
    running: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
    router: RwLock<Option<Weak<dyn CompletionRouter>>>,
}

impl LocalSubstrate {
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            next_request: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
            running: Arc::new(Mutex::new(HashMap::new())),
            router: RwLock::new(None),
        }
    }

    fn router(&self) -> Option<Arc<dyn CompletionRouter>> {
        self.router
            .read()
            .ok()
            .and_then(|router| router.as_ref().and_then(Weak::upgrade))
    }

    fn start_process(
        &self,
        request: ProcessStartRequest,
        listener: Arc<dyn RequestCompleteListener>,
    ) -> Result<RequestId, RequestResult> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let mut command = build_command(&request).map_err(|message| {
            RequestResult::failed(ResultCode::INVALID_REQUEST_STRING, message)
        })?;

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let result = RequestResult::failed(
                    ResultCode::DOES_NOT_EXIST,
                    format!("Error starting {}: {}", request.command, e),
                );
                tokio::spawn(async move { listener.request_complete(request_id, result) });
                return Ok(request_id);
            }
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed).to_string();
        let (kill_tx, kill_rx) = oneshot::channel();
        if let Ok(mut running) = self.running.lock() {
            running.insert(handle.clone(), kill_tx);
        }

        let machine = self.machine.clone();
        let router = self.router();
        let running = self.running.clone();

        tokio::spawn(async move {
            listener.request_complete(request_id, RequestResult::Ok(handle.clone()));

            let stdout_reader = child.stdout.take().map(|mut out| {
                tokio::spawn(async move {
                    let mut text = String::new();
                    let _ = out.read_to_string(&mut text).await;
                    text
                })
            });
            let stderr_reader = child.stderr.take().map(|mut err| {
                tokio::spawn(async move {
                    let mut text = String::new();
                    let _ = err.read_to_string(&mut text).await;
                    text
                })
            });

            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let rc = match status {
                Ok(status) => status.code().map(i64::from).unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(handle = %handle, error = %e, "Failed waiting for process");
                    -1
                }
            };

            let mut end = ProcessEnd::new(machine, handle.clone(), rc);
            if let Some(key) = request.notify_key {
                end = end.with_key(key);
            }
            let mut stdout_text = match stdout_reader {
                Some(reader) => Some(reader.await.unwrap_or_default()),
                None => None,
            };
            let mut stderr_text = match stderr_reader {
                Some(reader) => Some(reader.await.unwrap_or_default()),
                None => None,
            };
            if request.stderr_to_stdout {
                if let (Some(out), Some(err)) = (stdout_text.as_mut(), stderr_text.take()) {
                    out.push_str(&err);
                }
            }
            for text in [stdout_text, stderr_text].into_iter().flatten() {
                end.files.push(json!([0, text]));
            }

            if let Ok(mut running) = running.lock() {
                running.remove(&handle);
            }

            match router {
                Some(router) => router.process_ended(request.job_id, end),
                None => tracing::warn!(handle = %handle, "Process ended with no router attached"),
            }
        });

        Ok(request_id)
    }

    fn stop_process(&self, handle: &str) -> RequestResult {
        let kill = self
            .running
            .lock()
            .ok()
            .and_then(|mut running| running.remove(handle));

        match kill {
            Some(kill) => {
                let _ = kill.send(());
                RequestResult::Ok(String::new())
            }
            None => RequestResult::failed(
                ResultCode::DOES_NOT_EXIST,
                format!("Handle {} does not exist", handle),
            ),
        }
    }
}

impl Substrate for LocalSubstrate {
    fn submit_async(
        &self,
        target: &str,
        request: Request,
        listener: Arc<dyn RequestCompleteListener>,
    ) -> Result<RequestId, RequestResult> {
        match request {
            Request::StartProcess(start) => self.start_process(start, listener),
            other => {
                let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
                let result = self.submit_sync(target, other);
                tokio::spawn(async move { listener.request_complete(request_id, result) });
                Ok(request_id)
            }
        }
    }

    fn submit_sync(&self, _target: &str, request: Request) -> RequestResult {
        match request {
            Request::StartProcess(_) => RequestResult::failed(
                ResultCode::INVALID_REQUEST_STRING,
                "Process start requests must be submitted asynchronously",
            ),
            Request::StopProcess { handle } => self.stop_process(&handle),
            Request::FreeProcess { .. } => RequestResult::Ok(String::new()),
            Request::ExecuteJob(sub_job) => match self.router() {
                Some(router) => router.execute_job(&sub_job),
                None => RequestResult::failed(ResultCode::DOES_NOT_EXIST, "No engine attached"),
            },
            Request::TerminateJob { job_id } => match self.router() {
                Some(router) => router.terminate_job(job_id),
                None => RequestResult::failed(ResultCode::DOES_NOT_EXIST, "No engine attached"),
            },
        }
    }

    fn submit_async_forget(&self, target: &str, request: Request) {
        let result = self.submit_sync(target, request);
        if !result.rc().is_ok() {
            tracing::debug!(rc = %result.rc(), message = %result.message(), "Forgotten request failed");
        }
    }

    fn supports(&self, _target: &str, capability: Capability) -> bool {
        match capability {
            Capability::NotifyKey => true,
        }
    }

    fn attach_router(&self, router: Weak<dyn CompletionRouter>) {
        if let Ok(mut slot) = self.router.write() {
            *slot = Some(router);
        }
    }
}

fn build_command(request: &ProcessStartRequest) -> Result<Command, String> {
    let mut command = Command::new(&request.command);

    if let Some(parms) = &request.parms {
        command.args(parms.split_whitespace());
    }
    if let Some(workdir) = &request.workdir {
        command.current_dir(workdir);
    }
    for entry in &request.env {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("Invalid environment variable: {}", entry))?;
        command.env(name, value);
    }

    command.stdin(match &request.stdin {
        Some(path) => Stdio::from(
            std::fs::File::open(path).map_err(|e| format!("Error opening stdin {}: {}", path, e))?,
        ),
        None => Stdio::null(),
    });

    let stdout = request.stdout.as_ref().map(open_redirect).transpose()?;

    let stderr = if request.stderr_to_stdout {
        // A piped stderr is appended to the returned stdout once both close
        match &stdout {
            Some(file) => Stdio::from(
                file.try_clone()
                    .map_err(|e| format!("Error sharing stdout with stderr: {}", e))?,
            ),
            None if request.return_stdout => Stdio::piped(),
            None => Stdio::null(),
        }
    } else {
        match &request.stderr {
            Some(redirect) => Stdio::from(open_redirect(redirect)?),
            None if request.return_stderr => Stdio::piped(),
            None => Stdio::null(),
        }
    };

    command.stdout(match stdout {
        Some(file) => Stdio::from(file),
        None if request.return_stdout => Stdio::piped(),
        None => Stdio::null(),
    });
    command.stderr(stderr);

    command.kill_on_drop(true);
    Ok(command)
}

fn open_redirect(redirect: &Redirect) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .append(redirect.append)
        .truncate(!redirect.append)
        .open(&redirect.file)
        .map_err(|e| format!("Error opening {}: {}", redirect.file, e))
}
