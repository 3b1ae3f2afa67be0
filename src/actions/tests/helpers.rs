//! Test helpers for action and thread tests
//!
//! A scripted substrate that answers process starts the way each test asks,
//! and a test engine wired to it with in-memory events and documents.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::action::ActionDef;
use crate::actions::function::FunctionDefinition;
use crate::config::Config;
use crate::documents::MemoryDocumentSource;
use crate::engine::Engine;
use crate::job::events::MemoryEventSink;
use crate::job::{Job, JobDefinition, JobOutcome};
use crate::substrate::{
    Capability, CompletionRouter, ProcessEnd, Request, RequestCompleteListener, RequestId,
    RequestResult, Substrate,
};
use crate::types::ResultCode;

/// How the substrate answers the next start of a command
#[derive(Debug, Clone)]
pub enum StartReply {
    /// Started; ends by itself with `rc` after `after`, or runs until
    /// stopped or ended by the test when `after` is `None`
    Started { rc: i64, after: Option<Duration> },
    /// Completes the request with a failure
    Fail(ResultCode, String),
    /// Completes the request as lacking notify key support
    Unsupported,
    /// Refuses the submission outright
    Reject(ResultCode, String),
    /// Never answers
    Silent,
    /// Reports the process end with `rc` before answering the start
    EndsBeforeAck(i64),
    /// Started and running until stopped, but answered only after the delay
    LateAck(Duration),
}

impl StartReply {
    pub fn ends_after(millis: u64, rc: i64) -> Self {
        StartReply::Started {
            rc,
            after: Some(Duration::from_millis(millis)),
        }
    }

    pub fn runs() -> Self {
        StartReply::Started { rc: 0, after: None }
    }
}

struct Running {
    job_id: u64,
    machine: String,
    key: Option<String>,
}

/// Substrate whose answers are scripted per command
#[derive(Default)]
pub struct ScriptedSubstrate {
    replies: Mutex<HashMap<String, VecDeque<StartReply>>>,
    requests: Mutex<Vec<(String, Request)>>,
    running: Arc<Mutex<HashMap<String, Running>>>,
    next_request: AtomicU64,
    next_handle: AtomicU64,
    no_notify_key: AtomicBool,
    router: RwLock<Option<Weak<dyn CompletionRouter>>>,
}

impl ScriptedSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer for the next start of `command`
    pub fn reply(&self, command: &str, reply: StartReply) {
        self.replies
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Report notify keys as unsupported when asked up front
    pub fn without_notify_key(&self) {
        self.no_notify_key.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(String, Request)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn start_requests(&self) -> Vec<crate::substrate::ProcessStartRequest> {
        self.requests()
            .into_iter()
            .filter_map(|(_, request)| match request {
                Request::StartProcess(start) => Some(start),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|(_, request)| match request {
                Request::StopProcess { handle } => Some(handle),
                _ => None,
            })
            .collect()
    }

    pub fn frees(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|(_, request)| match request {
                Request::FreeProcess { handle } => Some(handle),
                _ => None,
            })
            .collect()
    }

    pub fn running_handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.running.lock().unwrap().keys().cloned().collect();
        handles.sort();
        handles
    }

    fn router(&self) -> Option<Arc<dyn CompletionRouter>> {
        self.router
            .read()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// End a running process as if it exited with `rc`
    pub fn end_process(&self, handle: &str, rc: i64) -> bool {
        let Some(running) = self.running.lock().unwrap().remove(handle) else {
            return false;
        };
        let mut end = ProcessEnd::new(running.machine, handle, rc);
        if let Some(key) = running.key {
            end = end.with_key(key);
        }
        if let Some(router) = self.router() {
            router.process_ended(running.job_id, end);
        }
        true
    }

    fn start(
        &self,
        target: &str,
        start: crate::substrate::ProcessStartRequest,
        listener: Arc<dyn RequestCompleteListener>,
    ) -> Result<RequestId, RequestResult> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&start.command)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| StartReply::ends_after(10, 0));

        let result = match reply {
            StartReply::Reject(rc, message) => return Err(RequestResult::failed(rc, message)),
            StartReply::Silent => return Ok(request_id),
            StartReply::Fail(rc, message) => RequestResult::failed(rc, message),
            StartReply::Unsupported => RequestResult::Unsupported(Capability::NotifyKey),
            StartReply::EndsBeforeAck(rc) => {
                let handle = (self.next_handle.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                let mut end = ProcessEnd::new(target, handle.clone(), rc);
                if let Some(key) = start.notify_key.clone() {
                    end = end.with_key(key);
                }
                let router = self.router();
                let job_id = start.job_id;
                tokio::spawn(async move {
                    if let Some(router) = router {
                        router.process_ended(job_id, end);
                    }
                    listener.request_complete(request_id, RequestResult::Ok(handle));
                });
                return Ok(request_id);
            }
            StartReply::LateAck(after) => {
                let handle = (self.next_handle.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                self.running.lock().unwrap().insert(
                    handle.clone(),
                    Running {
                        job_id: start.job_id,
                        machine: target.to_string(),
                        key: start.notify_key.clone(),
                    },
                );
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    listener.request_complete(request_id, RequestResult::Ok(handle));
                });
                return Ok(request_id);
            }
            StartReply::Started { rc, after } => {
                let handle = (self.next_handle.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                self.running.lock().unwrap().insert(
                    handle.clone(),
                    Running {
                        job_id: start.job_id,
                        machine: target.to_string(),
                        key: start.notify_key.clone(),
                    },
                );

                if let Some(after) = after {
                    let running = self.running.clone();
                    let router = self.router();
                    let handle = handle.clone();
                    let machine = target.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let Some(entry) = running.lock().unwrap().remove(&handle) else {
                            return;
                        };
                        let mut end = ProcessEnd::new(machine, handle, rc);
                        if let Some(key) = entry.key {
                            end = end.with_key(key);
                        }
                        if let Some(router) = router {
                            router.process_ended(entry.job_id, end);
                        }
                    });
                }
                RequestResult::Ok(handle)
            }
        };

        tokio::spawn(async move { listener.request_complete(request_id, result) });
        Ok(request_id)
    }

    /// Answer anything but a process start
    fn answer(&self, request: Request) -> RequestResult {
        match request {
            Request::StartProcess(_) => {
                RequestResult::failed(ResultCode::INVALID_REQUEST_STRING, "asynchronous only")
            }
            Request::StopProcess { handle } => {
                let running = self.running.clone();
                if !running.lock().unwrap().contains_key(&handle) {
                    return RequestResult::failed(ResultCode::DOES_NOT_EXIST, "no such handle");
                }
                let router = self.router();
                tokio::spawn(async move {
                    let Some(entry) = running.lock().unwrap().remove(&handle) else {
                        return;
                    };
                    let mut end = ProcessEnd::new(entry.machine, handle, -1);
                    if let Some(key) = entry.key {
                        end = end.with_key(key);
                    }
                    if let Some(router) = router {
                        router.process_ended(entry.job_id, end);
                    }
                });
                RequestResult::Ok(String::new())
            }
            Request::FreeProcess { .. } => RequestResult::Ok(String::new()),
            Request::ExecuteJob(sub_job) => match self.router() {
                Some(router) => router.execute_job(&sub_job),
                None => RequestResult::failed(ResultCode::DOES_NOT_EXIST, "no router"),
            },
            Request::TerminateJob { job_id } => match self.router() {
                Some(router) => router.terminate_job(job_id),
                None => RequestResult::failed(ResultCode::DOES_NOT_EXIST, "no router"),
            },
        }
    }
}

impl Substrate for ScriptedSubstrate {
    fn submit_async(
        &self,
        target: &str,
        request: Request,
        listener: Arc<dyn RequestCompleteListener>,
    ) -> Result<RequestId, RequestResult> {
        self.requests
            .lock()
            .unwrap()
            .push((target.to_string(), request.clone()));

        match request {
            Request::StartProcess(start) => self.start(target, start, listener),
            other => {
                let request_id = self.next_request.fetch_add(1, Ordering::SeqCst) + 1;
                let result = self.answer(other);
                tokio::spawn(async move { listener.request_complete(request_id, result) });
                Ok(request_id)
            }
        }
    }

    fn submit_sync(&self, target: &str, request: Request) -> RequestResult {
        self.requests
            .lock()
            .unwrap()
            .push((target.to_string(), request.clone()));
        self.answer(request)
    }

    fn submit_async_forget(&self, target: &str, request: Request) {
        let _ = self.submit_sync(target, request);
    }

    fn supports(&self, _target: &str, capability: Capability) -> bool {
        match capability {
            Capability::NotifyKey => !self.no_notify_key.load(Ordering::SeqCst),
        }
    }

    fn attach_router(&self, router: Weak<dyn CompletionRouter>) {
        *self.router.write().unwrap() = Some(router);
    }
}

/// Engine wired to a scripted substrate and in-memory collaborators
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub substrate: Arc<ScriptedSubstrate>,
    pub events: Arc<MemoryEventSink>,
    pub documents: Arc<MemoryDocumentSource>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let substrate = Arc::new(ScriptedSubstrate::new());
        let events = Arc::new(MemoryEventSink::new());
        let documents = Arc::new(MemoryDocumentSource::new());

        let engine = Engine::builder(config)
            .substrate(substrate.clone())
            .events(events.clone())
            .documents(documents.clone())
            .build();

        Self {
            engine,
            substrate,
            events,
            documents,
        }
    }

    /// Config with a short process start timeout
    pub fn with_start_timeout(millis: u64) -> Self {
        let mut config = Config::default();
        config.process.start_timeout_ms = millis;
        Self::with_config(config)
    }

    pub fn start(&self, definition: JobDefinition) -> Arc<Job> {
        self.engine.start_job(definition)
    }

    pub async fn wait(&self, job: &Job) -> JobOutcome {
        tokio::time::timeout(Duration::from_secs(10), job.wait())
            .await
            .expect("job did not complete in time")
    }

    pub async fn run(&self, definition: JobDefinition) -> JobOutcome {
        let job = self.start(definition);
        self.wait(&job).await
    }
}

/// A job whose default call runs `body` as function `main`
pub fn main_job(body: ActionDef) -> JobDefinition {
    JobDefinition::new("test")
        .with_function(FunctionDefinition::new("main").with_body(body))
        .with_default_call("main", None)
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
