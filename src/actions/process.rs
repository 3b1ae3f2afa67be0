//! Process action
//!
//! Starts a process through the substrate and waits for it to end. The
//! action instance is shared between its thread and the substrate callbacks,
//! so all of its mutable state sits behind one mutex and every callback
//! checks the current phase before acting.
//!
//! ```text
//! Init -> WaitRequest -> Running --------> Complete
//!                    \-> RequestError ---/
//!                    \-> RequestTimeout -/
//! ```

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::action::{Action, ActionDef, ActionDefinition};
use crate::condition::{Condition, Hold};
use crate::correlation::Registration;
use crate::errors::{EvalError, Location};
use crate::evaluator::to_display_string;
use crate::job::events::{self, Event};
use crate::job::Job;
use crate::rendezvous::{start_nested, Rendezvous};
use crate::substrate::{
    handle_key, request_key, Capability, ProcessEnd, ProcessStartRequest, Redirect, Request,
    RequestCompleteListener, RequestId, RequestResult,
};
use crate::thread::{Thread, ThreadCompleteListener};
use crate::timer::{TimedEventId, TimedEventListener};
use crate::timestamp::Timestamp;
use crate::types::{vars, ResultCode, SignalKind, ThreadEndCode, Value};

/// An output redirection as written in the definition
#[derive(Debug, Clone)]
pub struct RedirectDef {
    pub file: String,
    pub append: bool,
}

/// Every attribute is an expression evaluated on the thread that runs the
/// action
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub location: Location,
    pub name: Option<String>,
    pub machine: String,
    pub command: String,
    pub parms: Option<String>,
    pub workdir: Option<String>,
    pub title: Option<String>,
    pub env: Vec<String>,
    pub vars: Vec<String>,
    pub stdin: Option<String>,
    pub stdout: Option<RedirectDef>,
    pub stderr: Option<RedirectDef>,
    pub stderr_to_stdout: bool,
    pub return_stdout: bool,
    pub return_stderr: bool,
    pub other: Option<String>,
    /// Run on a child thread while the process is running
    pub nested: Option<ActionDef>,
}

impl ProcessDefinition {
    pub fn new(machine: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            location: Location::inline("process"),
            name: None,
            machine: machine.into(),
            command: command.into(),
            parms: None,
            workdir: None,
            title: None,
            env: Vec::new(),
            vars: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            stderr_to_stdout: false,
            return_stdout: false,
            return_stderr: false,
            other: None,
            nested: None,
        }
    }

    pub fn with_parms(mut self, parms: impl Into<String>) -> Self {
        self.parms = Some(parms.into());
        self
    }

    pub fn with_nested(mut self, action: ActionDef) -> Self {
        self.nested = Some(action);
        self
    }

    pub fn returning_stdout(mut self) -> Self {
        self.return_stdout = true;
        self
    }

    /// Evaluate every attribute into a start request
    ///
    /// On failure returns the name of the attribute that failed.
    fn evaluate(
        &self,
        thread: &Thread,
        job_id: u64,
    ) -> Result<(String, String, ProcessStartRequest), (&'static str, EvalError)> {
        let eval = |attribute: &'static str, expr: &str| {
            thread.eval_string(expr).map_err(|e| (attribute, e))
        };
        let eval_opt = |attribute: &'static str, expr: &Option<String>| {
            thread
                .eval_opt_string(expr.as_deref())
                .map_err(|e| (attribute, e))
        };
        let eval_strings = |attribute: &'static str, exprs: &[String]| {
            let mut values = Vec::new();
            for expr in exprs {
                let items = thread.eval_list(expr).map_err(|e| (attribute, e))?;
                values.extend(items.iter().map(to_display_string));
            }
            Ok::<_, (&'static str, EvalError)>(values)
        };
        let eval_redirect = |attribute: &'static str, redirect: &Option<RedirectDef>| {
            redirect
                .as_ref()
                .map(|r| {
                    eval(attribute, &r.file).map(|file| Redirect {
                        file,
                        append: r.append,
                    })
                })
                .transpose()
        };

        let machine = eval("location", &self.machine)?;
        let command = eval("command", &self.command)?;
        let name = match &self.name {
            Some(expr) => eval("name", expr)?,
            None => format!("Process{}", thread.number()),
        };

        let request = ProcessStartRequest {
            job_id,
            command,
            parms: eval_opt("parms", &self.parms)?,
            workdir: eval_opt("workdir", &self.workdir)?,
            title: eval_opt("title", &self.title)?,
            env: eval_strings("env", &self.env)?,
            vars: eval_strings("var", &self.vars)?,
            stdin: eval_opt("stdin", &self.stdin)?,
            stdout: eval_redirect("stdout", &self.stdout)?,
            stderr: eval_redirect("stderr", &self.stderr)?,
            stderr_to_stdout: self.stderr_to_stdout,
            return_stdout: self.return_stdout,
            return_stderr: self.return_stderr,
            other: eval_opt("other", &self.other)?,
            notify_key: None,
        };

        Ok((machine, name, request))
    }
}

impl ActionDefinition for ProcessDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        ProcessAction::new(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    Init,
    WaitRequest,
    RequestError,
    RequestTimeout,
    Running,
    Complete,
}

struct ProcessState {
    phase: ProcessPhase,
    thread: Weak<Thread>,
    machine: String,
    name: String,
    request: Option<ProcessStartRequest>,
    request_id: Option<RequestId>,
    retried: bool,
    timer: Option<TimedEventId>,
    handle: String,
    key: String,
    rendezvous: Rendezvous,
    rc: ResultCode,
    substrate_result: String,
    process_rc: i64,
    files: Vec<Value>,
    ended: Option<Timestamp>,
}

pub struct ProcessAction {
    definition: Arc<ProcessDefinition>,
    me: Weak<ProcessAction>,
    hold: Hold,
    hard_hold: Hold,
    state: Mutex<ProcessState>,
}

impl ProcessAction {
    pub fn new(definition: Arc<ProcessDefinition>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            definition,
            me: me.clone(),
            hold: Hold::soft("Process"),
            hard_hold: Hold::hard("ProcessAction"),
            state: Mutex::new(ProcessState {
                phase: ProcessPhase::Init,
                thread: Weak::new(),
                machine: String::new(),
                name: String::new(),
                request: None,
                request_id: None,
                retried: false,
                timer: None,
                handle: String::new(),
                key: String::new(),
                rendezvous: Rendezvous::new(),
                rc: ResultCode::OK,
                substrate_result: String::new(),
                process_rc: 0,
                files: Vec::new(),
                ended: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> ProcessPhase {
        self.lock().phase
    }

    /// Machine and handle of the started process
    pub fn target(&self) -> (String, String) {
        let state = self.lock();
        (state.machine.clone(), state.handle.clone())
    }

    fn start(&self, thread: &Arc<Thread>) {
        let Ok(job) = thread.job() else {
            return;
        };

        let (machine, name, mut request) = match self.definition.evaluate(thread, job.id()) {
            Ok(evaluated) => evaluated,
            Err((attribute, e)) => {
                self.lock().phase = ProcessPhase::Complete;
                thread.pop_action();
                thread.raise_error(
                    SignalKind::EvaluationError,
                    &self.definition.location,
                    Some(attribute),
                    &e.to_string(),
                );
                return;
            }
        };

        let Some(me) = self.me.upgrade() else {
            return;
        };

        let mut state = self.lock();
        state.thread = Arc::downgrade(thread);
        state.machine = machine.clone();
        state.name = name;

        if job.settings().use_notify_key
            && job.substrate().supports(&machine, Capability::NotifyKey)
        {
            let key = job.next_process_key();
            request.notify_key = Some(key.clone());
            state.key = key;
        }

        state.phase = ProcessPhase::WaitRequest;
        state.request = Some(request.clone());
        thread.add_hold(&self.hold);
        state.timer = Some(job.timer().add(
            job.settings().process_start_timeout,
            me.clone() as Arc<dyn TimedEventListener>,
        ));

        let submitted = job.substrate().submit_async(
            &machine,
            Request::StartProcess(request),
            me as Arc<dyn RequestCompleteListener>,
        );

        match submitted {
            Ok(request_id) => state.request_id = Some(request_id),
            Err(result) => {
                if let Some(timer) = state.timer.take() {
                    job.timer().remove(timer);
                }
                state.phase = ProcessPhase::Complete;
                drop(state);

                thread.remove_hold(&self.hold);
                thread.pop_action();
                thread.set_var(vars::RC, Value::from(result.rc().0));
                thread.set_var(vars::SUBSTRATE_RESULT, Value::String(result.message()));
                thread.raise_error(
                    SignalKind::ProcessStartError,
                    &self.definition.location,
                    None,
                    &format!(
                        "Error submitting the request to start process on machine {}.  RC: {}, Result: {}",
                        machine,
                        result.rc(),
                        result.message()
                    ),
                );
            }
        }
    }

    /// Best-effort stop and free of a process nobody waits for any more
    fn abandon(job: &Job, machine: &str, handle: &str) {
        job.substrate().submit_async_forget(
            machine,
            Request::StopProcess {
                handle: handle.to_string(),
            },
        );
        job.substrate().submit_async_forget(
            machine,
            Request::FreeProcess {
                handle: handle.to_string(),
            },
        );
    }

    fn process_event(&self, job: &Job, state: &ProcessState, status: &str) -> Event {
        let mut event = Event::new(job.id(), events::PROCESS)
            .with("status", status)
            .with("name", &state.name)
            .with("location", &state.machine)
            .with("handle", &state.handle);
        if let Some(request) = &state.request {
            event = event
                .with("command", &request.command)
                .with("parms", request.parms.clone().unwrap_or_default());
        }
        event
    }

    fn started(&self, thread: &Arc<Thread>, job: &Job, state: &mut ProcessState, handle: String) {
        state.phase = ProcessPhase::Running;
        state.handle = handle;
        if state.key.is_empty() {
            state.key = handle_key(&state.machine, &state.handle);
        }

        let Some(me) = self.me.upgrade() else {
            return;
        };

        let registration = job
            .process_map
            .with(|map| map.register(state.key.clone(), me.clone()));

        match registration {
            Ok(Registration::AlreadyCompleted(end)) => {
                // Ended before the start reply; the nested action still runs
                self.start_nested_action(thread, state, &me);
                self.record_end(job, state, end);
                if state.rendezvous.is_ready() {
                    thread.remove_hold(&self.hold);
                }
            }
            Ok(Registration::Registered) => {
                state.rendezvous.external_started();
                if let Err(e) = job.process_request_map.with(|map| {
                    map.insert(request_key(&state.machine, &state.handle), me.clone())
                }) {
                    tracing::debug!(job_id = job.id(), error = %e, "Process request index missing");
                }
                job.generate_event(self.process_event(job, state, "start"));
                tracing::debug!(job_id = job.id(), handle = %state.handle, machine = %state.machine, "Process started");

                self.start_nested_action(thread, state, &me);
            }
            Err(e) => {
                tracing::warn!(job_id = job.id(), error = %e, "Process started for a job that is ending");
                state.process_rc = -1;
                thread.remove_hold(&self.hold);
            }
        }
    }

    /// Run the nested action on a child thread with `ProcessHandle` set
    fn start_nested_action(&self, thread: &Arc<Thread>, state: &mut ProcessState, me: &Arc<ProcessAction>) {
        let Some(nested) = &self.definition.nested else {
            return;
        };

        let handle = Value::String(state.handle.clone());
        match start_nested(
            thread,
            nested,
            &[(vars::PROCESS_HANDLE, handle)],
            me.clone() as Arc<dyn ThreadCompleteListener>,
        ) {
            Ok(child) => {
                state.rendezvous.add_child(child.clone());
                child.schedule();
            }
            Err(e) => thread.raise_signal(SignalKind::InternalError, e.to_string()),
        }
    }

    fn record_end(&self, job: &Job, state: &mut ProcessState, end: ProcessEnd) {
        job.substrate().submit_async_forget(
            &state.machine,
            Request::FreeProcess {
                handle: state.handle.clone(),
            },
        );
        state.process_rc = end.rc;
        state.files = end.files;
        state.ended = Some(end.timestamp);
    }

    /// The started process has ended
    pub fn process_complete(&self, end: ProcessEnd) {
        let mut state = self.lock();
        let Some(thread) = state.thread.upgrade() else {
            return;
        };
        let Ok(job) = thread.job() else {
            return;
        };

        if state.phase == ProcessPhase::Complete {
            job.substrate().submit_async_forget(
                &end.machine,
                Request::FreeProcess {
                    handle: end.handle.clone(),
                },
            );
            return;
        }

        if state.rendezvous.external_finished() {
            job.generate_event(
                self.process_event(&job, &state, "stop")
                    .with("rc", end.rc),
            );
            let key = request_key(&state.machine, &state.handle);
            let _ = job.process_request_map.with(|map| map.remove(&key));
        }

        self.record_end(&job, &mut state, end);
        tracing::debug!(job_id = job.id(), handle = %state.handle, rc = state.process_rc, "Process ended");

        if state.rendezvous.is_ready() {
            drop(state);
            thread.remove_hold(&self.hold);
            thread.schedule();
        }
    }

    fn finish(&self, thread: &Arc<Thread>) {
        let (rc, files, ended, handle) = {
            let mut state = self.lock();
            state.phase = ProcessPhase::Complete;
            (
                state.process_rc,
                std::mem::take(&mut state.files),
                state.ended,
                state.handle.clone(),
            )
        };

        thread.pop_action();
        thread.set_var(vars::RC, Value::from(rc));
        thread.set_var(vars::RESULT, Value::Array(files));
        thread.set_var(vars::PROCESS_HANDLE, Value::String(handle));
        thread.set_var(
            vars::PROCESS_TIMESTAMP,
            ended
                .map(|t| Value::String(t.timestamp_string()))
                .unwrap_or(Value::Null),
        );
    }
}

impl Action for ProcessAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        let phase = self.lock().phase;

        match phase {
            ProcessPhase::Init => self.start(thread),
            ProcessPhase::RequestError => {
                let (rc, message, machine) = {
                    let mut state = self.lock();
                    state.phase = ProcessPhase::Complete;
                    (state.rc, state.substrate_result.clone(), state.machine.clone())
                };
                thread.pop_action();
                thread.set_var(vars::RC, Value::from(rc.0));
                thread.set_var(vars::SUBSTRATE_RESULT, Value::String(message.clone()));
                thread.set_var(vars::RESULT, Value::Null);
                thread.raise_error(
                    SignalKind::ProcessStartError,
                    &self.definition.location,
                    None,
                    &format!(
                        "Error starting process on machine {}.  RC: {}, Result: {}",
                        machine, rc, message
                    ),
                );
            }
            ProcessPhase::RequestTimeout => {
                let (message, machine) = {
                    let mut state = self.lock();
                    state.phase = ProcessPhase::Complete;
                    (state.substrate_result.clone(), state.machine.clone())
                };
                thread.pop_action();
                thread.set_var(vars::RC, Value::from(ResultCode::TIMEOUT.0));
                thread.set_var(vars::SUBSTRATE_RESULT, Value::String(message.clone()));
                thread.set_var(vars::RESULT, Value::Null);
                thread.raise_error(
                    SignalKind::ProcessStartTimeout,
                    &self.definition.location,
                    None,
                    &format!("Machine: {}\n{}", machine, message),
                );
            }
            ProcessPhase::Running => {
                if self.lock().rendezvous.is_ready() {
                    self.finish(thread);
                }
            }
            ProcessPhase::WaitRequest | ProcessPhase::Complete => {}
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        let Ok(job) = thread.job() else {
            thread.pop_action();
            return;
        };

        let mut state = self.lock();

        if let Some(timer) = state.timer.take() {
            job.timer().remove(timer);
        }

        if state.rendezvous.external_finished() {
            Self::abandon(&job, &state.machine, &state.handle);
            job.generate_event(self.process_event(&job, &state, "stop"));

            let key = request_key(&state.machine, &state.handle);
            let _ = job.process_request_map.with(|map| map.remove(&key));
            let _ = job.process_map.with(|map| map.unregister(&state.key));
        }

        if state.rendezvous.stop_children(thread, &self.hard_hold) {
            state.phase = ProcessPhase::Complete;
            return;
        }

        state.phase = ProcessPhase::Complete;
        drop(state);

        thread.remove_hold(&self.hold);
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        ProcessAction::new(self.definition.clone())
    }

    fn details(&self) -> String {
        let state = self.lock();
        format!(
            "process {} on {} ({:?})",
            state.name, state.machine, state.phase
        )
    }
}

impl RequestCompleteListener for ProcessAction {
    fn request_complete(&self, request_id: RequestId, result: RequestResult) {
        let mut state = self.lock();
        let Some(thread) = state.thread.upgrade() else {
            return;
        };
        let Ok(job) = thread.job() else {
            return;
        };

        if state.phase != ProcessPhase::WaitRequest || state.request_id != Some(request_id) {
            // The timeout or a terminate got here first
            if let RequestResult::Ok(handle) = &result {
                Self::abandon(&job, &state.machine, handle);
            }
            return;
        }

        if let Some(timer) = state.timer.take() {
            job.timer().remove(timer);
        }

        match result {
            RequestResult::Ok(handle) => {
                self.started(&thread, &job, &mut state, handle);
                if state.rendezvous.is_ready() {
                    drop(state);
                    thread.schedule();
                }
            }
            RequestResult::Unsupported(Capability::NotifyKey)
                if !state.retried && !state.key.is_empty() =>
            {
                tracing::debug!(job_id = job.id(), machine = %state.machine, "Notify key not supported, retrying without it");
                state.retried = true;
                state.key.clear();

                let mut request = state.request.clone().unwrap_or_default();
                request.notify_key = None;
                state.request = Some(request.clone());

                let Some(me) = self.me.upgrade() else {
                    return;
                };
                state.timer = Some(job.timer().add(
                    job.settings().process_start_timeout,
                    me.clone() as Arc<dyn TimedEventListener>,
                ));

                match job.substrate().submit_async(
                    &state.machine,
                    Request::StartProcess(request),
                    me as Arc<dyn RequestCompleteListener>,
                ) {
                    Ok(request_id) => state.request_id = Some(request_id),
                    Err(result) => {
                        if let Some(timer) = state.timer.take() {
                            job.timer().remove(timer);
                        }
                        state.rc = result.rc();
                        state.substrate_result = result.message();
                        state.phase = ProcessPhase::RequestError;
                        drop(state);
                        thread.remove_hold(&self.hold);
                        thread.schedule();
                    }
                }
            }
            failed => {
                state.rc = failed.rc();
                state.substrate_result = failed.message();
                state.phase = ProcessPhase::RequestError;
                drop(state);
                thread.remove_hold(&self.hold);
                thread.schedule();
            }
        }
    }
}

impl TimedEventListener for ProcessAction {
    fn timed_event_occurred(&self) {
        let mut state = self.lock();
        if state.phase != ProcessPhase::WaitRequest {
            return;
        }

        let timeout = state
            .thread
            .upgrade()
            .and_then(|thread| thread.job().ok())
            .map(|job| job.settings().process_start_timeout.as_millis())
            .unwrap_or_default();

        state.phase = ProcessPhase::RequestTimeout;
        state.timer = None;
        state.rc = ResultCode::TIMEOUT;
        state.substrate_result = format!("Process did not start within timeout value {}", timeout);

        let thread = state.thread.upgrade();
        drop(state);

        if let Some(thread) = thread {
            thread.remove_hold(&self.hold);
            thread.schedule();
        }
    }
}

impl ThreadCompleteListener for ProcessAction {
    fn thread_complete(&self, child: &Arc<Thread>, _end_code: ThreadEndCode) {
        let mut state = self.lock();
        if !state.rendezvous.child_finished(child.number()) {
            return;
        }

        let Some(thread) = state.thread.upgrade() else {
            return;
        };

        thread.remove_hold(&self.hard_hold);
        if state.phase == ProcessPhase::Running && !state.rendezvous.is_external_running() {
            thread.remove_hold(&self.hold);
        }
        drop(state);

        thread.schedule();
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
