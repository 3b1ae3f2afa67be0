//! Sub-job action
//!
//! Submits a new job through the substrate and waits for it to end, running
//! an optional nested action beside it. Shares the wait-for-both protocol of
//! the process action.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::action::{Action, ActionDef, ActionDefinition};
use crate::condition::{Condition, Hold};
use crate::correlation::Registration;
use crate::errors::{EvalError, Location};
use crate::evaluator::to_display_string;
use crate::job::events::{self, Event};
use crate::job::{Job, JobOutcome};
use crate::rendezvous::{start_nested, Rendezvous};
use crate::substrate::{Request, SubJobRequest};
use crate::thread::{Thread, ThreadCompleteListener};
use crate::timestamp::parse_timer_value;
use crate::types::{vars, JobStatus, ResultCode, SignalKind, ThreadEndCode, Value};

/// Resolve a sub-job log option
///
/// An empty value or `parent` inherits the parent job's setting, `default`
/// takes the engine default. Returns `None` for anything else.
pub fn resolve_log_option(value: &str, parent: bool, default: bool) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "" | "parent" => Some(parent),
        "default" => Some(default),
        "enabled" => Some(true),
        "disabled" => Some(false),
        _ => None,
    }
}

/// Hold the sub-job before it starts
#[derive(Debug, Clone)]
pub struct JobHoldDef {
    pub if_expr: String,
    /// Timer value; `0` holds until released
    pub timeout: String,
}

/// Action run on a child thread while the sub-job runs
#[derive(Clone)]
pub struct NestedJobAction {
    pub if_expr: String,
    pub action: ActionDef,
}

impl std::fmt::Debug for NestedJobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedJobAction")
            .field("if_expr", &self.if_expr)
            .field("action", &self.action.location().element)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SubJobDefinition {
    pub location: Location,
    pub name: Option<String>,
    pub job_file: Option<String>,
    pub file_machine: Option<String>,
    pub job_data: Option<String>,
    pub clear_logs: Option<String>,
    pub log_tc_elapsed_time: Option<String>,
    pub log_tc_num_starts: Option<String>,
    pub log_tc_start_stop: Option<String>,
    pub function: Option<String>,
    pub args: Option<String>,
    pub scripts: Vec<String>,
    pub script_files: Vec<String>,
    pub script_machine: Option<String>,
    pub hold: Option<JobHoldDef>,
    pub nested: Option<NestedJobAction>,
}

impl SubJobDefinition {
    /// A sub-job running a named job definition
    pub fn new(job_data: impl Into<String>) -> Self {
        Self {
            location: Location::inline("job"),
            name: None,
            job_file: None,
            file_machine: None,
            job_data: Some(job_data.into()),
            clear_logs: None,
            log_tc_elapsed_time: None,
            log_tc_num_starts: None,
            log_tc_start_stop: None,
            function: None,
            args: None,
            scripts: Vec::new(),
            script_files: Vec::new(),
            script_machine: None,
            hold: None,
            nested: None,
        }
    }

    pub fn with_nested(mut self, if_expr: impl Into<String>, action: ActionDef) -> Self {
        self.nested = Some(NestedJobAction {
            if_expr: if_expr.into(),
            action,
        });
        self
    }
}

impl ActionDefinition for SubJobDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        JobAction::new(self)
    }
}

enum Prepared {
    Ready(SubJobRequest, bool),
    Failed(SignalKind, &'static str, String),
}

impl SubJobDefinition {
    fn prepare(&self, thread: &Thread, job: &Job) -> Result<Prepared, (&'static str, EvalError)> {
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

        let parent = job.settings();
        let defaults = &job.services().defaults;

        let mut log_options = Vec::new();
        for (attribute, expr, parent_value, default_value) in [
            ("clearlogs", &self.clear_logs, parent.clear_logs, defaults.clear_logs),
            (
                "logtcelapsedtime",
                &self.log_tc_elapsed_time,
                parent.log_tc_elapsed_time,
                defaults.log_tc_elapsed_time,
            ),
            (
                "logtcnumstarts",
                &self.log_tc_num_starts,
                parent.log_tc_num_starts,
                defaults.log_tc_num_starts,
            ),
            (
                "logtcstartstop",
                &self.log_tc_start_stop,
                parent.log_tc_start_stop,
                defaults.log_tc_start_stop,
            ),
        ] {
            let value = eval_opt(attribute, expr)?.unwrap_or_default();
            match resolve_log_option(&value, parent_value, default_value) {
                Some(resolved) => log_options.push(resolved),
                None => {
                    return Ok(Prepared::Failed(
                        SignalKind::InvalidValue,
                        attribute,
                        format!(
                            "Invalid value: {}\n\nMust be 'parent', 'default', 'enabled' or 'disabled'.",
                            value
                        ),
                    ))
                }
            }
        }

        let hold_requested = match &self.hold {
            Some(hold) => thread.eval_bool(&hold.if_expr).map_err(|e| ("if", e))?,
            None => false,
        };
        let hold = match &self.hold {
            Some(hold) if hold_requested => {
                let value = thread.eval_string(&hold.timeout).map_err(|e| ("timeout", e))?;
                match parse_timer_value(&value) {
                    Ok(duration) => Some(duration),
                    Err(e) => {
                        return Ok(Prepared::Failed(
                            SignalKind::InvalidTimerValue,
                            "timeout",
                            format!("Invalid timeout value: {}\n\n{}", value, e),
                        ))
                    }
                }
            }
            _ => None,
        };

        let run_nested = match &self.nested {
            Some(nested) => thread
                .eval_bool(&nested.if_expr)
                .map_err(|e| ("if", e))?,
            None => false,
        };

        let request = SubJobRequest {
            parent_job: job.id(),
            job_file: eval_opt("file", &self.job_file)?,
            file_machine: eval_opt("machine", &self.file_machine)?,
            job_data: eval_opt("data", &self.job_data)?,
            name: eval_opt("name", &self.name)?,
            clear_logs: log_options[0],
            log_tc_elapsed_time: log_options[1],
            log_tc_num_starts: log_options[2],
            log_tc_start_stop: log_options[3],
            function: eval_opt("function", &self.function)?,
            args: eval_opt("args", &self.args)?,
            scripts: eval_strings("script", &self.scripts)?,
            script_files: eval_strings("scriptfile", &self.script_files)?,
            script_file_machine: eval_opt("machine", &self.script_machine)?,
            hold,
        };

        Ok(Prepared::Ready(request, run_nested))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Init,
    Running,
    Complete,
}

struct JobActionState {
    phase: JobPhase,
    thread: Weak<Thread>,
    sub_job: u64,
    name: String,
    submit_rc: ResultCode,
    submit_result: String,
    rendezvous: Rendezvous,
    outcome: Option<JobOutcome>,
}

pub struct JobAction {
    definition: Arc<SubJobDefinition>,
    me: Weak<JobAction>,
    hold: Hold,
    hard_hold: Hold,
    state: Mutex<JobActionState>,
}

impl JobAction {
    pub fn new(definition: Arc<SubJobDefinition>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            definition,
            me: me.clone(),
            hold: Hold::soft("SubJob"),
            hard_hold: Hold::hard("JobAction"),
            state: Mutex::new(JobActionState {
                phase: JobPhase::Init,
                thread: Weak::new(),
                sub_job: 0,
                name: String::new(),
                submit_rc: ResultCode::OK,
                submit_result: String::new(),
                rendezvous: Rendezvous::new(),
                outcome: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, JobActionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> JobPhase {
        self.lock().phase
    }

    pub fn sub_job(&self) -> u64 {
        self.lock().sub_job
    }

    fn fail(&self, thread: &Arc<Thread>, rc: ResultCode, status: JobStatus) {
        self.lock().phase = JobPhase::Complete;
        thread.pop_action();
        thread.set_var(vars::RC, Value::from(rc.0));
        thread.set_var(vars::SUBSTRATE_RESULT, Value::Null);
        thread.set_var(vars::RESULT, Value::Null);
        thread.set_var(vars::SUB_JOB_ID, Value::from(0));
        thread.set_var(vars::SUB_JOB_STATUS, Value::String(status.to_string()));
    }

    fn start(&self, thread: &Arc<Thread>) {
        let Ok(job) = thread.job() else {
            return;
        };

        let (request, run_nested) = match self.definition.prepare(thread, &job) {
            Ok(Prepared::Ready(request, run_nested)) => (request, run_nested),
            Ok(Prepared::Failed(kind, attribute, message)) => {
                self.fail(thread, ResultCode::EVALUATION_FAILED, JobStatus::Unknown);
                thread.raise_error(kind, &self.definition.location, Some(attribute), &message);
                return;
            }
            Err((attribute, e)) => {
                self.fail(thread, ResultCode::EVALUATION_FAILED, JobStatus::Unknown);
                thread.raise_error(
                    SignalKind::EvaluationError,
                    &self.definition.location,
                    Some(attribute),
                    &e.to_string(),
                );
                return;
            }
        };

        let result = job
            .substrate()
            .submit_sync("local", Request::ExecuteJob(request.clone()));

        if !result.rc().is_ok() {
            let mut state = self.lock();
            state.phase = JobPhase::Complete;
            drop(state);

            thread.pop_action();
            thread.set_var(vars::RC, Value::from(result.rc().0));
            thread.set_var(vars::SUBSTRATE_RESULT, Value::String(result.message()));
            thread.set_var(vars::RESULT, Value::Null);
            thread.set_var(vars::SUB_JOB_ID, Value::from(0));
            thread.set_var(
                vars::SUB_JOB_STATUS,
                Value::String(JobStatus::Terminated.to_string()),
            );
            return;
        }

        let sub_job: u64 = match result.message().trim().parse() {
            Ok(id) => id,
            Err(_) => {
                self.fail(thread, ResultCode::INVALID_REQUEST_STRING, JobStatus::Unknown);
                thread.raise_error(
                    SignalKind::InternalError,
                    &self.definition.location,
                    None,
                    &format!("Invalid sub-job id: {}", result.message()),
                );
                return;
            }
        };

        let Some(me) = self.me.upgrade() else {
            return;
        };

        let mut state = self.lock();
        state.phase = JobPhase::Running;
        state.thread = Arc::downgrade(thread);
        state.sub_job = sub_job;
        state.submit_rc = result.rc();
        state.submit_result = result.message();
        state.name = request.name.clone().unwrap_or_else(|| {
            request
                .job_file
                .clone()
                .or(request.job_data.clone())
                .unwrap_or_default()
        });

        thread.set_var(vars::SUB_JOB_ID, Value::from(sub_job));

        job.generate_event(
            Event::new(job.id(), events::SUBJOB)
                .with("status", "start")
                .with("jobID", sub_job)
                .with("jobName", &state.name)
                .with("jobfile", request.job_file.clone().unwrap_or_default())
                .with(
                    "jobfilemachine",
                    request.file_machine.clone().unwrap_or_default(),
                )
                .with("function", request.function.clone().unwrap_or_default())
                .with("functionargs", request.args.clone().unwrap_or_default())
                .with("clearlogs", request.clear_logs)
                .with("logtcelapsedtime", request.log_tc_elapsed_time)
                .with("logtcnumstarts", request.log_tc_num_starts)
                .with("logtcstartstop", request.log_tc_start_stop)
                .with(
                    "hold",
                    request
                        .hold
                        .map(|d| d.as_millis().to_string())
                        .unwrap_or_default(),
                ),
        );
        tracing::debug!(job_id = job.id(), sub_job, "Sub-job started");

        match job.sub_job_map.with(|map| map.register(sub_job, me.clone())) {
            Ok(Registration::AlreadyCompleted(outcome)) => {
                self.record_outcome(&job, &mut state, outcome, true);
            }
            Ok(Registration::Registered) => state.rendezvous.external_started(),
            Err(e) => {
                tracing::warn!(job_id = job.id(), sub_job, error = %e, "Sub-job started for a job that is ending");
            }
        }

        if run_nested {
            if let Some(nested) = &self.definition.nested {
                match start_nested(
                    thread,
                    &nested.action,
                    &[(vars::SUB_JOB_ID, Value::from(sub_job))],
                    me as Arc<dyn ThreadCompleteListener>,
                ) {
                    Ok(child) => {
                        state.rendezvous.add_child(child.clone());
                        child.schedule();
                    }
                    Err(e) => thread.raise_signal(SignalKind::InternalError, e.to_string()),
                }
            }
        }

        if !state.rendezvous.is_ready() {
            thread.add_hold(&self.hold);
        }
    }

    fn record_outcome(&self, job: &Job, state: &mut JobActionState, outcome: JobOutcome, was_running: bool) {
        if was_running {
            job.generate_event(
                Event::new(job.id(), events::SUBJOB)
                    .with("status", "stop")
                    .with("jobID", state.sub_job)
                    .with("result", to_display_string(&outcome.result))
                    .with("jobStatus", outcome.status),
            );
        }
        tracing::debug!(job_id = job.id(), sub_job = state.sub_job, status = %outcome.status, "Sub-job ended");
        state.outcome = Some(outcome);
    }

    /// The sub-job has ended
    pub fn job_complete(&self, outcome: JobOutcome) {
        let mut state = self.lock();
        if state.phase == JobPhase::Complete {
            return;
        }
        let Some(thread) = state.thread.upgrade() else {
            return;
        };
        let Ok(job) = thread.job() else {
            return;
        };

        let was_running = state.rendezvous.external_finished();
        self.record_outcome(&job, &mut state, outcome, was_running);

        if state.rendezvous.is_ready() {
            drop(state);
            thread.remove_hold(&self.hold);
            thread.schedule();
        }
    }

    fn finish(&self, thread: &Arc<Thread>) {
        let (rc, result, outcome, sub_job) = {
            let mut state = self.lock();
            state.phase = JobPhase::Complete;
            (
                state.submit_rc,
                state.submit_result.clone(),
                state.outcome.take(),
                state.sub_job,
            )
        };

        if let Ok(job) = thread.job() {
            let _ = job.sub_job_map.with(|map| map.unregister(&sub_job));
        }

        let (result_value, status) = match outcome {
            Some(outcome) => (outcome.result, outcome.status),
            None => (Value::Null, JobStatus::Unknown),
        };

        thread.pop_action();
        thread.set_var(vars::RC, Value::from(rc.0));
        thread.set_var(vars::SUBSTRATE_RESULT, Value::String(result));
        thread.set_var(vars::RESULT, result_value);
        thread.set_var(vars::SUB_JOB_STATUS, Value::String(status.to_string()));
    }
}

impl Action for JobAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        let phase = self.lock().phase;

        match phase {
            JobPhase::Init => self.start(thread),
            JobPhase::Running => {
                if self.lock().rendezvous.is_ready() {
                    self.finish(thread);
                }
            }
            JobPhase::Complete => {
                thread.pop_action();
            }
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        let mut state = self.lock();

        if state.rendezvous.external_finished() {
            if let Ok(job) = thread.job() {
                let _ = job.sub_job_map.with(|map| map.unregister(&state.sub_job));
                job.substrate().submit_async_forget(
                    "local",
                    Request::TerminateJob {
                        job_id: state.sub_job,
                    },
                );
                job.generate_event(
                    Event::new(job.id(), events::SUBJOB)
                        .with("status", "stop")
                        .with("jobID", state.sub_job)
                        .with("result", "None"),
                );
            }
        }

        state.phase = JobPhase::Complete;
        if state.rendezvous.stop_children(thread, &self.hard_hold) {
            return;
        }
        drop(state);

        thread.remove_hold(&self.hold);
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        JobAction::new(self.definition.clone())
    }

    fn details(&self) -> String {
        let state = self.lock();
        format!("job {} ({:?})", state.sub_job, state.phase)
    }
}

impl ThreadCompleteListener for JobAction {
    fn thread_complete(&self, child: &Arc<Thread>, _end_code: ThreadEndCode) {
        let mut state = self.lock();
        if !state.rendezvous.child_finished(child.number()) {
            return;
        }

        let Some(thread) = state.thread.upgrade() else {
            return;
        };

        thread.remove_hold(&self.hard_hold);
        if state.phase == JobPhase::Running && !state.rendezvous.is_external_running() {
            thread.remove_hold(&self.hold);
        }
        drop(state);

        thread.schedule();
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
