//! Jobs
//!
//! A job is one running instance of a workflow. It owns its threads, the
//! function table and the job-scoped correlation maps through which
//! asynchronous completions find the action waiting for them.

pub mod events;
pub mod handlers;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::action::ActionDefinition;
use crate::actions::breakpoint::BreakpointAction;
use crate::actions::function::{CallDefinition, FunctionDefinition};
use crate::actions::job::JobAction;
use crate::actions::process::ProcessAction;
use crate::config::Config;
use crate::correlation::{CorrelationMap, Delivery, SharedMap};
use crate::documents::{DocumentSource, FileCache, FunctionDocument};
use crate::errors::{EngineError, Location, INLINE_DATA};
use crate::evaluator::Evaluator;
use crate::scheduler::Scheduler;
use crate::substrate::{ProcessEnd, Request, Substrate};
use crate::testcase::TestcaseRegistry;
use crate::thread::{StepMode, Thread};
use crate::timer::TimedEventQueue;
use crate::types::{vars, JobState, JobStatus, ThreadEndCode, Value};

use self::events::{Event, EventSink};
use self::handlers::JobHandler;

/// Per-job options that actions and bookkeeping consult
#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub clear_logs: bool,
    pub log_tc_elapsed_time: bool,
    pub log_tc_num_starts: bool,
    pub log_tc_start_stop: bool,
    pub process_start_timeout: Duration,
    pub use_notify_key: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            clear_logs: false,
            log_tc_elapsed_time: true,
            log_tc_num_starts: true,
            log_tc_start_stop: false,
            process_start_timeout: Duration::from_secs(60),
            use_notify_key: true,
        }
    }
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            clear_logs: false,
            log_tc_elapsed_time: config.testcase.log_elapsed_time,
            log_tc_num_starts: config.testcase.log_num_starts,
            log_tc_start_stop: config.testcase.log_start_stop,
            process_start_timeout: Duration::from_millis(config.process.start_timeout_ms),
            use_notify_key: config.process.use_notify_key,
        }
    }
}

/// Collaborators shared by every job of an engine
#[derive(Clone)]
pub struct Services {
    pub substrate: Arc<dyn Substrate>,
    pub evaluator: Arc<dyn Evaluator>,
    pub events: Arc<dyn EventSink>,
    pub documents: Option<Arc<dyn DocumentSource>>,
    pub file_cache: Option<Arc<dyn FileCache>>,
    pub timer: TimedEventQueue,
    pub scheduler: Scheduler,
    /// Engine-wide settings that sub-jobs fall back to for `default`
    pub defaults: JobSettings,
}

/// What a job runs: its functions and the call that starts it
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub machine: String,
    pub file: String,
    pub functions: BTreeMap<String, Arc<FunctionDefinition>>,
    pub default_function: Option<String>,
    /// Expression passed as the single argument of the default call
    pub default_args: Option<String>,
    /// Variables set on the root thread before the default call, as
    /// `(name, expression)`
    pub scripts: Vec<(String, String)>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            machine: "local".to_string(),
            file: INLINE_DATA.to_string(),
            functions: BTreeMap::new(),
            default_function: None,
            default_args: None,
            scripts: Vec::new(),
        }
    }

    pub fn from_document(document: &FunctionDocument) -> Self {
        Self {
            name: document.file.clone(),
            machine: document.machine.clone(),
            file: document.file.clone(),
            functions: document.functions.clone(),
            default_function: document.default_function.clone(),
            ..Self::new(document.file.clone())
        }
    }

    pub fn with_function(mut self, function: FunctionDefinition) -> Self {
        self.functions
            .insert(function.name.clone(), Arc::new(function));
        self
    }

    pub fn with_default_call(mut self, function: impl Into<String>, args: Option<&str>) -> Self {
        self.default_function = Some(function.into());
        self.default_args = args.map(str::to_string);
        self
    }

    pub fn with_script(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.scripts.push((name.into(), expr.into()));
        self
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: u64,
    pub status: JobStatus,
    pub result: Value,
}

/// Receives the outcome once a job has finished
pub trait JobCompleteListener: Send + Sync {
    fn job_complete(&self, outcome: &JobOutcome);
}

type ProcessMap = CorrelationMap<String, ProcessAction, ProcessEnd>;
type SubJobMap = CorrelationMap<u64, JobAction, JobOutcome>;

pub struct Job {
    id: u64,
    name: String,
    definition: JobDefinition,
    parent_job: Option<u64>,
    settings: JobSettings,
    services: Services,
    handlers: Vec<Arc<dyn JobHandler>>,

    state: Mutex<JobState>,
    terminate_requested: AtomicBool,
    signal_raised: AtomicBool,

    next_thread: AtomicU64,
    next_process_key: AtomicU64,
    threads: Mutex<BTreeMap<u64, Arc<Thread>>>,
    root: OnceLock<Arc<Thread>>,
    functions: RwLock<BTreeMap<String, Arc<FunctionDefinition>>>,

    pub(crate) process_map: SharedMap<ProcessMap>,
    pub(crate) process_request_map: SharedMap<BTreeMap<String, Arc<ProcessAction>>>,
    pub(crate) sub_job_map: SharedMap<SubJobMap>,
    pub(crate) breakpoint_map: SharedMap<BTreeMap<u64, Arc<BreakpointAction>>>,
    testcases: TestcaseRegistry,

    outcome: watch::Sender<Option<JobOutcome>>,
    listeners: Mutex<Vec<Arc<dyn JobCompleteListener>>>,
}

impl Job {
    /// Create a job and run every handler's `init_job`
    pub fn new(
        id: u64,
        definition: JobDefinition,
        parent_job: Option<u64>,
        settings: JobSettings,
        services: Services,
        handlers: Vec<Arc<dyn JobHandler>>,
    ) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);

        let job = Arc::new(Self {
            id,
            name: definition.name.clone(),
            functions: RwLock::new(definition.functions.clone()),
            definition,
            parent_job,
            settings,
            services,
            handlers,
            state: Mutex::new(JobState::Pending),
            terminate_requested: AtomicBool::new(false),
            signal_raised: AtomicBool::new(false),
            next_thread: AtomicU64::new(1),
            next_process_key: AtomicU64::new(1),
            threads: Mutex::new(BTreeMap::new()),
            root: OnceLock::new(),
            process_map: SharedMap::new("processMap"),
            process_request_map: SharedMap::new("processRequestMap"),
            sub_job_map: SharedMap::new("subJobMap"),
            breakpoint_map: SharedMap::new("breakpointMap"),
            testcases: TestcaseRegistry::new(),
            outcome,
            listeners: Mutex::new(Vec::new()),
        });

        for handler in &job.handlers {
            tracing::trace!(job_id = id, handler = handler.name(), "Initializing job handler");
            handler.init_job(&job);
        }

        job
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_job(&self) -> Option<u64> {
        self.parent_job
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.services.substrate
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.services.evaluator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.services.scheduler
    }

    pub fn timer(&self) -> &TimedEventQueue {
        &self.services.timer
    }

    pub fn testcases(&self) -> &TestcaseRegistry {
        &self.testcases
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> JobState {
        *self.lock_state()
    }

    pub fn generate_event(&self, event: Event) {
        self.services.events.generate_event(event);
    }

    pub(crate) fn record_signal(&self) {
        self.signal_raised.store(true, Ordering::SeqCst);
    }

    // Threads

    pub fn next_thread_number(&self) -> u64 {
        self.next_thread.fetch_add(1, Ordering::SeqCst)
    }

    /// Key used to correlate a process end with the action that started it
    pub fn next_process_key(&self) -> String {
        self.next_process_key.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub(crate) fn add_thread(&self, thread: &Arc<Thread>) {
        if let Ok(mut threads) = self.threads.lock() {
            threads.insert(thread.number(), thread.clone());
        }
    }

    pub(crate) fn remove_thread(&self, number: u64) {
        if let Ok(mut threads) = self.threads.lock() {
            threads.remove(&number);
        }
    }

    pub fn thread(&self, number: u64) -> Option<Arc<Thread>> {
        self.threads
            .lock()
            .ok()
            .and_then(|threads| threads.get(&number).cloned())
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads
            .lock()
            .map(|threads| threads.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn root_thread(&self) -> Option<Arc<Thread>> {
        self.root.get().cloned()
    }

    // Functions

    pub fn function(&self, name: &str) -> Option<Arc<FunctionDefinition>> {
        self.functions
            .read()
            .ok()
            .and_then(|functions| functions.get(name).cloned())
    }

    pub fn function_exists(&self, name: &str) -> bool {
        self.functions
            .read()
            .map(|functions| functions.contains_key(name))
            .unwrap_or(false)
    }

    /// Add or replace a function
    pub fn add_function(&self, function: Arc<FunctionDefinition>) {
        if let Ok(mut functions) = self.functions.write() {
            functions.insert(function.name.clone(), function);
        }
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions
            .read()
            .map(|functions| functions.keys().cloned().collect())
            .unwrap_or_default()
    }

    // Lifecycle

    /// Create the root thread, set the job's variables and run the default
    /// function
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if *state != JobState::Pending {
                return;
            }
            *state = JobState::Running;
        }

        tracing::info!(job_id = self.id, name = %self.name, "Job started");
        self.generate_event(
            Event::new(self.id, events::JOB)
                .with("status", "begin")
                .with("name", &self.name)
                .with("parent", self.parent_job.unwrap_or(0)),
        );

        let root = Thread::new(self.next_thread_number(), None, self);
        let _ = self.root.set(root.clone());
        self.add_thread(&root);

        root.set_var(vars::CURRENT_FILE, Value::String(self.definition.file.clone()));
        root.set_var(
            vars::CURRENT_MACHINE,
            Value::String(self.definition.machine.clone()),
        );
        root.set_var(vars::CURRENT_FUNCTION, Value::Null);
        root.set_var(vars::RESULT, Value::Null);

        for (name, expr) in &self.definition.scripts {
            match root.eval_value(expr) {
                Ok(value) => root.set_var(name.clone(), value),
                Err(e) => root.raise_error(
                    crate::types::SignalKind::EvaluationError,
                    &Location::new("script", &self.definition.file, &self.definition.machine, 0),
                    None,
                    &format!("{} = {}\n\n{}", name, expr, e),
                ),
            }
        }

        if let Some(function) = &self.definition.default_function {
            let call = CallDefinition::single(
                format!("'{}'", function),
                self.definition.default_args.clone(),
            )
            .at(Location::new(
                "call",
                &self.definition.file,
                &self.definition.machine,
                0,
            ));
            root.push_action(Arc::new(call).instantiate());
        }

        root.schedule();
    }

    /// Ask every thread of the job to unwind
    pub fn terminate(&self) -> Result<(), EngineError> {
        let previous = {
            let mut state = self.lock_state();
            let previous = *state;
            match previous {
                JobState::Running => *state = JobState::Terminating,
                JobState::Pending => {}
                JobState::Terminating => return Ok(()),
                JobState::Complete => return Err(EngineError::JobNotRunning(self.id)),
            }
            previous
        };

        self.terminate_requested.store(true, Ordering::SeqCst);

        // A held job never started, so there is no thread to unwind
        if previous == JobState::Pending {
            self.finish(Value::Null);
            return Ok(());
        }

        tracing::info!(job_id = self.id, "Job terminating");

        if let Some(root) = self.root_thread() {
            root.terminate(ThreadEndCode::Normal);
        }
        Ok(())
    }

    pub(crate) fn root_thread_complete(&self, root: &Arc<Thread>) {
        let result = root.get_var(vars::RESULT).unwrap_or(Value::Null);
        self.finish(result);
    }

    fn finish(&self, result: Value) {
        {
            let mut state = self.lock_state();
            if *state == JobState::Complete {
                return;
            }
            *state = JobState::Complete;
        }

        let status = if self.terminate_requested.load(Ordering::SeqCst) {
            JobStatus::Terminated
        } else if self.signal_raised.load(Ordering::SeqCst) {
            JobStatus::Abnormal
        } else {
            JobStatus::Normal
        };

        for handler in self.handlers.iter().rev() {
            handler.terminate_job(self);
        }

        tracing::info!(job_id = self.id, name = %self.name, %status, "Job complete");
        self.generate_event(
            Event::new(self.id, events::JOB)
                .with("status", "end")
                .with("name", &self.name)
                .with("result", crate::evaluator::to_display_string(&result))
                .with("jobStatus", status),
        );

        let outcome = JobOutcome {
            job_id: self.id,
            status,
            result,
        };
        self.outcome.send_replace(Some(outcome.clone()));

        let listeners = self
            .listeners
            .lock()
            .map(|mut listeners| std::mem::take(&mut *listeners))
            .unwrap_or_default();
        for listener in listeners {
            listener.job_complete(&outcome);
        }
    }

    /// Call `listener` once the job is complete, right away if it already is
    pub fn add_completion_listener(&self, listener: Arc<dyn JobCompleteListener>) {
        let done = self.outcome.borrow().clone();
        match done {
            Some(outcome) => listener.job_complete(&outcome),
            None => {
                if let Ok(mut listeners) = self.listeners.lock() {
                    listeners.push(listener);
                }
            }
        }
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the job to complete
    pub async fn wait(&self) -> JobOutcome {
        let mut receiver = self.outcome.subscribe();
        loop {
            if let Some(outcome) = receiver.borrow_and_update().clone() {
                return outcome;
            }
            if receiver.changed().await.is_err() {
                return JobOutcome {
                    job_id: self.id,
                    status: JobStatus::Unknown,
                    result: Value::Null,
                };
            }
        }
    }

    // Inbound notifications

    /// A process started by this job has ended
    pub fn process_ended(&self, end: ProcessEnd) {
        let key = end.correlation_key();

        match self.process_map.with(|map| map.complete(key.clone(), end)) {
            Ok(Delivery::Waiter(action, end)) => action.process_complete(end),
            Ok(Delivery::Parked) => {
                tracing::trace!(job_id = self.id, key = %key, "Process end parked until its action registers");
            }
            Ok(Delivery::Dropped) => {
                tracing::debug!(job_id = self.id, key = %key, "Process end for an action that stopped waiting");
            }
            Err(e) => {
                tracing::debug!(job_id = self.id, key = %key, error = %e, "Process end for finished job");
            }
        }
    }

    /// A sub-job started by this job has ended
    pub fn sub_job_ended(&self, outcome: JobOutcome) {
        let key = outcome.job_id;

        match self.sub_job_map.with(|map| map.complete(key, outcome)) {
            Ok(Delivery::Waiter(action, outcome)) => action.job_complete(outcome),
            Ok(Delivery::Parked) => {
                tracing::trace!(job_id = self.id, sub_job = key, "Sub-job end parked until its action registers");
            }
            Ok(Delivery::Dropped) => {
                tracing::debug!(job_id = self.id, sub_job = key, "Sub-job end for an action that stopped waiting");
            }
            Err(e) => {
                tracing::debug!(job_id = self.id, sub_job = key, error = %e, "Sub-job end for finished job");
            }
        }
    }

    /// Stop a running process on behalf of an operator
    pub fn stop_process(&self, machine: &str, handle: &str) -> Result<(), EngineError> {
        let key = crate::substrate::request_key(machine, handle);
        let found = self.process_request_map.with(|map| map.contains_key(&key))?;
        if !found {
            return Err(EngineError::DoesNotExist(format!(
                "Process {} on machine {}",
                handle, machine
            )));
        }

        let result = self.substrate().submit_sync(
            machine,
            Request::StopProcess {
                handle: handle.to_string(),
            },
        );
        if !result.rc().is_ok() {
            return Err(EngineError::Invalid(result.message()));
        }
        Ok(())
    }

    /// Release a thread stopped at a breakpoint
    pub fn resume_breakpoint(&self, thread: u64, mode: StepMode) -> Result<(), EngineError> {
        let action = self
            .breakpoint_map
            .with(|map| map.remove(&thread))?
            .ok_or_else(|| EngineError::DoesNotExist(format!("Breakpoint for thread {}", thread)))?;
        action.resume(mode);
        Ok(())
    }

    /// Threads currently stopped at a breakpoint
    pub fn breakpoints(&self) -> Vec<u64> {
        self.breakpoint_map
            .with(|map| map.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
