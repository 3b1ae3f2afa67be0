//! The engine: owner of every job and the shared services
//!
//! The engine creates jobs, keeps the registry of active ones and routes
//! inbound notifications to them. It is also the [`CompletionRouter`] of its
//! substrate, which is how sub-job requests become jobs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::Result;

use crate::config::Config;
use crate::documents::{load_document, DocumentSource, FileCache, LruFileCache};
use crate::errors::{EngineError, FetchError};
use crate::evaluator::{Evaluator, VariableEvaluator};
use crate::job::events::{EventSink, TracingEventSink};
use crate::job::handlers::{default_handlers, JobHandler};
use crate::job::{Job, JobCompleteListener, JobDefinition, JobOutcome, JobSettings, Services};
use crate::scheduler::Scheduler;
use crate::substrate::{CompletionRouter, LocalSubstrate, ProcessEnd, RequestResult, SubJobRequest, Substrate};
use crate::timer::{TimedEventListener, TimedEventQueue};
use crate::types::ResultCode;

/// Builder for an [`Engine`]; unset collaborators get local defaults
pub struct EngineBuilder {
    config: Config,
    substrate: Option<Arc<dyn Substrate>>,
    evaluator: Option<Arc<dyn Evaluator>>,
    events: Option<Arc<dyn EventSink>>,
    documents: Option<Arc<dyn DocumentSource>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            substrate: None,
            evaluator: None,
            events: None,
            documents: None,
        }
    }

    pub fn substrate(mut self, substrate: Arc<dyn Substrate>) -> Self {
        self.substrate = Some(substrate);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentSource>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Start the scheduler and timer on the current runtime and attach the
    /// engine to its substrate
    pub fn build(self) -> Arc<Engine> {
        let config = self.config;

        let file_cache = config
            .file_cache
            .enabled
            .then(|| Arc::new(LruFileCache::new(config.file_cache.capacity)) as Arc<dyn FileCache>);

        let services = Services {
            substrate: self
                .substrate
                .unwrap_or_else(|| Arc::new(LocalSubstrate::new("local"))),
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(VariableEvaluator::new())),
            events: self.events.unwrap_or_else(|| Arc::new(TracingEventSink)),
            documents: self.documents,
            file_cache,
            timer: TimedEventQueue::start(),
            scheduler: Scheduler::start(
                config.scheduler.workers,
                config.scheduler.max_non_blocking_actions,
            ),
            defaults: JobSettings::from_config(&config),
        };

        let engine = Arc::new_cyclic(|me| Engine {
            me: me.clone(),
            config,
            services,
            handlers: default_handlers(),
            next_job: AtomicU64::new(1),
            jobs: Mutex::new(BTreeMap::new()),
            definitions: RwLock::new(BTreeMap::new()),
        });

        let router: Weak<dyn CompletionRouter> = engine.me.clone();
        engine.services.substrate.attach_router(router);

        tracing::info!(
            workers = engine.config.scheduler.workers,
            "Engine started"
        );
        engine
    }
}

pub struct Engine {
    me: Weak<Engine>,
    config: Config,
    services: Services,
    handlers: Vec<Arc<dyn JobHandler>>,
    next_job: AtomicU64,
    jobs: Mutex<BTreeMap<u64, Arc<Job>>>,
    definitions: RwLock<BTreeMap<String, JobDefinition>>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Make a definition available to sub-jobs by name
    pub fn register_definition(&self, name: impl Into<String>, definition: JobDefinition) {
        if let Ok(mut definitions) = self.definitions.write() {
            definitions.insert(name.into(), definition);
        }
    }

    pub fn definition(&self, name: &str) -> Option<JobDefinition> {
        self.definitions
            .read()
            .ok()
            .and_then(|definitions| definitions.get(name).cloned())
    }

    pub fn job(&self, id: u64) -> Option<Arc<Job>> {
        self.jobs.lock().ok().and_then(|jobs| jobs.get(&id).cloned())
    }

    /// Ids of the jobs that have not completed
    pub fn job_ids(&self) -> Vec<u64> {
        self.jobs
            .lock()
            .map(|jobs| jobs.keys().copied().collect())
            .unwrap_or_default()
    }

    fn create_job(&self, definition: JobDefinition, parent: Option<u64>, settings: JobSettings) -> Arc<Job> {
        let id = self.next_job.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(
            id,
            definition,
            parent,
            settings,
            self.services.clone(),
            self.handlers.clone(),
        );

        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(id, job.clone());
        }
        job.add_completion_listener(Arc::new(JobEndRouter {
            engine: self.me.clone(),
            job_id: id,
        }));

        tracing::debug!(job_id = id, parent = parent.unwrap_or(0), name = %job.name(), "Job created");
        job
    }

    /// Create a top-level job and start it
    pub fn start_job(&self, definition: JobDefinition) -> Arc<Job> {
        let job = self.create_job(definition, None, self.services.defaults.clone());
        job.start();
        job
    }

    /// Start a top-level job and wait for it to complete
    pub async fn run_job(&self, definition: JobDefinition) -> JobOutcome {
        let job = self.start_job(definition);
        job.wait().await
    }

    /// Start a job that was created held
    pub fn release_job(&self, job_id: u64) -> Result<(), EngineError> {
        let job = self
            .job(job_id)
            .ok_or_else(|| EngineError::DoesNotExist(format!("Job {}", job_id)))?;
        tracing::info!(job_id, "Releasing held job");
        job.start();
        Ok(())
    }

    pub fn terminate_job(&self, job_id: u64) -> Result<(), EngineError> {
        let job = self
            .job(job_id)
            .ok_or_else(|| EngineError::DoesNotExist(format!("Job {}", job_id)))?;
        job.terminate()
    }

    /// A process of `job_id` has ended
    pub fn process_ended(&self, job_id: u64, end: ProcessEnd) {
        match self.job(job_id) {
            Some(job) => job.process_ended(end),
            None => {
                tracing::debug!(job_id, handle = %end.handle, "Process end for a job that no longer exists");
            }
        }
    }

    /// A job has completed; unregister it and tell its parent
    pub fn job_ended(&self, job_id: u64, outcome: JobOutcome) {
        let job = self.jobs.lock().ok().and_then(|mut jobs| jobs.remove(&job_id));

        let Some(parent_id) = job.and_then(|job| job.parent_job()) else {
            return;
        };
        let Some(parent) = self.job(parent_id) else {
            tracing::debug!(job_id, parent = parent_id, "Parent job ended before its sub-job");
            return;
        };

        // Delivered off the caller's stack: the caller may hold action state
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { parent.sub_job_ended(outcome) });
            }
            Err(_) => parent.sub_job_ended(outcome),
        }
    }

    fn sub_job_definition(&self, request: &SubJobRequest) -> Result<JobDefinition, RequestResult> {
        let mut definition = if let Some(file) = &request.job_file {
            let machine = request.file_machine.as_deref().unwrap_or("local");
            let source = self.services.documents.as_deref().ok_or_else(|| {
                RequestResult::failed(ResultCode::DOES_NOT_EXIST, "No document source is configured")
            })?;
            let document = load_document(source, self.services.file_cache.as_deref(), machine, file)
                .map_err(|e| {
                    let rc = match &e {
                        FetchError::Copy { rc, .. } => *rc,
                        FetchError::NoResponse { .. } => ResultCode::NO_RESPONSE,
                        FetchError::Parse { .. } => ResultCode::INVALID_REQUEST_STRING,
                    };
                    RequestResult::failed(rc, e.to_string())
                })?;
            JobDefinition::from_document(&document)
        } else if let Some(name) = &request.job_data {
            self.definition(name).ok_or_else(|| {
                RequestResult::failed(
                    ResultCode::DOES_NOT_EXIST,
                    format!("Job definition does not exist: {}", name),
                )
            })?
        } else {
            return Err(RequestResult::failed(
                ResultCode::INVALID_REQUEST_STRING,
                "Either a job file or job data is required",
            ));
        };

        if !request.script_files.is_empty() {
            return Err(RequestResult::failed(
                ResultCode::INVALID_REQUEST_STRING,
                "Script files are not supported",
            ));
        }

        if let Some(name) = &request.name {
            definition.name = name.clone();
        }
        if let Some(function) = &request.function {
            definition.default_function = Some(function.clone());
        }
        if let Some(args) = &request.args {
            definition.default_args = Some(args.clone());
        }
        for script in &request.scripts {
            let (name, expr) = script.split_once('=').ok_or_else(|| {
                RequestResult::failed(
                    ResultCode::INVALID_REQUEST_STRING,
                    format!("Invalid script, expected name = expression: {}", script),
                )
            })?;
            definition
                .scripts
                .push((name.trim().to_string(), expr.trim().to_string()));
        }

        Ok(definition)
    }

    /// Stop the scheduler workers and the timer task
    pub fn shutdown(&self) {
        tracing::info!(active_jobs = self.job_ids().len(), "Engine shutting down");
        self.services.scheduler.shutdown();
        self.services.timer.end();
    }
}

impl CompletionRouter for Engine {
    fn process_ended(&self, job_id: u64, end: ProcessEnd) {
        Engine::process_ended(self, job_id, end);
    }

    fn execute_job(&self, request: &SubJobRequest) -> RequestResult {
        let definition = match self.sub_job_definition(request) {
            Ok(definition) => definition,
            Err(result) => return result,
        };

        let settings = JobSettings {
            clear_logs: request.clear_logs,
            log_tc_elapsed_time: request.log_tc_elapsed_time,
            log_tc_num_starts: request.log_tc_num_starts,
            log_tc_start_stop: request.log_tc_start_stop,
            ..self.services.defaults.clone()
        };

        let job = self.create_job(definition, Some(request.parent_job), settings);

        match request.hold {
            None => job.start(),
            Some(duration) if duration.is_zero() => {
                tracing::info!(job_id = job.id(), "Sub-job held until released");
            }
            Some(duration) => {
                tracing::info!(job_id = job.id(), hold_ms = duration.as_millis() as u64, "Sub-job held");
                self.services.timer.add(
                    duration,
                    Arc::new(JobRelease {
                        engine: self.me.clone(),
                        job_id: job.id(),
                    }),
                );
            }
        }

        RequestResult::Ok(job.id().to_string())
    }

    fn terminate_job(&self, job_id: u64) -> RequestResult {
        match Engine::terminate_job(self, job_id) {
            Ok(()) => RequestResult::Ok(String::new()),
            Err(EngineError::DoesNotExist(what)) => {
                RequestResult::failed(ResultCode::DOES_NOT_EXIST, format!("{} does not exist", what))
            }
            Err(e) => RequestResult::failed(ResultCode::INVALID_REQUEST_STRING, e.to_string()),
        }
    }
}

/// Tells the engine that one of its jobs has completed
struct JobEndRouter {
    engine: Weak<Engine>,
    job_id: u64,
}

impl JobCompleteListener for JobEndRouter {
    fn job_complete(&self, outcome: &JobOutcome) {
        if let Some(engine) = self.engine.upgrade() {
            engine.job_ended(self.job_id, outcome.clone());
        }
    }
}

/// Releases a held sub-job when its hold expires
struct JobRelease {
    engine: Weak<Engine>,
    job_id: u64,
}

impl TimedEventListener for JobRelease {
    fn timed_event_occurred(&self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Err(e) = engine.release_job(self.job_id) {
            tracing::debug!(job_id = self.job_id, error = %e, "Held job could not be released");
        }
    }
}

/// Load the configuration and build an engine with local collaborators
pub fn start_local(config_path: Option<std::path::PathBuf>) -> Result<Arc<Engine>> {
    let config = Config::builder().config_path(config_path).build()?;
    Ok(Engine::builder(config).build())
}
