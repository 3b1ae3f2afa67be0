//! Job lifecycle hooks
//!
//! Each handler owns one family of job-scoped structures: it installs them
//! when the job is created and tears them down when the job ends. Handlers
//! are torn down in reverse order of installation.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::Job;
use crate::correlation::CorrelationMap;
use crate::substrate::Request;

pub trait JobHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn init_job(&self, job: &Job);

    fn terminate_job(&self, job: &Job);
}

/// Process correlation and running-process index
#[derive(Debug, Default)]
pub struct ProcessHandler;

impl JobHandler for ProcessHandler {
    fn name(&self) -> &'static str {
        "process"
    }

    fn init_job(&self, job: &Job) {
        job.process_map.install(CorrelationMap::new());
        job.process_request_map.install(BTreeMap::new());
    }

    fn terminate_job(&self, job: &Job) {
        if let Some(running) = job.process_request_map.teardown() {
            for (key, action) in running {
                tracing::warn!(job_id = job.id(), process = %key, "Stopping process left running by job");
                let (machine, handle) = action.target();
                job.substrate().submit_async_forget(
                    &machine,
                    Request::StopProcess {
                        handle: handle.clone(),
                    },
                );
                job.substrate()
                    .submit_async_forget(&machine, Request::FreeProcess { handle });
            }
        }
        job.process_map.teardown();
    }
}

/// Sub-job correlation
#[derive(Debug, Default)]
pub struct SubJobHandler;

impl JobHandler for SubJobHandler {
    fn name(&self) -> &'static str {
        "subjob"
    }

    fn init_job(&self, job: &Job) {
        job.sub_job_map.install(CorrelationMap::new());
    }

    fn terminate_job(&self, job: &Job) {
        let waiting = job
            .sub_job_map
            .with(|map| map.waiting_keys())
            .unwrap_or_default();

        for sub_job in waiting {
            tracing::warn!(job_id = job.id(), sub_job, "Terminating sub-job left running by job");
            job.substrate()
                .submit_async_forget("local", Request::TerminateJob { job_id: sub_job });
        }
        job.sub_job_map.teardown();
    }
}

/// Testcase registry
#[derive(Debug, Default)]
pub struct TestcaseHandler;

impl JobHandler for TestcaseHandler {
    fn name(&self) -> &'static str {
        "testcase"
    }

    fn init_job(&self, job: &Job) {
        job.testcases().install();
    }

    fn terminate_job(&self, job: &Job) {
        job.testcases().stop_active(job);
        job.testcases().log_summary(job);
        job.testcases().teardown();
    }
}

/// Threads stopped at breakpoints
#[derive(Debug, Default)]
pub struct BreakpointHandler;

impl JobHandler for BreakpointHandler {
    fn name(&self) -> &'static str {
        "breakpoint"
    }

    fn init_job(&self, job: &Job) {
        job.breakpoint_map.install(BTreeMap::new());
    }

    fn terminate_job(&self, job: &Job) {
        job.breakpoint_map.teardown();
    }
}

pub fn default_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(ProcessHandler),
        Arc::new(SubJobHandler),
        Arc::new(TestcaseHandler),
        Arc::new(BreakpointHandler),
    ]
}
