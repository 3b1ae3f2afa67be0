//! Testcase bookkeeping
//!
//! Testcases are counters keyed by dotted name. They are started and stopped
//! either by testcase actions on a thread or by external callers using a key,
//! and every change is reported as a testcase event.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::correlation::SharedMap;
use crate::errors::EngineError;
use crate::job::events::{self, Event};
use crate::job::Job;
use crate::timestamp::{format_elapsed, Timestamp};

pub const PENDING_ELAPSED: &str = "<Pending>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestcaseMode {
    Default,
    Strict,
}

impl FromStr for TestcaseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(TestcaseMode::Default),
            "strict" => Ok(TestcaseMode::Strict),
            other => Err(format!(
                "Invalid testcase mode: {}.  Mode must be 'default' or 'strict'.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestcaseStatus {
    Pass,
    Fail,
    Info,
}

impl FromStr for TestcaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pass" => Ok(TestcaseStatus::Pass),
            "fail" => Ok(TestcaseStatus::Fail),
            "info" => Ok(TestcaseStatus::Info),
            other => Err(format!(
                "Invalid testcase status: {}.  Status must be 'pass', 'fail' or 'info'.",
                other
            )),
        }
    }
}

impl fmt::Display for TestcaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestcaseStatus::Pass => "pass",
            TestcaseStatus::Fail => "fail",
            TestcaseStatus::Info => "info",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Testcase {
    pub name: String,
    pub mode: TestcaseMode,
    /// Names of the enclosing testcases, outermost first
    pub stack: Vec<String>,
    pub num_pass: u32,
    pub num_fail: u32,
    pub last_status: Option<TestcaseStatus>,
    pub last_message: String,
    pub elapsed: Option<Duration>,
    pub num_starts: u32,
    pub num_stops: u32,
    pub started: Timestamp,
    pub last_status_timestamp: Option<Timestamp>,
}

impl Testcase {
    pub fn new(name: impl Into<String>, mode: TestcaseMode, stack: Vec<String>) -> Self {
        Self {
            name: name.into(),
            mode,
            stack,
            num_pass: 0,
            num_fail: 0,
            last_status: None,
            last_message: String::new(),
            elapsed: None,
            num_starts: 0,
            num_stops: 0,
            started: Timestamp::now(),
            last_status_timestamp: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.num_starts > self.num_stops
    }

    pub fn elapsed_display(&self) -> String {
        self.elapsed
            .map(format_elapsed)
            .unwrap_or_else(|| PENDING_ELAPSED.to_string())
    }

    fn update(&mut self, status: TestcaseStatus, message: &str) {
        match status {
            TestcaseStatus::Pass => self.num_pass += 1,
            TestcaseStatus::Fail => self.num_fail += 1,
            TestcaseStatus::Info => {}
        }
        self.last_status = Some(status);
        if !message.is_empty() {
            self.last_message = message.to_string();
        }
        self.last_status_timestamp = Some(Timestamp::now());
    }

    /// Commit the time since `started` and count the stop
    fn stop(&mut self, started: &Timestamp) -> Duration {
        self.num_stops += 1;
        let elapsed = started.elapsed();
        self.elapsed = Some(self.elapsed.unwrap_or_default() + elapsed);
        elapsed
    }

    fn has_updates(&self) -> bool {
        self.num_pass > 0 || self.num_fail > 0 || !self.last_message.is_empty()
    }

    fn event(&self, job_id: u64, event_type: &str, status: &str) -> Event {
        Event::new(job_id, event_type)
            .with("name", &self.name)
            .with("status", status)
            .with("status-pass", self.num_pass)
            .with("status-fail", self.num_fail)
            .with(
                "laststatus",
                self.last_status.map(|s| s.to_string()).unwrap_or_default(),
            )
            .with("elapsed-time", self.elapsed_display())
            .with("num-starts", self.num_starts)
            .with("startedTimestamp", self.started.timestamp_string())
    }
}

/// A testcase started by an external caller
#[derive(Debug, Clone)]
struct ActiveTestcase {
    key: Option<String>,
    started: Timestamp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestcaseTotals {
    pub testcases: usize,
    pub pass: u32,
    pub fail: u32,
}

/// Testcases of one job, plus the ones started externally and still active
pub struct TestcaseRegistry {
    testcases: SharedMap<BTreeMap<String, Testcase>>,
    active: SharedMap<BTreeMap<String, ActiveTestcase>>,
}

impl Default for TestcaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TestcaseRegistry {
    pub fn new() -> Self {
        Self {
            testcases: SharedMap::new("testcaseMap"),
            active: SharedMap::new("testcaseActiveMap"),
        }
    }

    pub(crate) fn install(&self) {
        self.testcases.install(BTreeMap::new());
        self.active.install(BTreeMap::new());
    }

    pub(crate) fn teardown(&self) {
        self.active.teardown();
        self.testcases.teardown();
    }

    /// Enter a testcase from a thread, creating it or upgrading its mode
    pub fn enter(
        &self,
        job: &Job,
        name: &str,
        mode: TestcaseMode,
        stack: Vec<String>,
    ) -> Result<(), EngineError> {
        let event = self.testcases.with(|map| {
            let testcase = map
                .entry(name.to_string())
                .or_insert_with(|| Testcase::new(name, mode, stack));
            if mode == TestcaseMode::Strict {
                testcase.mode = TestcaseMode::Strict;
            }
            testcase.num_starts += 1;

            (testcase.mode == TestcaseMode::Strict)
                .then(|| testcase.event(job.id(), events::TESTCASE, "begin"))
        })?;

        if job.settings().log_tc_start_stop {
            tracing::info!(job_id = job.id(), "Testcase: {} started", name);
        }
        if let Some(event) = event {
            job.generate_event(event);
        }
        Ok(())
    }

    /// Leave a testcase entered at `started`
    pub fn exit(&self, job: &Job, name: &str, started: &Timestamp) -> Result<(), EngineError> {
        let (elapsed, event) = self.testcases.with(|map| {
            let testcase = map
                .get_mut(name)
                .ok_or_else(|| EngineError::DoesNotExist(format!("Testcase {}", name)))?;
            let elapsed = testcase.stop(started);

            let event = (testcase.mode == TestcaseMode::Strict || testcase.has_updates())
                .then(|| testcase.event(job.id(), events::TESTCASE, "end"));
            Ok::<_, EngineError>((elapsed, event))
        })??;

        if job.settings().log_tc_start_stop {
            tracing::info!(
                job_id = job.id(),
                "Testcase: {}, ElapsedTime: {}",
                name,
                format_elapsed(elapsed)
            );
        }
        if let Some(event) = event {
            job.generate_event(event);
        }
        Ok(())
    }

    /// Record a status for a testcase
    ///
    /// An unknown testcase is an error unless `force` is set, in which case it
    /// is created under `parent` (which must exist when given).
    pub fn update_status(
        &self,
        job: &Job,
        name: &str,
        status: TestcaseStatus,
        message: &str,
        force: bool,
        parent: Option<&str>,
    ) -> Result<(), EngineError> {
        let event = self.testcases.with(|map| {
            if !map.contains_key(name) {
                if !force {
                    return Err(EngineError::DoesNotExist(format!("Testcase {}", name)));
                }
                let stack = Self::stack_under(map, name, parent)?;
                map.insert(
                    name.to_string(),
                    Testcase::new(name, TestcaseMode::Default, stack),
                );
            }

            let testcase = map
                .get_mut(name)
                .ok_or_else(|| EngineError::DoesNotExist(format!("Testcase {}", name)))?;
            testcase.update(status, message);

            let mut event = testcase
                .event(job.id(), events::TESTCASE_STATUS, "update")
                .with("message", message);
            if let Some(at) = &testcase.last_status_timestamp {
                event = event.with("lastStatusTimestamp", at.timestamp_string());
            }
            Ok((event, testcase.num_pass, testcase.num_fail))
        })??;

        let (event, pass, fail) = event;
        job.generate_event(event);

        if !message.is_empty() && status != TestcaseStatus::Info {
            tracing::info!(
                job_id = job.id(),
                status = %status,
                "Testcase: {}, Pass: {}, Fail: {}, Last Status: {}, Message: {}",
                name,
                pass,
                fail,
                status,
                message
            );
        }
        Ok(())
    }

    fn stack_under(
        map: &BTreeMap<String, Testcase>,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Vec<String>, EngineError> {
        let Some(parent) = parent else {
            return Ok(Vec::new());
        };

        if !name.starts_with(&format!("{}.", parent)) {
            return Err(EngineError::Invalid(format!(
                "Testcase {} is not a child of parent testcase {}",
                name, parent
            )));
        }

        let parent_case = map
            .get(parent)
            .ok_or_else(|| EngineError::DoesNotExist(format!("Parent testcase {}", parent)))?;
        let mut stack = parent_case.stack.clone();
        stack.push(parent.to_string());
        Ok(stack)
    }

    /// Start a testcase on behalf of an external caller
    pub fn start(&self, job: &Job, name: &str, key: Option<String>) -> Result<(), EngineError> {
        self.active.with(|active| {
            if active.contains_key(name) {
                return Err(EngineError::Invalid(format!(
                    "Testcase {} is already running",
                    name
                )));
            }
            active.insert(
                name.to_string(),
                ActiveTestcase {
                    key,
                    started: Timestamp::now(),
                },
            );
            Ok(())
        })??;

        self.enter(job, name, TestcaseMode::Default, Vec::new())
    }

    /// Stop an externally started testcase; the key must match the start
    pub fn stop(&self, job: &Job, name: &str, key: Option<&str>) -> Result<(), EngineError> {
        let started = self.active.with(|active| {
            let entry = active
                .get(name)
                .ok_or_else(|| EngineError::DoesNotExist(format!("Testcase {}", name)))?;
            if entry.key.is_some() && entry.key.as_deref() != key {
                return Err(EngineError::Invalid(format!(
                    "The key specified for testcase {} does not match the key used to start it",
                    name
                )));
            }
            let started = entry.started;
            active.remove(name);
            Ok(started)
        })??;

        self.exit(job, name, &started)
    }

    /// Stop every externally started testcase; used while a job terminates
    pub fn stop_active(&self, job: &Job) {
        let active = match self.active.with(std::mem::take) {
            Ok(active) => active,
            Err(_) => return,
        };

        for (name, entry) in active {
            if let Err(e) = self.exit(job, &name, &entry.started) {
                tracing::warn!(job_id = job.id(), testcase = %name, error = %e, "Failed to stop testcase");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Testcase> {
        self.testcases
            .with(|map| map.get(name).cloned())
            .ok()
            .flatten()
    }

    pub fn list(&self) -> Vec<Testcase> {
        self.testcases
            .with(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn totals(&self) -> TestcaseTotals {
        self.list()
            .iter()
            .fold(TestcaseTotals::default(), |mut totals, testcase| {
                totals.testcases += 1;
                totals.pass += testcase.num_pass;
                totals.fail += testcase.num_fail;
                totals
            })
    }

    /// Log one line per testcase and the totals
    pub fn log_summary(&self, job: &Job) {
        let settings = job.settings();

        for testcase in self.list() {
            let mut line = format!(
                "Testcase: {}, Pass: {}, Fail: {}",
                testcase.name, testcase.num_pass, testcase.num_fail
            );
            if settings.log_tc_elapsed_time {
                line.push_str(&format!(", ElapsedTime: {}", testcase.elapsed_display()));
            }
            if settings.log_tc_num_starts {
                line.push_str(&format!(", NumStarts: {}", testcase.num_starts));
            }
            tracing::info!(job_id = job.id(), "{}", line);
        }

        let totals = self.totals();
        tracing::info!(
            job_id = job.id(),
            "Testcase Totals: Tests: {}, Pass: {}, Fail: {}",
            totals.testcases,
            totals.pass,
            totals.fail
        );
    }
}
