//! Testcase and testcase status actions

use std::sync::{Arc, Mutex, MutexGuard};

use crate::action::{instantiate, Action, ActionDef, ActionDefinition};
use crate::condition::Condition;
use crate::errors::Location;
use crate::testcase::{TestcaseMode, TestcaseStatus};
use crate::thread::Thread;
use crate::timestamp::Timestamp;
use crate::types::SignalKind;

#[derive(Clone)]
pub struct TestcaseDefinition {
    pub location: Location,
    pub name: String,
    pub mode: Option<String>,
    pub body: Option<ActionDef>,
}

impl TestcaseDefinition {
    pub fn new(name: impl Into<String>, body: ActionDef) -> Self {
        Self {
            location: Location::inline("testcase"),
            name: name.into(),
            mode: None,
            body: Some(body),
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }
}

impl std::fmt::Debug for TestcaseDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestcaseDefinition")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ActionDefinition for TestcaseDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        Arc::new(TestcaseAction {
            definition: self,
            state: Mutex::new(None),
        })
    }
}

/// A testcase that has been entered
struct Entered {
    name: String,
    started: Timestamp,
}

pub struct TestcaseAction {
    definition: Arc<TestcaseDefinition>,
    state: Mutex<Option<Entered>>,
}

impl TestcaseAction {
    fn lock(&self) -> MutexGuard<'_, Option<Entered>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, thread: &Arc<Thread>) {
        let location = &self.definition.location;

        let name = match thread.eval_string(&self.definition.name) {
            Ok(name) => name,
            Err(e) => {
                thread.pop_action();
                thread.raise_error(SignalKind::EvaluationError, location, Some("name"), &e.to_string());
                return;
            }
        };

        let mode = match &self.definition.mode {
            None => TestcaseMode::Default,
            Some(expr) => match thread.eval_string(expr) {
                Ok(value) => value.parse().unwrap_or_else(|_| {
                    thread.raise_error(
                        SignalKind::InvalidTestcaseMode,
                        location,
                        Some("mode"),
                        &format!("Invalid mode: {}", value),
                    );
                    TestcaseMode::Default
                }),
                Err(e) => {
                    thread.pop_action();
                    thread.raise_error(SignalKind::EvaluationError, location, Some("mode"), &e.to_string());
                    return;
                }
            },
        };

        let full_name = match thread.current_testcase() {
            Some(parent) => format!("{}.{}", parent, name),
            None => name,
        };

        let Ok(job) = thread.job() else {
            thread.pop_action();
            return;
        };

        if let Err(e) = job
            .testcases()
            .enter(&job, &full_name, mode, thread.testcase_stack())
        {
            thread.pop_action();
            thread.raise_signal(SignalKind::InternalError, e.to_string());
            return;
        }

        thread.push_testcase(full_name.clone());
        *self.lock() = Some(Entered {
            name: full_name,
            started: Timestamp::now(),
        });

        if let Some(body) = &self.definition.body {
            thread.push_action(instantiate(body));
        }
    }

    fn exit(&self, thread: &Arc<Thread>) {
        thread.pop_action();

        let Some(entered) = self.lock().take() else {
            return;
        };

        thread.pop_testcase();
        if let Ok(job) = thread.job() {
            if let Err(e) = job.testcases().exit(&job, &entered.name, &entered.started) {
                tracing::warn!(job_id = job.id(), testcase = %entered.name, error = %e, "Failed to stop testcase");
            }
        }
    }
}

impl Action for TestcaseAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        let entered = self.lock().is_some();
        if entered {
            self.exit(thread);
        } else {
            self.enter(thread);
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        self.exit(thread);
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        self.definition.clone().instantiate()
    }

    fn details(&self) -> String {
        format!("testcase {}", self.definition.name)
    }
}

#[derive(Debug, Clone)]
pub struct TestcaseStatusDefinition {
    pub location: Location,
    pub status: String,
    pub message: Option<String>,
}

impl TestcaseStatusDefinition {
    pub fn new(status: impl Into<String>, message: Option<&str>) -> Self {
        Self {
            location: Location::inline("tcstatus"),
            status: status.into(),
            message: message.map(str::to_string),
        }
    }
}

impl ActionDefinition for TestcaseStatusDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        Arc::new(TestcaseStatusAction { definition: self })
    }
}

pub struct TestcaseStatusAction {
    definition: Arc<TestcaseStatusDefinition>,
}

impl Action for TestcaseStatusAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        thread.pop_action();
        let location = &self.definition.location;

        let status = match thread.eval_string(&self.definition.status) {
            Ok(status) => status,
            Err(e) => {
                thread.raise_error(SignalKind::EvaluationError, location, Some("result"), &e.to_string());
                return;
            }
        };
        let message = match thread.eval_opt_string(self.definition.message.as_deref()) {
            Ok(message) => message.unwrap_or_default(),
            Err(e) => {
                thread.raise_error(SignalKind::EvaluationError, location, None, &e.to_string());
                return;
            }
        };

        let Some(testcase) = thread.current_testcase() else {
            thread.raise_error(
                SignalKind::NoTestcaseActive,
                location,
                None,
                "No testcase is active on this thread",
            );
            return;
        };

        let Ok(status) = status.parse::<TestcaseStatus>() else {
            thread.raise_error(
                SignalKind::InvalidValue,
                location,
                Some("result"),
                &format!("Invalid result: {}", status),
            );
            return;
        };

        let Ok(job) = thread.job() else {
            return;
        };
        if let Err(e) = job
            .testcases()
            .update_status(&job, &testcase, status, &message, true, None)
        {
            thread.raise_signal(SignalKind::InternalError, e.to_string());
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        self.definition.clone().instantiate()
    }
}

#[cfg(test)]
#[path = "testcase_tests.rs"]
mod tests;
