//! Breakpoints
//!
//! A breakpoint parks its thread under a soft hold until an operator resumes
//! it through [`Job::resume_breakpoint`](crate::job::Job::resume_breakpoint).
//! The breakpoint id is the thread number, so a thread has at most one.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::action::{Action, ActionDefinition};
use crate::condition::{Condition, Hold};
use crate::errors::Location;
use crate::job::events::{self, Event};
use crate::job::Job;
use crate::thread::{StepMode, Thread};
use crate::types::SignalKind;

#[derive(Debug, Clone)]
pub struct BreakpointDefinition {
    pub location: Location,
    pub if_expr: Option<String>,
    pub info: Option<String>,
}

impl BreakpointDefinition {
    pub fn new() -> Self {
        Self::at(Location::inline("breakpoint"))
    }

    pub fn at(location: Location) -> Self {
        Self {
            location,
            if_expr: None,
            info: None,
        }
    }

    pub fn when(mut self, if_expr: impl Into<String>) -> Self {
        self.if_expr = Some(if_expr.into());
        self
    }
}

impl Default for BreakpointDefinition {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionDefinition for BreakpointDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        BreakpointAction::new(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakpointPhase {
    Init,
    Waiting,
    Complete,
}

struct BreakpointState {
    phase: BreakpointPhase,
    thread: Weak<Thread>,
    id: u64,
}

pub struct BreakpointAction {
    definition: Arc<BreakpointDefinition>,
    me: Weak<BreakpointAction>,
    hold: Hold,
    state: Mutex<BreakpointState>,
}

impl BreakpointAction {
    pub fn new(definition: Arc<BreakpointDefinition>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            definition,
            me: me.clone(),
            hold: Hold::soft("Breakpoint"),
            state: Mutex::new(BreakpointState {
                phase: BreakpointPhase::Init,
                thread: Weak::new(),
                id: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BreakpointState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.lock().id
    }

    fn event(&self, job: &Job, id: u64, status: &str) -> Event {
        let location = &self.definition.location;
        Event::new(job.id(), events::BREAKPOINT)
            .with("status", status)
            .with("id", id)
            .with("lineNumber", location.line)
            .with("xmlFile", &location.file)
            .with("xmlMachine", &location.machine)
    }

    /// Release the thread, leaving `mode` as its step request
    pub fn resume(&self, mode: StepMode) {
        let mut state = self.lock();
        if state.phase != BreakpointPhase::Waiting {
            return;
        }
        state.phase = BreakpointPhase::Complete;

        let Some(thread) = state.thread.upgrade() else {
            return;
        };
        drop(state);

        thread.set_step_mode(mode);
        thread.remove_hold(&self.hold);
        thread.schedule();
    }

    fn stop(&self, thread: &Arc<Thread>) {
        let id = self.lock().id;
        if let Ok(job) = thread.job() {
            let _ = job.breakpoint_map.with(|map| map.remove(&id));
            job.generate_event(self.event(&job, id, "stop"));
        }
        thread.pop_action();
    }
}

impl Action for BreakpointAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        let phase = self.lock().phase;

        match phase {
            BreakpointPhase::Init => {
                if let Some(expr) = &self.definition.if_expr {
                    match thread.eval_bool(expr) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.lock().phase = BreakpointPhase::Complete;
                            thread.pop_action();
                            return;
                        }
                        Err(e) => {
                            self.lock().phase = BreakpointPhase::Complete;
                            thread.pop_action();
                            thread.raise_error(
                                SignalKind::EvaluationError,
                                &self.definition.location,
                                Some("if"),
                                &e.to_string(),
                            );
                            return;
                        }
                    }
                }

                let (Ok(job), Some(me)) = (thread.job(), self.me.upgrade()) else {
                    thread.pop_action();
                    return;
                };

                let id = thread.number();
                let mut state = self.lock();
                state.phase = BreakpointPhase::Waiting;
                state.thread = Arc::downgrade(thread);
                state.id = id;

                if let Err(e) = job.breakpoint_map.with(|map| map.insert(id, me)) {
                    state.phase = BreakpointPhase::Complete;
                    drop(state);
                    thread.pop_action();
                    thread.raise_signal(SignalKind::InternalError, e.to_string());
                    return;
                }

                thread.add_hold(&self.hold);
                drop(state);

                tracing::info!(job_id = job.id(), thread = id, "Thread stopped at breakpoint");
                job.generate_event(
                    self.event(&job, id, "start").with(
                        "info",
                        self.definition.info.as_deref().unwrap_or("breakpoint"),
                    ),
                );
            }
            BreakpointPhase::Complete => self.stop(thread),
            BreakpointPhase::Waiting => {}
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        self.lock().phase = BreakpointPhase::Complete;
        thread.remove_hold(&self.hold);
        self.stop(thread);
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        BreakpointAction::new(self.definition.clone())
    }

    fn details(&self) -> String {
        format!("Breakpoint: {}", self.lock().id)
    }
}

#[cfg(test)]
#[path = "breakpoint_tests.rs"]
mod tests;
