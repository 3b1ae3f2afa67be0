//! Logical threads
//!
//! A thread owns an action stack, a condition set, a variable scope stack and
//! a set of child threads. It is driven by the scheduler: each run pops
//! nothing by itself but repeatedly asks its condition set what to do and
//! calls into the top action. Actions are always called without the thread
//! lock held, so they are free to push, pop, add holds or schedule.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::action::Action;
use crate::condition::{Condition, ConditionSet, Hold, HoldKind, Next};
use crate::errors::{format_error, EngineError, EvalError, Location};
use crate::evaluator::{self, Scope};
use crate::job::events::{self, Event};
use crate::job::Job;
use crate::types::{vars, SignalKind, ThreadEndCode, Value};

/// Receives a callback once a thread has finished
pub trait ThreadCompleteListener: Send + Sync {
    fn thread_complete(&self, thread: &Arc<Thread>, end_code: ThreadEndCode);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Init,
    Runnable,
    Running,
    Blocked,
    Complete,
}

/// How a thread continues after a breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Resume,
    StepInto,
    StepOver,
}

/// A signal raised on a thread by a failing action
#[derive(Debug, Clone, PartialEq)]
pub struct RaisedSignal {
    pub kind: SignalKind,
    pub message: String,
}

struct ThreadInner {
    state: ThreadState,
    actions: Vec<Arc<dyn Action>>,
    conditions: ConditionSet,
    scopes: Vec<Scope>,
    children: BTreeMap<u64, Arc<Thread>>,
    listeners: Vec<Arc<dyn ThreadCompleteListener>>,
    end_code: Option<ThreadEndCode>,
    signals: Vec<RaisedSignal>,
    testcases: Vec<String>,
    step_mode: Option<StepMode>,
}

enum Step {
    Stop,
    Yield,
    Run(Arc<dyn Action>, Option<Condition>),
    StopChildren(Vec<Arc<Thread>>),
    Finish(Vec<Arc<dyn ThreadCompleteListener>>, ThreadEndCode),
}

pub struct Thread {
    number: u64,
    parent: Option<Weak<Thread>>,
    job: Weak<Job>,
    me: Weak<Thread>,
    inner: Mutex<ThreadInner>,
}

impl Thread {
    pub(crate) fn new(number: u64, parent: Option<&Arc<Thread>>, job: &Arc<Job>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            number,
            parent: parent.map(Arc::downgrade),
            job: Arc::downgrade(job),
            me: me.clone(),
            inner: Mutex::new(ThreadInner {
                state: ThreadState::Init,
                actions: Vec::new(),
                conditions: ConditionSet::new(),
                scopes: vec![Scope::new()],
                children: BTreeMap::new(),
                listeners: Vec::new(),
                end_code: None,
                signals: Vec::new(),
                testcases: Vec::new(),
                step_mode: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ThreadInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn parent(&self) -> Option<Arc<Thread>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn job(&self) -> Result<Arc<Job>, EngineError> {
        self.job
            .upgrade()
            .ok_or_else(|| EngineError::DoesNotExist(format!("Job for thread {}", self.number)))
    }

    pub fn job_id(&self) -> u64 {
        self.job.upgrade().map(|job| job.id()).unwrap_or(0)
    }

    pub fn state(&self) -> ThreadState {
        self.lock().state
    }

    pub fn end_code(&self) -> Option<ThreadEndCode> {
        self.lock().end_code
    }

    // Action stack

    pub fn push_action(&self, action: Arc<dyn Action>) {
        self.lock().actions.push(action);
    }

    pub fn pop_action(&self) -> Option<Arc<dyn Action>> {
        self.lock().actions.pop()
    }

    pub fn stack_depth(&self) -> usize {
        self.lock().actions.len()
    }

    /// Description of the action on top of the stack
    pub fn current_action(&self) -> Option<String> {
        self.lock().actions.last().map(|action| action.details())
    }

    // Holds and conditions

    pub fn add_hold(&self, hold: &Hold) -> bool {
        self.lock().conditions.add_hold(hold)
    }

    pub fn remove_hold(&self, hold: &Hold) -> bool {
        self.lock().conditions.remove_hold(hold)
    }

    pub fn has_hold(&self, kind: HoldKind) -> bool {
        self.lock().conditions.has_hold(kind)
    }

    pub fn raise_condition(&self, condition: Condition) -> bool {
        self.lock().conditions.raise(condition)
    }

    pub fn remove_condition(&self, condition: &Condition) -> bool {
        self.lock().conditions.remove(condition)
    }

    pub fn remove_conditions_where(&self, predicate: impl Fn(&Condition) -> bool) -> usize {
        self.lock().conditions.remove_where(predicate)
    }

    pub fn is_terminating(&self) -> bool {
        self.lock()
            .conditions
            .has_pending(|condition| *condition == Condition::Terminate)
    }

    // Scheduling

    /// Make a new or blocked thread runnable and hand it to the scheduler
    ///
    /// Redundant calls while the thread is already queued or running are
    /// no-ops; a running thread re-reads its conditions before every step.
    pub fn schedule(&self) {
        let first = {
            let mut inner = self.lock();
            match inner.state {
                ThreadState::Init => {
                    inner.state = ThreadState::Runnable;
                    true
                }
                ThreadState::Blocked => {
                    inner.state = ThreadState::Runnable;
                    false
                }
                _ => return,
            }
        };

        let (Ok(job), Some(me)) = (self.job(), self.me.upgrade()) else {
            return;
        };

        if first {
            job.generate_event(
                Event::new(job.id(), events::THREAD)
                    .with("status", "start")
                    .with("thread", self.number)
                    .with("parent", self.parent().map(|p| p.number()).unwrap_or(0)),
            );
        }

        job.scheduler().enqueue(me);
    }

    /// Run up to `max_actions` steps, then yield back to the scheduler
    pub fn run(self: &Arc<Self>, max_actions: usize) {
        {
            let mut inner = self.lock();
            if inner.state != ThreadState::Runnable {
                return;
            }
            inner.state = ThreadState::Running;
        }

        let mut steps = 0usize;

        loop {
            let step = self.next_step(steps >= max_actions);

            match step {
                Step::Stop => return,
                Step::Yield => {
                    tracing::trace!(thread = self.number, steps, "Thread yielding");
                    if let Ok(job) = self.job() {
                        job.scheduler().enqueue(self.clone());
                    }
                    return;
                }
                Step::Run(action, Some(condition)) => {
                    steps += 1;
                    action.handle_condition(self, &condition);
                }
                Step::Run(action, None) => {
                    steps += 1;
                    action.execute(self);
                }
                Step::StopChildren(children) => {
                    for child in children {
                        child.terminate(ThreadEndCode::StoppedByParent);
                    }
                    return;
                }
                Step::Finish(listeners, end_code) => {
                    self.finish(listeners, end_code);
                    return;
                }
            }
        }
    }

    fn next_step(&self, budget_spent: bool) -> Step {
        let mut inner = self.lock();

        if let Next::Blocked(_) = inner.conditions.next() {
            inner.state = ThreadState::Blocked;
            return Step::Stop;
        }

        if inner.actions.is_empty() {
            if !inner.children.is_empty() {
                inner.state = ThreadState::Blocked;
                if inner
                    .conditions
                    .has_pending(|condition| *condition == Condition::Terminate)
                {
                    return Step::StopChildren(inner.children.values().cloned().collect());
                }
                return Step::Stop;
            }

            inner.state = ThreadState::Complete;
            let end_code = *inner.end_code.get_or_insert(ThreadEndCode::Normal);
            return Step::Finish(std::mem::take(&mut inner.listeners), end_code);
        }

        if budget_spent {
            inner.state = ThreadState::Runnable;
            return Step::Yield;
        }

        let top = inner.actions.last().cloned();
        match (top, inner.conditions.next()) {
            (Some(action), Next::Deliver(condition)) => Step::Run(action, Some(condition)),
            (Some(action), _) => Step::Run(action, None),
            (None, _) => Step::Stop,
        }
    }

    fn finish(self: &Arc<Self>, listeners: Vec<Arc<dyn ThreadCompleteListener>>, end_code: ThreadEndCode) {
        tracing::debug!(thread = self.number, ?end_code, "Thread complete");

        let job = self.job().ok();
        if let Some(job) = &job {
            job.generate_event(
                Event::new(job.id(), events::THREAD)
                    .with("status", "stop")
                    .with("thread", self.number),
            );
            job.remove_thread(self.number);
        }

        for listener in listeners {
            listener.thread_complete(self, end_code);
        }

        if self.parent.is_none() {
            if let Some(job) = job {
                job.root_thread_complete(self);
            }
        }
    }

    /// Ask the thread to unwind; the top action receives a terminate condition
    pub fn terminate(&self, end_code: ThreadEndCode) {
        {
            let mut inner = self.lock();
            if inner.state == ThreadState::Complete {
                return;
            }
            inner.end_code.get_or_insert(end_code);
            inner.conditions.raise(Condition::Terminate);
        }
        self.schedule();
    }

    // Children

    /// Create a child thread that inherits this thread's variables
    ///
    /// The caller pushes the child's first action and schedules it.
    pub fn create_child_thread(self: &Arc<Self>) -> Result<Arc<Thread>, EngineError> {
        let job = self.job()?;
        let child = Thread::new(job.next_thread_number(), Some(self), &job);

        let (scope, testcases) = {
            let inner = self.lock();
            (
                inner.scopes.last().cloned().unwrap_or_default(),
                inner.testcases.clone(),
            )
        };
        {
            let mut child_inner = child.lock();
            child_inner.scopes = vec![scope];
            child_inner.testcases = testcases;
        }

        child.add_completion_listener(self.clone());
        self.lock().children.insert(child.number, child.clone());
        job.add_thread(&child);

        Ok(child)
    }

    pub fn add_completion_listener(&self, listener: Arc<dyn ThreadCompleteListener>) {
        self.lock().listeners.push(listener);
    }

    pub fn children(&self) -> Vec<Arc<Thread>> {
        self.lock().children.values().cloned().collect()
    }

    // Variables

    pub fn set_var(&self, name: impl Into<String>, value: Value) {
        let mut inner = self.lock();
        if let Some(scope) = inner.scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.lock()
            .scopes
            .last()
            .and_then(|scope| scope.get(name).cloned())
    }

    pub fn remove_var(&self, name: &str) -> Option<Value> {
        self.lock()
            .scopes
            .last_mut()
            .and_then(|scope| scope.remove(name))
    }

    /// Snapshot of the variables currently in scope
    pub fn variables(&self) -> Scope {
        self.lock().scopes.last().cloned().unwrap_or_default()
    }

    pub fn push_scope(&self, scope: Scope) {
        self.lock().scopes.push(scope);
    }

    /// Pop a scope; the outermost scope is never removed
    pub fn pop_scope(&self) -> Option<Scope> {
        let mut inner = self.lock();
        if inner.scopes.len() > 1 {
            inner.scopes.pop()
        } else {
            None
        }
    }

    // Evaluation

    pub fn eval_value(&self, expr: &str) -> Result<Value, EvalError> {
        let scope = self.variables();
        let job = self.job().map_err(|e| EvalError::Invalid {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        job.evaluator().evaluate(expr, &scope)
    }

    pub fn eval_string(&self, expr: &str) -> Result<String, EvalError> {
        self.eval_value(expr).map(|value| evaluator::to_display_string(&value))
    }

    pub fn eval_bool(&self, expr: &str) -> Result<bool, EvalError> {
        self.eval_value(expr).map(|value| evaluator::to_bool(&value))
    }

    pub fn eval_list(&self, expr: &str) -> Result<Vec<Value>, EvalError> {
        self.eval_value(expr).map(evaluator::to_list)
    }

    /// Evaluate an optional attribute; a missing attribute is `None`
    pub fn eval_opt_string(&self, expr: Option<&str>) -> Result<Option<String>, EvalError> {
        expr.map(|expr| self.eval_string(expr)).transpose()
    }

    // Signals

    /// Record a signal, set its message variable and report it
    pub fn raise_signal(&self, kind: SignalKind, message: impl Into<String>) {
        let message = message.into();

        {
            let mut inner = self.lock();
            if let Some(scope) = inner.scopes.last_mut() {
                scope.insert(kind.message_var(), Value::String(message.clone()));
            }
            inner.signals.push(RaisedSignal {
                kind,
                message: message.clone(),
            });
        }

        tracing::warn!(thread = self.number, signal = %kind, "{}", message);

        if let Ok(job) = self.job() {
            job.record_signal();
            job.generate_event(
                Event::new(job.id(), events::SIGNAL)
                    .with("signal", kind)
                    .with("thread", self.number)
                    .with("message", &message),
            );
        }
    }

    /// Raise a signal whose message points at the failing element
    pub fn raise_error(
        &self,
        kind: SignalKind,
        location: &Location,
        attribute: Option<&str>,
        message: &str,
    ) {
        self.raise_signal(kind, format_error(location, attribute, message));
    }

    pub fn signals(&self) -> Vec<RaisedSignal> {
        self.lock().signals.clone()
    }

    pub fn has_signal(&self, kind: SignalKind) -> bool {
        self.lock().signals.iter().any(|signal| signal.kind == kind)
    }

    // Testcases and breakpoints

    pub fn current_testcase(&self) -> Option<String> {
        self.lock().testcases.last().cloned()
    }

    /// Testcases entered on this thread, outermost first
    pub fn testcase_stack(&self) -> Vec<String> {
        self.lock().testcases.clone()
    }

    pub fn push_testcase(&self, name: impl Into<String>) {
        let name = name.into();
        let mut inner = self.lock();
        if let Some(scope) = inner.scopes.last_mut() {
            scope.insert(vars::CURRENT_TESTCASE.to_string(), Value::String(name.clone()));
        }
        inner.testcases.push(name);
    }

    pub fn pop_testcase(&self) -> Option<String> {
        let mut inner = self.lock();
        let popped = inner.testcases.pop();
        let current = inner
            .testcases
            .last()
            .map(|name| Value::String(name.clone()))
            .unwrap_or(Value::Null);
        if let Some(scope) = inner.scopes.last_mut() {
            scope.insert(vars::CURRENT_TESTCASE.to_string(), current);
        }
        popped
    }

    pub fn step_mode(&self) -> Option<StepMode> {
        self.lock().step_mode
    }

    pub fn set_step_mode(&self, mode: StepMode) {
        self.lock().step_mode = match mode {
            StepMode::Resume => None,
            mode => Some(mode),
        };
    }

    /// Take the pending step request, if any
    pub fn clear_step_mode(&self) -> Option<StepMode> {
        self.lock().step_mode.take()
    }
}

impl ThreadCompleteListener for Thread {
    fn thread_complete(&self, thread: &Arc<Thread>, _end_code: ThreadEndCode) {
        let reschedule = {
            let mut inner = self.lock();
            inner.children.remove(&thread.number());
            inner.children.is_empty() && inner.state == ThreadState::Blocked
        };

        if reschedule {
            self.schedule();
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("number", &self.number)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
#[path = "thread_tests.rs"]
mod tests;
