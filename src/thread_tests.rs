use super::*;
use crate::actions::tests::helpers::{eventually, TestEngine};
use crate::config::Config;
use crate::job::handlers::default_handlers;
use crate::job::{JobDefinition, JobSettings};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Pushes its name to a shared log on every step until it runs out
struct LogAction {
    location: Location,
    name: &'static str,
    remaining: Mutex<usize>,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl LogAction {
    fn new(name: &'static str, steps: usize, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            location: Location::inline("log"),
            name,
            remaining: Mutex::new(steps),
            log,
        })
    }
}

impl Action for LogAction {
    fn location(&self) -> &Location {
        &self.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        self.log.lock().unwrap().push(self.name);
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            thread.pop_action();
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        LogAction::new(self.name, 1, self.log.clone())
    }
}

/// Waits under a soft hold until released or terminated
struct WaitAction {
    location: Location,
    hold: Hold,
    waiting: AtomicBool,
    terminated: AtomicBool,
}

impl WaitAction {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            location: Location::inline("wait"),
            hold: Hold::soft("wait"),
            waiting: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        })
    }
}

impl Action for WaitAction {
    fn location(&self) -> &Location {
        &self.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        if self.waiting.swap(true, Ordering::SeqCst) {
            thread.pop_action();
        } else {
            thread.add_hold(&self.hold);
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        self.terminated.store(true, Ordering::SeqCst);
        thread.remove_hold(&self.hold);
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        WaitAction::new()
    }
}

/// Occupies its worker until opened
struct GateAction {
    location: Location,
    entered: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

impl Action for GateAction {
    fn location(&self) -> &Location {
        &self.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        self.entered.store(true, Ordering::SeqCst);
        while !self.open.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        thread.pop_action();
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        Arc::new(GateAction {
            location: self.location.clone(),
            entered: self.entered.clone(),
            open: self.open.clone(),
        })
    }
}

fn test_job(engine: &TestEngine) -> Arc<Job> {
    Job::new(
        1000,
        JobDefinition::new("threads"),
        None,
        JobSettings::default(),
        engine.engine.services().clone(),
        default_handlers(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_soft_hold_parks_until_removed() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let thread = Thread::new(job.next_thread_number(), None, &job);

    let wait = WaitAction::new();
    thread.push_action(wait.clone());
    thread.schedule();

    eventually(|| thread.state() == ThreadState::Blocked).await;
    assert!(thread.has_hold(HoldKind::Soft));
    assert_eq!(thread.stack_depth(), 1);

    thread.remove_hold(&wait.hold);
    thread.schedule();

    eventually(|| thread.state() == ThreadState::Complete).await;
    assert_eq!(thread.end_code(), Some(ThreadEndCode::Normal));
    assert!(!wait.terminated.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hold_add_and_remove_are_idempotent() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let thread = Thread::new(job.next_thread_number(), None, &job);
    let hold = Hold::soft("twice");
    let other = Hold::soft("other");

    assert!(thread.add_hold(&hold));
    assert!(!thread.add_hold(&hold));
    assert!(thread.remove_hold(&hold));
    assert!(!thread.remove_hold(&hold));
    assert!(!thread.remove_hold(&other));
    assert!(!thread.has_hold(HoldKind::Soft));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_is_delivered_past_soft_hold() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let thread = Thread::new(job.next_thread_number(), None, &job);

    let wait = WaitAction::new();
    thread.push_action(wait.clone());
    thread.schedule();
    eventually(|| thread.state() == ThreadState::Blocked).await;

    thread.terminate(ThreadEndCode::Normal);

    eventually(|| thread.state() == ThreadState::Complete).await;
    assert!(wait.terminated.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hard_hold_blocks_terminate() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let thread = Thread::new(job.next_thread_number(), None, &job);

    let wait = WaitAction::new();
    let hard = Hold::hard("children");
    thread.push_action(wait.clone());
    thread.add_hold(&hard);
    thread.schedule();
    eventually(|| thread.state() == ThreadState::Blocked).await;

    thread.terminate(ThreadEndCode::Normal);
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(!wait.terminated.load(Ordering::SeqCst));
    assert!(thread.is_terminating());

    thread.remove_hold(&hard);
    thread.schedule();

    eventually(|| wait.terminated.load(Ordering::SeqCst)).await;
    eventually(|| thread.state() == ThreadState::Complete).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_cascades_to_children() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let root = Thread::new(job.next_thread_number(), None, &job);

    let first = root.create_child_thread().unwrap();
    let second = root.create_child_thread().unwrap();
    let waits = [WaitAction::new(), WaitAction::new()];
    first.push_action(waits[0].clone());
    second.push_action(waits[1].clone());
    first.schedule();
    second.schedule();
    root.schedule();

    eventually(|| first.state() == ThreadState::Blocked && second.state() == ThreadState::Blocked).await;
    assert_eq!(root.children().len(), 2);

    root.terminate(ThreadEndCode::Normal);

    eventually(|| root.state() == ThreadState::Complete).await;
    assert_eq!(first.end_code(), Some(ThreadEndCode::StoppedByParent));
    assert_eq!(second.end_code(), Some(ThreadEndCode::StoppedByParent));
    assert!(waits.iter().all(|wait| wait.terminated.load(Ordering::SeqCst)));
    assert!(root.children().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thread_yields_after_action_budget() {
    let mut config = Config::default();
    config.scheduler.workers = 1;
    config.scheduler.max_non_blocking_actions = 1;
    let engine = TestEngine::with_config(config);
    let job = test_job(&engine);
    let root = Thread::new(job.next_thread_number(), None, &job);

    // Keep the only worker busy until both threads are queued
    let entered = Arc::new(AtomicBool::new(false));
    let open = Arc::new(AtomicBool::new(false));
    let gate = root.create_child_thread().unwrap();
    gate.push_action(Arc::new(GateAction {
        location: Location::inline("gate"),
        entered: entered.clone(),
        open: open.clone(),
    }));
    gate.schedule();
    eventually(|| entered.load(Ordering::SeqCst)).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let a = root.create_child_thread().unwrap();
    let b = root.create_child_thread().unwrap();
    a.push_action(LogAction::new("a", 3, log.clone()));
    b.push_action(LogAction::new("b", 3, log.clone()));
    a.schedule();
    b.schedule();
    open.store(true, Ordering::SeqCst);

    eventually(|| log.lock().unwrap().len() == 6).await;
    let log = log.lock().unwrap().clone();
    assert_eq!(log, vec!["a", "b", "a", "b", "a", "b"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_gets_a_copy_of_variables() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let root = Thread::new(job.next_thread_number(), None, &job);
    root.set_var("x", Value::from(1));

    let child = root.create_child_thread().unwrap();
    assert_eq!(child.get_var("x"), Some(Value::from(1)));

    child.set_var("x", Value::from(2));
    assert_eq!(root.get_var("x"), Some(Value::from(1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_scope_is_discarded_on_pop() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let thread = Thread::new(job.next_thread_number(), None, &job);
    thread.set_var("x", Value::from(1));

    thread.push_scope(thread.variables());
    thread.set_var("x", Value::from(2));
    thread.set_var("y", Value::from(3));
    assert_eq!(thread.get_var("x"), Some(Value::from(2)));

    thread.pop_scope();
    assert_eq!(thread.get_var("x"), Some(Value::from(1)));
    assert_eq!(thread.get_var("y"), None);
    assert!(thread.pop_scope().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_raise_signal_records_message_and_event() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let thread = Thread::new(job.next_thread_number(), None, &job);

    thread.raise_signal(SignalKind::InvalidValue, "bad value");

    assert!(thread.has_signal(SignalKind::InvalidValue));
    assert_eq!(
        thread.get_var("InvalidValueMsg"),
        Some(Value::String("bad value".into()))
    );
    let raised: Vec<_> = engine
        .events
        .events()
        .into_iter()
        .filter(|event| event.event_type == events::SIGNAL)
        .collect();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].get("signal"), Some("InvalidValue"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_step_mode_resume_clears_request() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let thread = Thread::new(job.next_thread_number(), None, &job);

    thread.set_step_mode(StepMode::StepOver);
    assert_eq!(thread.step_mode(), Some(StepMode::StepOver));
    thread.set_step_mode(StepMode::Resume);
    assert_eq!(thread.step_mode(), None);

    thread.set_step_mode(StepMode::StepInto);
    assert_eq!(thread.clear_step_mode(), Some(StepMode::StepInto));
    assert_eq!(thread.clear_step_mode(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_testcase_stack_tracks_current_testcase() {
    let engine = TestEngine::new();
    let job = test_job(&engine);
    let thread = Thread::new(job.next_thread_number(), None, &job);

    thread.push_testcase("suite");
    thread.push_testcase("suite.case");
    assert_eq!(thread.current_testcase().as_deref(), Some("suite.case"));
    assert_eq!(thread.testcase_stack(), vec!["suite", "suite.case"]);

    thread.pop_testcase();
    assert_eq!(
        thread.get_var(vars::CURRENT_TESTCASE),
        Some(Value::String("suite".into()))
    );
}
