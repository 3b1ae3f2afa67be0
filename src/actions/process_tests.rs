use super::*;
use crate::actions::breakpoint::BreakpointDefinition;
use crate::actions::sequence::{AssignDefinition, ReturnDefinition, SequenceDefinition};
use crate::actions::tests::helpers::{eventually, main_job, StartReply, TestEngine};
use crate::thread::StepMode;
use crate::types::JobStatus;
use serde_json::json;
use std::time::Duration;

fn process(command: &str) -> ProcessDefinition {
    ProcessDefinition::new("'local'", format!("'{}'", command))
}

/// Run the process, then return its RC from `main`
fn returning_rc(process: ProcessDefinition) -> ActionDef {
    Arc::new(SequenceDefinition::new(vec![
        Arc::new(process),
        Arc::new(ReturnDefinition::new(Some("RC"))),
    ]))
}

fn signal_message(thread: &Thread, kind: SignalKind) -> String {
    thread
        .signals()
        .into_iter()
        .find(|signal| signal.kind == kind)
        .map(|signal| signal.message)
        .unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_process_end_sets_rc() {
    let engine = TestEngine::new();
    engine.substrate.reply("build", StartReply::ends_after(10, 3));

    let outcome = engine.run(main_job(returning_rc(process("build")))).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(3));

    let starts = engine.substrate.start_requests();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].command, "build");
    assert!(starts[0].notify_key.is_some());

    assert_eq!(engine.events.with_status(events::PROCESS, "start").len(), 1);
    let stops = engine.events.with_status(events::PROCESS, "stop");
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].get("rc"), Some("3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_submit_raises_start_error() {
    let engine = TestEngine::new();
    engine
        .substrate
        .reply("build", StartReply::Reject(ResultCode(10), "busy".into()));

    let job = engine.start(main_job(Arc::new(process("build"))));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    let root = job.root_thread().unwrap();
    assert_eq!(root.get_var(vars::RC), Some(json!(10)));
    assert_eq!(root.get_var(vars::SUBSTRATE_RESULT), Some(json!("busy")));
    assert!(signal_message(&root, SignalKind::ProcessStartError)
        .contains("Error submitting the request to start process on machine local.  RC: 10, Result: busy"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_request_raises_start_error() {
    let engine = TestEngine::new();
    engine
        .substrate
        .reply("build", StartReply::Fail(ResultCode(16), "gone".into()));

    let job = engine.start(main_job(Arc::new(process("build"))));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    let root = job.root_thread().unwrap();
    assert_eq!(root.get_var(vars::RC), Some(json!(16)));
    assert_eq!(root.get_var(vars::SUBSTRATE_RESULT), Some(json!("gone")));
    assert!(signal_message(&root, SignalKind::ProcessStartError)
        .contains("Error starting process on machine local.  RC: 16, Result: gone"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unanswered_start_times_out() {
    let engine = TestEngine::with_start_timeout(50);
    engine.substrate.reply("build", StartReply::Silent);

    let job = engine.start(main_job(Arc::new(process("build"))));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    let root = job.root_thread().unwrap();
    assert_eq!(root.get_var(vars::RC), Some(json!(ResultCode::TIMEOUT.0)));
    assert_eq!(
        root.get_var(vars::SUBSTRATE_RESULT),
        Some(json!("Process did not start within timeout value 50"))
    );
    assert!(signal_message(&root, SignalKind::ProcessStartTimeout).contains("Machine: local"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_notify_key_retries_once_without_it() {
    let engine = TestEngine::new();
    engine.substrate.reply("build", StartReply::Unsupported);
    engine.substrate.reply("build", StartReply::ends_after(10, 0));

    let outcome = engine.run(main_job(returning_rc(process("build")))).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(0));

    let starts = engine.substrate.start_requests();
    assert_eq!(starts.len(), 2);
    assert!(starts[0].notify_key.is_some());
    assert!(starts[1].notify_key.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_key_requested_when_target_lacks_support() {
    let engine = TestEngine::new();
    engine.substrate.without_notify_key();

    let outcome = engine.run(main_job(returning_rc(process("build")))).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    let starts = engine.substrate.start_requests();
    assert_eq!(starts.len(), 1);
    assert!(starts[0].notify_key.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_stops_running_process() {
    let engine = TestEngine::new();
    engine.substrate.reply("serve", StartReply::runs());

    let job = engine.start(main_job(Arc::new(process("serve"))));
    eventually(|| !engine.substrate.running_handles().is_empty()).await;

    engine.engine.terminate_job(job.id()).unwrap();
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Terminated);
    assert_eq!(engine.substrate.stops(), vec!["1".to_string()]);
    eventually(|| engine.substrate.running_handles().is_empty()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_operator_stop_ends_process() {
    let engine = TestEngine::new();
    engine.substrate.reply("serve", StartReply::runs());

    let job = engine.start(main_job(returning_rc(process("serve"))));
    eventually(|| !engine.substrate.running_handles().is_empty()).await;

    assert!(job.stop_process("LOCAL", "2").is_err());
    job.stop_process("LOCAL", "1").unwrap();
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(-1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_waits_for_both_process_and_nested_action() {
    let engine = TestEngine::new();
    engine.substrate.reply("build", StartReply::ends_after(1, 0));

    let definition = process("build").with_nested(Arc::new(BreakpointDefinition::new()));
    let job = engine.start(main_job(returning_rc(definition)));

    eventually(|| !job.breakpoints().is_empty()).await;
    eventually(|| engine.substrate.running_handles().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(job.outcome().is_none());

    let stopped = job.breakpoints()[0];
    let child = job.thread(stopped).unwrap();
    assert_eq!(child.get_var(vars::PROCESS_HANDLE), Some(json!("1")));

    job.resume_breakpoint(stopped, StepMode::Resume).unwrap();
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nested_action_runs_when_end_precedes_start_reply() {
    let engine = TestEngine::new();
    engine.substrate.reply("build", StartReply::EndsBeforeAck(4));

    let definition = process("build").with_nested(Arc::new(BreakpointDefinition::new()));
    let job = engine.start(main_job(returning_rc(definition)));

    eventually(|| !job.breakpoints().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(job.outcome().is_none());
    assert_eq!(engine.events.with_status(events::BREAKPOINT, "start").len(), 1);

    let stopped = job.breakpoints()[0];
    assert_eq!(
        job.thread(stopped).unwrap().get_var(vars::PROCESS_HANDLE),
        Some(json!("1"))
    );

    job.resume_breakpoint(stopped, StepMode::Resume).unwrap();
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(4));
    assert_eq!(engine.events.with_status(events::BREAKPOINT, "start").len(), 1);
    assert_eq!(engine.substrate.frees(), vec!["1".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_process_outlives_nested_action() {
    let engine = TestEngine::new();
    engine.substrate.reply("serve", StartReply::runs());

    let definition = process("serve").with_nested(Arc::new(AssignDefinition::new("seen", "ProcessHandle")));
    let job = engine.start(main_job(returning_rc(definition)));

    eventually(|| !engine.substrate.running_handles().is_empty()).await;
    eventually(|| job.threads().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(job.outcome().is_none());

    assert!(engine.substrate.end_process("1", 5));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_reply_after_timeout_is_released() {
    let engine = TestEngine::with_start_timeout(30);
    engine
        .substrate
        .reply("build", StartReply::LateAck(Duration::from_millis(200)));

    let job = engine.start(main_job(Arc::new(process("build"))));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    let root = job.root_thread().unwrap();
    assert_eq!(root.get_var(vars::RC), Some(json!(ResultCode::TIMEOUT.0)));

    eventually(|| engine.substrate.running_handles().is_empty()).await;
    assert_eq!(engine.substrate.stops(), vec!["1".to_string()]);
    assert_eq!(engine.substrate.frees(), vec!["1".to_string()]);
    assert!(engine.events.with_status(events::PROCESS, "start").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_with_nested_action_waiting() {
    let engine = TestEngine::new();
    engine.substrate.reply("serve", StartReply::runs());

    let definition = process("serve").with_nested(Arc::new(BreakpointDefinition::new()));
    let job = engine.start(main_job(Arc::new(definition)));

    eventually(|| !job.breakpoints().is_empty()).await;
    assert_eq!(engine.substrate.running_handles(), vec!["1".to_string()]);

    engine.engine.terminate_job(job.id()).unwrap();
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Terminated);
    assert!(job.breakpoints().is_empty());
    assert_eq!(engine.substrate.stops(), vec!["1".to_string()]);
    eventually(|| engine.substrate.running_handles().is_empty()).await;
}

#[test]
fn test_definition_debug_shows_nested_action() {
    let definition = process("build").with_nested(Arc::new(BreakpointDefinition::new()));
    let text = format!("{:?}", definition);
    assert!(text.contains("ActionDefinition"));
    assert!(text.contains("breakpoint"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_attribute_raises_evaluation_error() {
    let engine = TestEngine::new();

    let job = engine.start(main_job(Arc::new(ProcessDefinition::new(
        "'local'",
        "missing_var",
    ))));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    let root = job.root_thread().unwrap();
    assert!(signal_message(&root, SignalKind::EvaluationError).contains("attribute \"command\""));
    assert!(engine.substrate.start_requests().is_empty());
}
