use super::*;
use crate::action::ActionDef;
use crate::actions::sequence::{ReturnDefinition, SequenceDefinition};
use crate::actions::tests::helpers::{eventually, main_job, TestEngine};
use crate::types::JobStatus;
use serde_json::json;
use std::time::Duration;

fn then_return(breakpoint: BreakpointDefinition) -> ActionDef {
    Arc::new(SequenceDefinition::new(vec![
        Arc::new(breakpoint),
        Arc::new(ReturnDefinition::new(Some("'after'"))),
    ]))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_breakpoint_holds_until_resumed() {
    let engine = TestEngine::new();
    let job = engine.start(main_job(then_return(BreakpointDefinition::new())));

    eventually(|| job.breakpoints().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(job.outcome().is_none());

    let started = engine.events.with_status(events::BREAKPOINT, "start");
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].get("info"), Some("breakpoint"));

    let thread = job.breakpoints()[0];
    job.resume_breakpoint(thread, StepMode::Resume).unwrap();
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.result, json!("after"));
    assert_eq!(engine.events.with_status(events::BREAKPOINT, "stop").len(), 1);
    assert!(matches!(
        job.resume_breakpoint(thread, StepMode::Resume),
        Err(crate::errors::EngineError::DoesNotExist(_))
            | Err(crate::errors::EngineError::JobNotRunning(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_false_condition_skips_breakpoint() {
    let engine = TestEngine::new();

    let outcome = engine
        .run(main_job(then_return(BreakpointDefinition::new().when("False"))))
        .await;

    assert_eq!(outcome.result, json!("after"));
    assert!(engine.events.with_status(events::BREAKPOINT, "start").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_condition_raises_evaluation_error() {
    let engine = TestEngine::new();

    let job = engine.start(main_job(then_return(BreakpointDefinition::new().when("undefined"))));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert!(job
        .root_thread()
        .unwrap()
        .has_signal(SignalKind::EvaluationError));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_releases_breakpoint() {
    let engine = TestEngine::new();
    let job = engine.start(main_job(then_return(BreakpointDefinition::new())));
    eventually(|| job.breakpoints().len() == 1).await;

    engine.engine.terminate_job(job.id()).unwrap();
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Terminated);
    assert_eq!(outcome.result, serde_json::Value::Null);
    assert_eq!(engine.events.with_status(events::BREAKPOINT, "stop").len(), 1);
}
