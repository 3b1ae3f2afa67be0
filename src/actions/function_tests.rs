use super::*;
use crate::actions::sequence::{AssignDefinition, ReturnDefinition, SequenceDefinition};
use crate::actions::tests::helpers::{eventually, TestEngine};
use crate::job::events;
use crate::job::JobDefinition;
use crate::types::JobStatus;
use serde_json::json;

fn sequence(children: Vec<ActionDef>) -> ActionDef {
    Arc::new(SequenceDefinition::new(children))
}

fn returning(expr: &str) -> ActionDef {
    Arc::new(ReturnDefinition::new(Some(expr)))
}

/// `main` runs `call` and returns the call's result
fn calling(call: CallDefinition, function: FunctionDefinition) -> JobDefinition {
    JobDefinition::new("functions")
        .with_function(
            FunctionDefinition::new("main").with_body(sequence(vec![Arc::new(call), returning("Result")])),
        )
        .with_function(function)
        .with_default_call("main", None)
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn signal_message(job: &crate::job::Job, kind: SignalKind) -> String {
    job.root_thread()
        .and_then(|root| root.signals().into_iter().find(|signal| signal.kind == kind))
        .map(|signal| signal.message)
        .unwrap_or_default()
}

fn two_args() -> FunctionDefinition {
    FunctionDefinition::new("f")
        .with_args(ArgSpec::List(vec![
            ArgDecl::required("x"),
            ArgDecl::optional("y", "5"),
        ]))
        .with_body(returning("y"))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_optional_argument_takes_default() {
    let engine = TestEngine::new();

    let outcome = engine
        .run(calling(CallDefinition::with_list("'f'", args(&["1"])), two_args()))
        .await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_positional_arguments_bind_in_order() {
    let engine = TestEngine::new();

    let outcome = engine
        .run(calling(CallDefinition::with_list("'f'", args(&["1", "2"])), two_args()))
        .await;

    assert_eq!(outcome.result, json!(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_required_argument() {
    let engine = TestEngine::new();

    let job = engine.start(calling(CallDefinition::with_list("'f'", Vec::new()), two_args()));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert!(signal_message(&job, SignalKind::FunctionArgValidate)
        .contains("Required argument \"x\" is not provided in the call to function \"f\"."));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_too_many_arguments() {
    let engine = TestEngine::new();

    let job = engine.start(calling(
        CallDefinition::with_list("'f'", args(&["1", "2", "3"])),
        two_args(),
    ));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    let message = signal_message(&job, SignalKind::FunctionArgValidate);
    assert!(message.contains("Too many call arguments (3)."));
    assert!(message.contains("First additional argument: 3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_args_function_rejects_argument() {
    let engine = TestEngine::new();
    let function = FunctionDefinition::new("f")
        .with_args(ArgSpec::NoArgs)
        .with_body(returning("'ran'"));

    let job = engine.start(calling(CallDefinition::single("'f'", Some("1".into())), function));
    engine.wait(&job).await;

    assert!(signal_message(&job, SignalKind::FunctionArgValidate)
        .contains("Function f does not allow arguments to be passed to it."));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_arguments_bind_by_name() {
    let engine = TestEngine::new();
    let function = FunctionDefinition::new("f")
        .with_args(ArgSpec::Map(vec![
            ArgDecl::required("x"),
            ArgDecl::other("rest"),
        ]))
        .with_body(returning("rest"));

    let call = CallDefinition::with_map(
        "'f'",
        vec![("'x'".into(), "7".into()), ("'extra'".into(), "'e'".into())],
    );
    let outcome = engine.run(calling(call, function)).await;

    assert_eq!(outcome.result, json!({"extra": "e"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_function_rejects_list() {
    let engine = TestEngine::new();
    let function = FunctionDefinition::new("f")
        .with_args(ArgSpec::Map(vec![ArgDecl::required("x")]))
        .with_body(returning("x"));

    let job = engine.start(calling(CallDefinition::single("'f'", Some("[1]".into())), function));
    engine.wait(&job).await;

    assert!(signal_message(&job, SignalKind::FunctionArgValidate)
        .contains("requires arguments in a map form"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undeclared_arguments_bind_function_arg() {
    let engine = TestEngine::new();
    let function = FunctionDefinition::new("f").with_body(returning("FunctionArg"));

    let outcome = engine
        .run(calling(CallDefinition::single("'f'", Some("[1, 2]".into())), function))
        .await;

    assert_eq!(outcome.result, json!([1, 2]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_function_raises_signal() {
    let engine = TestEngine::new();
    let function = FunctionDefinition::new("f");

    let job = engine.start(calling(CallDefinition::new("'nope'"), function));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert!(signal_message(&job, SignalKind::FunctionDoesNotExist)
        .contains("Function does not exist: nope"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_scope_hides_callee_changes() {
    let engine = TestEngine::new();

    let run = |local: bool| {
        let mut callee = FunctionDefinition::new("f").with_body(Arc::new(AssignDefinition::new("x", "2")));
        if local {
            callee = callee.with_local_scope();
        }
        JobDefinition::new("scopes")
            .with_function(FunctionDefinition::new("main").with_body(sequence(vec![
                Arc::new(AssignDefinition::new("x", "1")),
                Arc::new(CallDefinition::new("'f'")),
                returning("x"),
            ])))
            .with_function(callee)
            .with_default_call("main", None)
    };

    assert_eq!(engine.run(run(true)).await.result, json!(1));
    assert_eq!(engine.run(run(false)).await.result, json!(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_caller_context_restored_after_return() {
    let engine = TestEngine::new();
    let callee = FunctionDefinition::new("f")
        .at(Location::new("function", "lib.xml", "build1", 3))
        .with_body(returning("CurrentFile"));

    let definition = JobDefinition::new("context")
        .with_function(FunctionDefinition::new("main").with_body(sequence(vec![
            Arc::new(CallDefinition::new("'f'")),
            Arc::new(AssignDefinition::new("inner", "Result")),
            returning("CurrentFunction"),
        ])))
        .with_function(callee)
        .with_default_call("main", None);

    let job = engine.start(definition);
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.result, json!("main"));
    assert_eq!(job.root_thread().unwrap().get_var("inner"), Some(json!("lib.xml")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_step_into_stops_inside_called_function() {
    let engine = TestEngine::new();
    let callee = FunctionDefinition::new("f")
        .at(Location::new("function", "lib.xml", "local", 12))
        .with_body(returning("'stepped'"));

    let definition = JobDefinition::new("stepping")
        .with_function(FunctionDefinition::new("main").with_body(sequence(vec![
            Arc::new(crate::actions::breakpoint::BreakpointDefinition::new()),
            Arc::new(CallDefinition::new("'f'")),
            returning("Result"),
        ])))
        .with_function(callee)
        .with_default_call("main", None);

    let job = engine.start(definition);
    let stops = |count: usize| {
        let events = engine.events.with_status(events::BREAKPOINT, "start");
        events.len() == count && job.breakpoints().len() == 1
    };

    // Initial breakpoint, then the call, then inside the function
    eventually(|| stops(1)).await;
    job.resume_breakpoint(job.breakpoints()[0], StepMode::StepInto).unwrap();
    eventually(|| stops(2)).await;
    job.resume_breakpoint(job.breakpoints()[0], StepMode::StepInto).unwrap();
    eventually(|| stops(3)).await;

    let started = engine.events.with_status(events::BREAKPOINT, "start");
    assert_eq!(started[2].get("lineNumber"), Some("12"));
    assert_eq!(started[2].get("xmlFile"), Some("lib.xml"));

    job.resume_breakpoint(job.breakpoints()[0], StepMode::Resume).unwrap();
    let outcome = engine.wait(&job).await;
    assert_eq!(outcome.result, json!("stepped"));
}
