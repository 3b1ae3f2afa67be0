use super::*;
use crate::action::ActionDef;
use crate::actions::function::CallDefinition;
use crate::actions::sequence::{ReturnDefinition, SequenceDefinition};
use crate::actions::tests::helpers::{main_job, TestEngine};
use crate::errors::FetchError;
use crate::job::JobDefinition;
use crate::types::JobStatus;
use serde_json::json;

fn returning(expr: &str) -> FunctionDefinition {
    FunctionDefinition::new("f").with_body(Arc::new(ReturnDefinition::new(Some(expr))))
}

fn named(name: &str) -> FunctionDefinition {
    FunctionDefinition {
        name: name.to_string(),
        ..returning("None")
    }
}

fn document(functions: Vec<FunctionDefinition>) -> FunctionDocument {
    functions
        .into_iter()
        .fold(FunctionDocument::new("local", "/lib/util.xml"), |doc, function| {
            doc.with_function(function)
        })
}

fn filter(include: &[&str], exclude: &[&str]) -> FunctionFilter {
    FunctionFilter::new(include, exclude).unwrap()
}

fn sequence(children: Vec<ActionDef>) -> ActionDef {
    Arc::new(SequenceDefinition::new(children))
}

/// Import, then return the import result
fn import_job(import: ImportDefinition) -> JobDefinition {
    main_job(sequence(vec![
        Arc::new(import),
        Arc::new(ReturnDefinition::new(Some("Result"))),
    ]))
}

fn root_signal(job: &Job, kind: SignalKind) -> Option<String> {
    job.root_thread()?
        .signals()
        .into_iter()
        .find(|signal| signal.kind == kind)
        .map(|signal| signal.message)
}

#[test]
fn test_classify_requested_required_and_existing() {
    let doc = document(vec![
        named("A").requiring(&["C"]),
        named("B"),
        named("C"),
        named("D"),
    ]);

    let (result, added) = classify(&doc, &filter(&["*"], &["B"]), false, |name| name == "D");

    assert_eq!(result.imported_requested, vec!["A"]);
    assert_eq!(result.imported_required, vec!["C"]);
    assert_eq!(result.existing_requested, vec!["D"]);
    assert_eq!(result.not_requested_not_required, vec!["B"]);
    assert!(result.does_not_exist.is_empty());

    let added: Vec<&str> = added.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(added, vec!["C", "A"]);
}

#[test]
fn test_classify_required_ignores_excludes() {
    let doc = document(vec![named("A").requiring(&["C"]), named("C").requiring(&["E"]), named("E")]);

    let (result, added) = classify(&doc, &filter(&["A"], &["C", "E"]), false, |_| false);

    assert_eq!(result.imported_requested, vec!["A"]);
    assert_eq!(result.imported_required, vec!["C", "E"]);
    assert_eq!(added.len(), 3);
}

#[test]
fn test_classify_existing_required_is_not_imported() {
    let doc = document(vec![named("A").requiring(&["C"]), named("C")]);

    let (result, added) = classify(&doc, &filter(&["A"], &[]), false, |name| name == "C");

    assert_eq!(result.existing_required, vec!["C"]);
    assert_eq!(added.len(), 1);
}

#[test]
fn test_classify_reports_missing_names() {
    let doc = document(vec![named("A").requiring(&["Ghost", "A"]), named("Xray")]);

    let (result, _) = classify(&doc, &filter(&["A", "Zed", "X*"], &[]), false, |_| false);

    assert_eq!(result.imported_requested, vec!["A", "Xray"]);
    assert_eq!(result.does_not_exist, vec!["Ghost", "Zed"]);
    assert!(result.imported_required.is_empty());
}

#[test]
fn test_classify_replace_overwrites_existing() {
    let doc = document(vec![named("A")]);

    let (kept, added) = classify(&doc, &FunctionFilter::all(), false, |_| true);
    assert_eq!(kept.existing_requested, vec!["A"]);
    assert!(added.is_empty());

    let (replaced, added) = classify(&doc, &FunctionFilter::all(), true, |_| true);
    assert_eq!(replaced.imported_requested, vec!["A"]);
    assert_eq!(added.len(), 1);
}

#[test]
fn test_invalid_pattern_is_rejected() {
    assert!(FunctionFilter::new(&["[abc"], &[]).is_err());
}

#[test]
fn test_path_helpers() {
    assert_eq!(normalize_path("/a/b/../c/./d", '/'), "/a/c/d");
    assert_eq!(normalize_path("a//b/..", '/'), "a");
    assert_eq!(normalize_path("../x", '/'), "../x");
    assert_eq!(normalize_path("/..", '/'), "/");
    assert_eq!(normalize_path("C:\\jobs\\..\\lib/util.xml", '\\'), "C:\\lib\\util.xml");

    assert!(!is_relative("/lib/util.xml", '/'));
    assert!(is_relative("lib/util.xml", '/'));
    assert!(!is_relative("C:\\lib", '\\'));
    assert!(!is_relative("\\lib", '\\'));
    assert!(is_relative("lib\\util.xml", '\\'));
}

#[test]
fn test_mode_parsing() {
    assert_eq!("Error".parse::<ImportMode>(), Ok(ImportMode::Error));
    assert_eq!("IGNORE".parse::<ImportMode>(), Ok(ImportMode::Ignore));
    assert!("sometimes".parse::<ImportMode>().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_imported_function_can_be_called() {
    let engine = TestEngine::new();
    engine.documents.insert(
        document(vec![FunctionDefinition {
            name: "helper".into(),
            ..returning("'helped'")
        }]),
        "1",
    );

    let definition = main_job(sequence(vec![
        Arc::new(ImportDefinition::file("'/lib/util.xml'")),
        Arc::new(CallDefinition::new("'helper'")),
        Arc::new(ReturnDefinition::new(Some("Result"))),
    ]));
    let outcome = engine.run(definition).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!("helped"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_result_lists_what_was_imported() {
    let engine = TestEngine::new();
    engine
        .documents
        .insert(document(vec![named("A"), named("B")]), "1");

    let outcome = engine
        .run(import_job(ImportDefinition::file("'/lib/util.xml'").including("'A Zed'")))
        .await;

    let result = outcome.result;
    assert_eq!(result["machine"], json!("local"));
    assert_eq!(result["file"], json!("/lib/util.xml"));
    assert_eq!(result["error"], serde_json::Value::Null);
    assert_eq!(result["imported_requested"], json!(["A"]));
    assert_eq!(result["not_requested_not_required"], json!(["B"]));
    assert_eq!(result["does_not_exist"], json!(["Zed"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_existing_function_kept_unless_replacing() {
    let engine = TestEngine::new();
    engine.documents.insert(
        document(vec![FunctionDefinition {
            name: "helper".into(),
            ..returning("'new'")
        }]),
        "1",
    );

    let job = |import: ImportDefinition| {
        main_job(sequence(vec![
            Arc::new(import),
            Arc::new(CallDefinition::new("'helper'")),
            Arc::new(ReturnDefinition::new(Some("Result"))),
        ]))
        .with_function(FunctionDefinition {
            name: "helper".into(),
            ..returning("'old'")
        })
    };

    let kept = engine.run(job(ImportDefinition::file("'/lib/util.xml'"))).await;
    assert_eq!(kept.result, json!("old"));

    let replaced = engine
        .run(job(ImportDefinition::file("'/lib/util.xml'").replacing()))
        .await;
    assert_eq!(replaced.result, json!("new"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relative_path_needs_a_current_file() {
    let engine = TestEngine::new();

    let job = engine.start(import_job(ImportDefinition::file("'util.xml'")));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    let message = root_signal(&job, SignalKind::FileCopyError).unwrap();
    assert!(message.contains(
        "Invalid import file: util.xml\nCannot specify a relative path since CurrentFile=<inline data>"
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relative_path_resolves_against_current_file() {
    let engine = TestEngine::new();
    engine.documents.insert(document(vec![named("A")]), "1");

    let main = FunctionDefinition::new("main")
        .at(Location::new("function", "/jobs/main.xml", "local", 1))
        .with_body(sequence(vec![
            Arc::new(ImportDefinition::file("'../lib/./util.xml'")),
            Arc::new(ReturnDefinition::new(Some("Result"))),
        ]));
    let definition = JobDefinition::new("relative")
        .with_function(main)
        .with_default_call("main", None);

    let outcome = engine.run(definition).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result["file"], json!("/lib/util.xml"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_file_raises_copy_error() {
    let engine = TestEngine::new();

    let job = engine.start(import_job(ImportDefinition::file("'/lib/none.xml'")));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert_eq!(outcome.result["error"]["signal"], json!("FileCopyError"));
    assert!(root_signal(&job, SignalKind::FileCopyError)
        .unwrap()
        .contains("Error getting file /lib/none.xml from machine local"));
}

fn broken_directory(engine: &TestEngine) {
    engine.documents.insert(
        FunctionDocument::new("local", "/lib/a.xml").with_function(named("a")),
        "1",
    );
    engine.documents.fail(
        "local",
        "/lib/b.xml",
        FetchError::Parse {
            machine: "local".into(),
            file: "/lib/b.xml".into(),
            message: "unexpected end of file".into(),
        },
    );
    engine.documents.insert(
        FunctionDocument::new("local", "/lib/c.xml").with_function(named("c")),
        "1",
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_failure_raises_in_error_mode() {
    let engine = TestEngine::new();
    broken_directory(&engine);

    let job = engine.start(import_job(ImportDefinition::directory("'/lib'")));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert!(root_signal(&job, SignalKind::ParseError)
        .unwrap()
        .contains("unexpected end of file"));

    let result = outcome.result;
    assert_eq!(result["directory"], json!("/lib"));
    assert_eq!(result["error"]["message"], json!("Directory: /lib, Machine: local"));
    assert_eq!(result["files"][0]["imported_requested"], json!(["a"]));
    assert_eq!(result["files"][1]["error"]["signal"], json!("ParseError"));
    assert_eq!(result["files"].as_array().map(Vec::len), Some(2));
    assert!(job.function_exists("a"));
    assert!(!job.function_exists("c"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_failure_ignored_in_ignore_mode() {
    let engine = TestEngine::new();
    broken_directory(&engine);

    let job = engine.start(import_job(
        ImportDefinition::directory("'/lib'").with_mode("'ignore'"),
    ));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert!(job.function_exists("a"));
    assert!(job.function_exists("c"));
    assert_eq!(outcome.result["files"].as_array().map(Vec::len), Some(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_mode_raises_import_error() {
    let engine = TestEngine::new();

    let job = engine.start(import_job(
        ImportDefinition::file("'/lib/util.xml'").with_mode("'sometimes'"),
    ));
    engine.wait(&job).await;

    let message = root_signal(&job, SignalKind::ImportError).unwrap();
    assert!(message.contains("Invalid import mode: sometimes"));
    assert!(engine.documents.fetches().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_and_directory_are_exclusive() {
    let engine = TestEngine::new();

    let mut both = ImportDefinition::file("'/lib/util.xml'");
    both.directory = Some("'/lib'".into());
    let job = engine.start(import_job(both));
    engine.wait(&job).await;

    assert!(root_signal(&job, SignalKind::ImportError)
        .unwrap()
        .contains("Exactly one of the file or directory attributes must be specified"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_function_imports_are_followed() {
    let engine = TestEngine::new();
    engine.documents.insert(
        FunctionDocument::new("local", "/lib/a.xml")
            .with_function(named("a").with_import(FunctionImport::file("b.xml").functions(&["b"]))),
        "1",
    );
    engine.documents.insert(
        FunctionDocument::new("local", "/lib/b.xml")
            .with_function(named("b"))
            .with_function(named("b2")),
        "1",
    );

    let job = engine.start(import_job(ImportDefinition::file("'/lib/a.xml'")));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Normal);
    assert!(job.function_exists("a"));
    assert!(job.function_exists("b"));
    assert!(!job.function_exists("b2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_function_import_fails_the_file() {
    let engine = TestEngine::new();
    engine.documents.insert(
        FunctionDocument::new("local", "/lib/a.xml")
            .with_function(named("a").with_import(FunctionImport::file("gone.xml"))),
        "1",
    );

    let job = engine.start(import_job(ImportDefinition::file("'/lib/a.xml'")));
    let outcome = engine.wait(&job).await;

    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert_eq!(outcome.result["error"]["signal"], json!("FileCopyError"));
    assert!(outcome.result["error"]["message"]
        .as_str()
        .unwrap()
        .contains("/lib/gone.xml"));
}
