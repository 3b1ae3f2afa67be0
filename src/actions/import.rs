//! Importing functions from other definition files
//!
//! An import loads one file, or every `.xml` file in a directory, and adds
//! the requested functions plus everything they require to the job. Which
//! functions are requested is decided by space separated include and
//! exclude glob lists. Functions that declare their own imports pull those
//! files in as well.
//!
//! The outcome is stored in `Result` as a JSON document listing, per file,
//! what was imported, what already existed and what could not be found.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use globset::{Glob, GlobMatcher};
use serde::Serialize;

use crate::action::{Action, ActionDefinition};
use crate::condition::Condition;
use crate::documents::{load_document, FunctionDocument};
use crate::errors::{Location, INLINE_DATA};
use crate::evaluator::to_display_string;
use crate::actions::function::FunctionDefinition;
use crate::job::Job;
use crate::thread::Thread;
use crate::types::{vars, SignalKind, Value};

/// What happens when a file cannot be imported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Raise the failure as a signal and stop
    Error,
    /// Record the failure in the result and carry on
    Ignore,
}

impl FromStr for ImportMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(ImportMode::Error),
            "ignore" => Ok(ImportMode::Ignore),
            _ => Err(()),
        }
    }
}

/// An import declared by a function
///
/// Processed when the declaring function is itself imported. The values are
/// literal; a relative file is resolved against the declaring function's file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionImport {
    pub machine: Option<String>,
    pub file: Option<String>,
    pub directory: Option<String>,
    /// Functions to request; empty means all of them
    pub functions: Vec<String>,
}

impl FunctionImport {
    pub fn file(file: impl Into<String>) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::default()
        }
    }

    pub fn functions(mut self, names: &[&str]) -> Self {
        self.functions = names.iter().map(|name| name.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct ImportDefinition {
    pub location: Location,
    pub machine: Option<String>,
    pub file: Option<String>,
    pub directory: Option<String>,
    pub mode: Option<String>,
    pub replace: Option<String>,
    pub include: Option<String>,
    pub exclude: Option<String>,
}

impl ImportDefinition {
    pub fn file(file: impl Into<String>) -> Self {
        Self {
            location: Location::inline("import"),
            machine: None,
            file: Some(file.into()),
            directory: None,
            mode: None,
            replace: None,
            include: None,
            exclude: None,
        }
    }

    pub fn directory(directory: impl Into<String>) -> Self {
        Self {
            file: None,
            directory: Some(directory.into()),
            ..Self::file("")
        }
    }

    pub fn on(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn replacing(mut self) -> Self {
        self.replace = Some("True".to_string());
        self
    }

    pub fn including(mut self, include: impl Into<String>) -> Self {
        self.include = Some(include.into());
        self
    }

    pub fn excluding(mut self, exclude: impl Into<String>) -> Self {
        self.exclude = Some(exclude.into());
        self
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }
}

impl ActionDefinition for ImportDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        Arc::new(ImportAction { definition: self })
    }
}

/// How the functions of one file were treated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportedFunctions {
    pub imported_requested: Vec<String>,
    pub imported_required: Vec<String>,
    pub existing_requested: Vec<String>,
    pub existing_required: Vec<String>,
    pub not_requested_not_required: Vec<String>,
    pub does_not_exist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFailure {
    pub signal: SignalKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileImportResult {
    pub machine: String,
    pub file: String,
    pub error: Option<ImportFailure>,
    #[serde(flatten)]
    pub functions: ImportedFunctions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryImportResult {
    pub machine: String,
    pub directory: String,
    /// Set when listing failed or any file failed to import
    pub error: Option<ImportFailure>,
    pub files: Vec<FileImportResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ImportResult {
    File(FileImportResult),
    Directory(DirectoryImportResult),
}

/// Include and exclude globs applied to function names
pub struct FunctionFilter {
    include: Vec<(String, GlobMatcher)>,
    exclude: Vec<GlobMatcher>,
}

impl FunctionFilter {
    /// No include patterns means every function is requested
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, globset::Error> {
        let include = include
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Ok((pattern.to_string(), Glob::new(pattern)?.compile_matcher()))
            })
            .collect::<Result<Vec<_>, globset::Error>>()?;
        let exclude = exclude
            .iter()
            .map(|pattern| Ok(Glob::new(pattern.as_ref())?.compile_matcher()))
            .collect::<Result<Vec<_>, globset::Error>>()?;

        Ok(Self { include, exclude })
    }

    pub fn all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    fn excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|matcher| matcher.is_match(name))
    }

    pub fn is_requested(&self, name: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|(_, matcher)| matcher.is_match(name));
        included && !self.excluded(name)
    }

    /// Literal include names that are missing from `document`
    fn missing_names(&self, document: &FunctionDocument) -> Vec<String> {
        self.include
            .iter()
            .map(|(pattern, _)| pattern)
            .filter(|pattern| !pattern.contains(['*', '?', '[']))
            .filter(|name| !document.functions.contains_key(name.as_str()) && !self.excluded(name))
            .cloned()
            .collect()
    }
}

/// Decide which functions of `document` to add to the job
///
/// `exists` reports whether the job already has a function. Functions
/// required by a requested function are imported (transitively) unless the
/// job already has them; a function that is both requested and required is
/// reported as required.
pub fn classify(
    document: &FunctionDocument,
    filter: &FunctionFilter,
    replace: bool,
    exists: impl Fn(&str) -> bool,
) -> (ImportedFunctions, Vec<Arc<FunctionDefinition>>) {
    let mut result = ImportedFunctions::default();
    let mut to_add = Vec::new();

    let requested: BTreeSet<&str> = document
        .functions
        .keys()
        .map(String::as_str)
        .filter(|name| filter.is_requested(name))
        .collect();

    let mut required: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<(String, &str)> = VecDeque::new();
    for name in &requested {
        if let Some(function) = document.functions.get(*name) {
            queue.extend(function.requires.iter().map(|r| (r.clone(), *name)));
        }
    }

    while let Some((name, requirer)) = queue.pop_front() {
        if name == requirer || !required.insert(name.clone()) {
            continue;
        }

        if exists(&name) {
            result.existing_required.push(name);
        } else if let Some(function) = document.functions.get(&name) {
            queue.extend(
                function
                    .requires
                    .iter()
                    .map(|r| (r.clone(), function.name.as_str())),
            );
            to_add.push(function.clone());
            result.imported_required.push(name);
        } else {
            result.does_not_exist.push(name);
        }
    }

    for name in requested.iter().filter(|name| !required.contains(**name)) {
        if !exists(name) || replace {
            if let Some(function) = document.functions.get(*name) {
                to_add.push(function.clone());
            }
            result.imported_requested.push(name.to_string());
        } else {
            result.existing_requested.push(name.to_string());
        }
    }

    result.not_requested_not_required = document
        .functions
        .keys()
        .filter(|name| !requested.contains(name.as_str()) && !required.contains(*name))
        .cloned()
        .collect();

    for name in filter.missing_names(document) {
        if !result.does_not_exist.contains(&name) {
            result.does_not_exist.push(name);
        }
    }

    (result, to_add)
}

/// True when `path` does not start at a root
pub fn is_relative(path: &str, separator: char) -> bool {
    if separator == '\\' {
        let bytes = path.as_bytes();
        !(path.starts_with(['\\', '/']) || (bytes.len() > 1 && bytes[1] == b':'))
    } else {
        !path.starts_with('/')
    }
}

/// Directory part of `file`, without the trailing separator
fn parent_of(file: &str, separator: char) -> &str {
    let position = if separator == '\\' {
        file.rfind(['\\', '/'])
    } else {
        file.rfind(separator)
    };
    match position {
        Some(0) => &file[..1],
        Some(index) => &file[..index],
        None => "",
    }
}

/// Collapse `.` and `..` segments and repeated separators
pub fn normalize_path(path: &str, separator: char) -> String {
    let is_separator = |c: char| c == separator || (separator == '\\' && c == '/');
    let rooted = path.starts_with(is_separator);

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(is_separator) {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            _ => segments.push(segment),
        }
    }

    let joined = segments.join(&separator.to_string());
    if rooted {
        format!("{}{}", separator, joined)
    } else {
        joined
    }
}

fn split_patterns(text: Option<String>) -> Vec<String> {
    text.map(|text| text.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// The evaluated attributes of an import
struct ImportRequest {
    machine: String,
    machine_given: bool,
    file: Option<String>,
    directory: Option<String>,
    mode: ImportMode,
    replace: bool,
    include: Vec<String>,
    exclude: Vec<String>,
}

/// An import that failed before any file was read
struct ImportAbort {
    kind: SignalKind,
    attribute: Option<&'static str>,
    message: String,
}

impl ImportAbort {
    fn new(kind: SignalKind, attribute: Option<&'static str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            attribute,
            message: message.into(),
        }
    }
}

pub struct ImportAction {
    definition: Arc<ImportDefinition>,
}

impl ImportAction {
    fn evaluate(&self, thread: &Thread) -> Result<ImportRequest, ImportAbort> {
        let definition = &self.definition;
        let eval_error =
            |attribute, e: crate::errors::EvalError| ImportAbort::new(SignalKind::EvaluationError, Some(attribute), e.to_string());

        let mode_text = thread
            .eval_opt_string(definition.mode.as_deref())
            .map_err(|e| eval_error("mode", e))?
            .unwrap_or_else(|| "error".to_string());
        let mode = mode_text.parse::<ImportMode>().map_err(|_| {
            ImportAbort::new(
                SignalKind::ImportError,
                Some("mode"),
                format!(
                    "Invalid import mode: {}\nImport mode must be 'error' or 'ignore'.",
                    mode_text
                ),
            )
        })?;

        let machine = thread
            .eval_opt_string(definition.machine.as_deref())
            .map_err(|e| eval_error("machine", e))?;
        let file = thread
            .eval_opt_string(definition.file.as_deref())
            .map_err(|e| eval_error("file", e))?;
        let directory = thread
            .eval_opt_string(definition.directory.as_deref())
            .map_err(|e| eval_error("directory", e))?;
        let replace = match &definition.replace {
            Some(expr) => thread.eval_bool(expr).map_err(|e| eval_error("replace", e))?,
            None => false,
        };
        let include = thread
            .eval_opt_string(definition.include.as_deref())
            .map_err(|e| eval_error("include", e))?;
        let exclude = thread
            .eval_opt_string(definition.exclude.as_deref())
            .map_err(|e| eval_error("exclude", e))?;

        if file.is_some() == directory.is_some() {
            return Err(ImportAbort::new(
                SignalKind::ImportError,
                None,
                "Exactly one of the file or directory attributes must be specified",
            ));
        }

        let machine_given = machine.is_some();
        let machine = machine.unwrap_or_else(|| {
            thread
                .get_var(vars::CURRENT_MACHINE)
                .map(|value| to_display_string(&value))
                .unwrap_or_else(|| self.definition.location.machine.clone())
        });

        Ok(ImportRequest {
            machine,
            machine_given,
            file,
            directory,
            mode,
            replace,
            include: split_patterns(include),
            exclude: split_patterns(exclude),
        })
    }

    /// Resolve a relative path against the file of the running function
    fn resolve(
        &self,
        thread: &Thread,
        path: &str,
        kind: &str,
        separator: char,
        machine_given: bool,
    ) -> Result<String, ImportAbort> {
        if machine_given || !is_relative(path, separator) {
            return Ok(normalize_path(path, separator));
        }

        let current = thread
            .get_var(vars::CURRENT_FILE)
            .map(|value| to_display_string(&value))
            .unwrap_or_else(|| INLINE_DATA.to_string());

        if current == INLINE_DATA {
            return Err(ImportAbort::new(
                SignalKind::FileCopyError,
                Some(kind_attribute(kind)),
                format!(
                    "Invalid import {}: {}\nCannot specify a relative path since CurrentFile={}",
                    kind, path, INLINE_DATA
                ),
            ));
        }

        let joined = format!("{}{}{}", parent_of(&current, separator), separator, path);
        Ok(normalize_path(&joined, separator))
    }
}

fn kind_attribute(kind: &str) -> &'static str {
    if kind == "directory" {
        "directory"
    } else {
        "file"
    }
}

/// Walks files and the imports of the functions they add
struct Importer<'a> {
    job: &'a Job,
    replace: bool,
    visited: HashSet<(String, String)>,
}

impl Importer<'_> {
    fn import_file(&mut self, machine: &str, file: &str, filter: &FunctionFilter) -> FileImportResult {
        let mut result = FileImportResult {
            machine: machine.to_string(),
            file: file.to_string(),
            error: None,
            functions: ImportedFunctions::default(),
        };
        self.visited.insert((machine.to_lowercase(), file.to_string()));

        let document = match self.load(machine, file) {
            Ok(document) => document,
            Err(failure) => {
                result.error = Some(failure);
                return result;
            }
        };

        let (functions, to_add) =
            classify(&document, filter, self.replace, |name| self.job.function_exists(name));
        result.functions = functions;

        for function in &to_add {
            self.job.add_function(function.clone());
        }
        tracing::debug!(
            job_id = self.job.id(),
            machine,
            file,
            imported = to_add.len(),
            "Imported functions"
        );

        if let Err(failure) = self.import_nested(&document, &to_add) {
            result.error = Some(failure);
        }
        result
    }

    /// Process the imports declared by newly added functions
    fn import_nested(
        &mut self,
        document: &FunctionDocument,
        added: &[Arc<FunctionDefinition>],
    ) -> Result<(), ImportFailure> {
        let separator = self
            .job
            .services()
            .documents
            .as_ref()
            .map(|source| source.file_separator(&document.machine))
            .unwrap_or('/');

        for function in added {
            for import in &function.imports {
                let machine = import.machine.clone().unwrap_or_else(|| document.machine.clone());
                let filter = FunctionFilter::new(&import.functions, &[]).map_err(|e| ImportFailure {
                    signal: SignalKind::ImportError,
                    message: e.to_string(),
                })?;

                let files = match (&import.file, &import.directory) {
                    (Some(file), _) => vec![self.nested_path(document, import, file, separator)],
                    (None, Some(directory)) => {
                        let directory = self.nested_path(document, import, directory, separator);
                        self.list(&machine, &directory)?
                    }
                    (None, None) => continue,
                };

                for file in files {
                    if self.visited.contains(&(machine.to_lowercase(), file.clone())) {
                        continue;
                    }
                    let nested = self.import_file(&machine, &file, &filter);
                    if let Some(failure) = nested.error {
                        return Err(failure);
                    }
                }
            }
        }
        Ok(())
    }

    fn nested_path(&self, document: &FunctionDocument, import: &FunctionImport, path: &str, separator: char) -> String {
        if import.machine.is_some() || !is_relative(path, separator) {
            return normalize_path(path, separator);
        }
        let joined = format!("{}{}{}", parent_of(&document.file, separator), separator, path);
        normalize_path(&joined, separator)
    }

    fn load(&self, machine: &str, file: &str) -> Result<Arc<FunctionDocument>, ImportFailure> {
        let services = self.job.services();
        let Some(source) = services.documents.as_deref() else {
            return Err(ImportFailure {
                signal: SignalKind::ImportError,
                message: "No document source is configured".to_string(),
            });
        };

        load_document(source, services.file_cache.as_deref(), machine, file).map_err(|e| ImportFailure {
            signal: e.signal(),
            message: e.to_string(),
        })
    }

    fn list(&self, machine: &str, directory: &str) -> Result<Vec<String>, ImportFailure> {
        let Some(source) = self.job.services().documents.as_deref() else {
            return Err(ImportFailure {
                signal: SignalKind::ImportError,
                message: "No document source is configured".to_string(),
            });
        };

        let mut files = source
            .list_directory(machine, directory, "xml")
            .map_err(|e| ImportFailure {
                signal: e.signal(),
                message: format!(
                    "Error listing the xml files in directory \"{}\" on machine \"{}\": {}",
                    directory, machine, e
                ),
            })?;
        files.sort();
        Ok(files)
    }
}

impl Action for ImportAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        thread.pop_action();
        let location = &self.definition.location;

        let abort = |abort: ImportAbort| {
            thread.raise_error(abort.kind, location, abort.attribute, &abort.message);
        };

        let request = match self.evaluate(thread) {
            Ok(request) => request,
            Err(e) => return abort(e),
        };

        let filter = match FunctionFilter::new(&request.include, &request.exclude) {
            Ok(filter) => filter,
            Err(e) => {
                return abort(ImportAbort::new(
                    SignalKind::ImportError,
                    Some("include"),
                    format!("Invalid function name pattern: {}", e),
                ))
            }
        };

        let Ok(job) = thread.job() else {
            return;
        };
        let separator = job
            .services()
            .documents
            .as_ref()
            .map(|source| source.file_separator(&request.machine))
            .unwrap_or('/');

        let mut importer = Importer {
            job: &job,
            replace: request.replace,
            visited: HashSet::new(),
        };

        let result = if let Some(file) = &request.file {
            let file = match self.resolve(thread, file, "file", separator, request.machine_given) {
                Ok(file) => file,
                Err(e) => return abort(e),
            };
            ImportResult::File(importer.import_file(&request.machine, &file, &filter))
        } else {
            let directory = request.directory.as_deref().unwrap_or_default();
            let directory =
                match self.resolve(thread, directory, "directory", separator, request.machine_given) {
                    Ok(directory) => directory,
                    Err(e) => return abort(e),
                };

            let mut result = DirectoryImportResult {
                machine: request.machine.clone(),
                directory: directory.clone(),
                error: None,
                files: Vec::new(),
            };
            match importer.list(&request.machine, &directory) {
                Ok(files) => {
                    for file in files {
                        let imported = importer.import_file(&request.machine, &file, &filter);
                        let failed = imported.error.is_some();
                        result.files.push(imported);
                        // Error mode stops at the first file that fails
                        if failed && request.mode == ImportMode::Error {
                            break;
                        }
                    }
                    if let Some(failure) = result.files.iter().find_map(|file| file.error.clone()) {
                        result.error = Some(ImportFailure {
                            signal: failure.signal,
                            message: format!("Directory: {}, Machine: {}", directory, request.machine),
                        });
                    }
                }
                Err(failure) => result.error = Some(failure),
            }
            ImportResult::Directory(result)
        };

        let failure = match &result {
            ImportResult::File(file) => file.error.clone(),
            ImportResult::Directory(directory) => directory
                .files
                .iter()
                .find_map(|file| file.error.clone())
                .or_else(|| directory.error.clone()),
        };

        thread.set_var(
            vars::RESULT,
            serde_json::to_value(&result).unwrap_or(Value::Null),
        );

        match (failure, request.mode) {
            (Some(failure), ImportMode::Error) => {
                thread.raise_error(failure.signal, location, None, &failure.message);
            }
            (Some(failure), ImportMode::Ignore) => {
                tracing::warn!(job_id = job.id(), message = %failure.message, "Ignoring import failure");
            }
            (None, _) => {}
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        self.definition.clone().instantiate()
    }

    fn details(&self) -> String {
        match (&self.definition.file, &self.definition.directory) {
            (Some(file), _) => format!("import file {}", file),
            (None, Some(directory)) => format!("import directory {}", directory),
            (None, None) => "import".to_string(),
        }
    }
}

#[cfg(test)]
#[path = "import_tests.rs"]
mod tests;
