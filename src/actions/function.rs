//! Function calls
//!
//! A call pops itself, resolves the function by name and pushes a function
//! instance carrying the evaluated call arguments. The function binds the
//! arguments against its declaration, runs its body and restores the
//! caller's context when the body finishes or a condition unwinds it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::action::{instantiate, Action, ActionDef, ActionDefinition};
use crate::actions::breakpoint::BreakpointDefinition;
use crate::actions::import::FunctionImport;
use crate::condition::Condition;
use crate::errors::{format_error, Location};
use crate::evaluator::to_display_string;
use crate::thread::{StepMode, Thread};
use crate::types::{vars, SignalKind, Value};

/// How a call passes its arguments
#[derive(Debug, Clone, PartialEq)]
pub enum CallArgsDef {
    None,
    /// One expression whose value is passed as is
    Single(String),
    /// Positional expressions
    List(Vec<String>),
    /// `(name, value)` expressions
    Map(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct CallDefinition {
    pub function: String,
    pub args: CallArgsDef,
    pub location: Location,
}

impl CallDefinition {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: CallArgsDef::None,
            location: Location::inline("call"),
        }
    }

    pub fn single(function: impl Into<String>, args: Option<String>) -> Self {
        let args = match args {
            Some(expr) if !expr.trim().is_empty() => CallArgsDef::Single(expr),
            _ => CallArgsDef::None,
        };
        Self {
            args,
            ..Self::new(function)
        }
    }

    pub fn with_list(function: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            args: CallArgsDef::List(args),
            location: Location::inline("call-with-list"),
            ..Self::new(function)
        }
    }

    pub fn with_map(function: impl Into<String>, args: Vec<(String, String)>) -> Self {
        Self {
            args: CallArgsDef::Map(args),
            location: Location::inline("call-with-map"),
            ..Self::new(function)
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    /// Evaluate the call arguments; `None` means no argument was passed
    fn evaluate_args(&self, thread: &Thread) -> Result<Option<Value>, String> {
        let eval = |expr: &str| {
            let expr = if expr.trim().is_empty() { "None" } else { expr };
            thread.eval_value(expr).map_err(|e| e.to_string())
        };

        match &self.args {
            CallArgsDef::None => Ok(None),
            CallArgsDef::Single(expr) => eval(expr).map(Some),
            CallArgsDef::List(exprs) => {
                let values = exprs.iter().map(|expr| eval(expr)).collect::<Result<Vec<_>, _>>()?;
                Ok(Some(Value::Array(values)))
            }
            CallArgsDef::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    let key = to_display_string(&eval(key)?);
                    map.insert(key, eval(value)?);
                }
                Ok(Some(Value::Object(map)))
            }
        }
    }
}

impl ActionDefinition for CallDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        Arc::new(CallAction { definition: self })
    }
}

pub struct CallAction {
    definition: Arc<CallDefinition>,
}

impl Action for CallAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        thread.pop_action();

        let location = &self.definition.location;
        let name = match thread.eval_string(&self.definition.function) {
            Ok(name) => name,
            Err(e) => {
                thread.raise_error(
                    SignalKind::EvaluationError,
                    location,
                    Some("function"),
                    &e.to_string(),
                );
                return;
            }
        };

        let Some(function) = thread.job().ok().and_then(|job| job.function(&name)) else {
            thread.raise_error(
                SignalKind::FunctionDoesNotExist,
                location,
                Some("function"),
                &format!("Function does not exist: {}", name),
            );
            return;
        };

        let args = match self.definition.evaluate_args(thread) {
            Ok(args) => args,
            Err(message) => {
                thread.raise_error(SignalKind::EvaluationError, location, None, &message);
                return;
            }
        };

        tracing::trace!(thread = thread.number(), function = %name, "Calling function");
        thread.push_action(Arc::new(FunctionAction::new(function, args, location.clone())));
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        self.definition.clone().instantiate()
    }

    fn details(&self) -> String {
        format!("call {}", self.definition.function)
    }
}

/// One declared argument
#[derive(Debug, Clone, PartialEq)]
pub struct ArgDecl {
    pub name: String,
    pub kind: ArgKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    Required,
    /// Default expression, evaluated only when the argument is absent
    Optional(Option<String>),
    /// Collects the remaining arguments
    Other,
}

impl ArgDecl {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Required,
        }
    }

    pub fn optional(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Optional(Some(default.into())),
        }
    }

    pub fn other(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Other,
        }
    }
}

/// What a function declares about its arguments
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ArgSpec {
    /// Nothing declared; the call argument is bound to `FunctionArg`
    #[default]
    Undeclared,
    NoArgs,
    Single(ArgDecl),
    List(Vec<ArgDecl>),
    Map(Vec<ArgDecl>),
}

#[derive(Clone)]
pub struct FunctionDefinition {
    pub name: String,
    pub requires: Vec<String>,
    pub args: ArgSpec,
    pub local_scope: bool,
    pub body: Option<ActionDef>,
    pub imports: Vec<FunctionImport>,
    pub location: Location,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            location: Location::inline("function"),
            name,
            requires: Vec::new(),
            args: ArgSpec::Undeclared,
            local_scope: false,
            body: None,
            imports: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: ActionDef) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_args(mut self, args: ArgSpec) -> Self {
        self.args = args;
        self
    }

    pub fn with_local_scope(mut self) -> Self {
        self.local_scope = true;
        self
    }

    pub fn requiring(mut self, names: &[&str]) -> Self {
        self.requires
            .extend(names.iter().map(|name| name.to_string()));
        self
    }

    pub fn with_import(mut self, import: FunctionImport) -> Self {
        self.imports.push(import);
        self
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }
}

impl fmt::Debug for FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .field("args", &self.args)
            .field("local_scope", &self.local_scope)
            .field("imports", &self.imports)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionPhase {
    Init,
    FunctionCalled,
    Complete,
}

struct FunctionState {
    phase: FunctionPhase,
    parent_function: Value,
    parent_file: Value,
    parent_machine: Value,
    scope_pushed: bool,
}

/// An argument binding failure
struct ArgError {
    kind: SignalKind,
    message: String,
}

impl ArgError {
    fn validate(location: &Location, message: String) -> Self {
        Self {
            kind: SignalKind::FunctionArgValidate,
            message: format_error(location, None, &message),
        }
    }
}

pub struct FunctionAction {
    definition: Arc<FunctionDefinition>,
    args: Option<Value>,
    call_location: Location,
    state: Mutex<FunctionState>,
}

impl FunctionAction {
    pub fn new(definition: Arc<FunctionDefinition>, args: Option<Value>, call_location: Location) -> Self {
        Self {
            definition,
            args,
            call_location,
            state: Mutex::new(FunctionState {
                phase: FunctionPhase::Init,
                parent_function: Value::Null,
                parent_file: Value::Null,
                parent_machine: Value::Null,
                scope_pushed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FunctionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> FunctionPhase {
        self.lock().phase
    }

    fn enter(&self, thread: &Arc<Thread>) {
        {
            let mut state = self.lock();
            state.parent_function = thread.get_var(vars::CURRENT_FUNCTION).unwrap_or(Value::Null);
            state.parent_file = thread.get_var(vars::CURRENT_FILE).unwrap_or(Value::Null);
            state.parent_machine = thread.get_var(vars::CURRENT_MACHINE).unwrap_or(Value::Null);

            if self.definition.local_scope {
                thread.push_scope(thread.variables());
                state.scope_pushed = true;
            }
        }

        if let Err(e) = self.bind_args(thread) {
            self.exit(thread);
            thread.set_var(vars::RESULT, Value::String(vars::FUNCTION_ERROR.to_string()));
            thread.raise_signal(e.kind, e.message);
            return;
        }

        let definition = &self.definition;
        thread.set_var(vars::CURRENT_FUNCTION, Value::String(definition.name.clone()));
        thread.set_var(vars::CURRENT_FILE, Value::String(definition.location.file.clone()));
        thread.set_var(
            vars::CURRENT_MACHINE,
            Value::String(definition.location.machine.clone()),
        );

        if let Some(body) = &definition.body {
            thread.push_action(instantiate(body));
        }

        // Stepping into a call stops before the body's first action
        if thread.step_mode() == Some(StepMode::StepInto) {
            thread.clear_step_mode();
            let breakpoint = BreakpointDefinition::at(definition.location.clone());
            thread.push_action(Arc::new(breakpoint).instantiate());
        }

        self.lock().phase = FunctionPhase::FunctionCalled;
    }

    /// Pop the function and restore the caller's context
    fn exit(&self, thread: &Thread) {
        let mut state = self.lock();
        state.phase = FunctionPhase::Complete;
        thread.pop_action();

        if std::mem::take(&mut state.scope_pushed) {
            thread.pop_scope();
        }

        thread.set_var(vars::CURRENT_FUNCTION, state.parent_function.clone());
        thread.set_var(vars::CURRENT_FILE, state.parent_file.clone());
        thread.set_var(vars::CURRENT_MACHINE, state.parent_machine.clone());
    }

    fn bind_default(&self, thread: &Thread, decl: &ArgDecl, default: &Option<String>) -> Result<(), ArgError> {
        let expr = default.as_deref().unwrap_or("None");
        match thread.eval_value(expr) {
            Ok(value) => {
                thread.set_var(decl.name.clone(), value);
                Ok(())
            }
            Err(e) => Err(ArgError {
                kind: SignalKind::EvaluationError,
                message: format_error(
                    &self.definition.location,
                    Some("default"),
                    &format!(
                        "Argument \"{}\" has an invalid default value: {}\n\n{}",
                        decl.name, expr, e
                    ),
                ),
            }),
        }
    }

    fn missing(&self, decl: &ArgDecl) -> ArgError {
        ArgError::validate(
            &self.call_location,
            format!(
                "Required argument \"{}\" is not provided in the call to function \"{}\".",
                decl.name, self.definition.name
            ),
        )
    }

    fn bind_args(&self, thread: &Thread) -> Result<(), ArgError> {
        let name = &self.definition.name;

        match &self.definition.args {
            ArgSpec::Undeclared => {
                thread.set_var(vars::FUNCTION_ARG, self.args.clone().unwrap_or(Value::Null));
                Ok(())
            }
            ArgSpec::NoArgs => match &self.args {
                None | Some(Value::Null) => Ok(()),
                Some(_) => Err(ArgError::validate(
                    &self.call_location,
                    format!("Function {} does not allow arguments to be passed to it.", name),
                )),
            },
            ArgSpec::Single(decl) => match (&self.args, &decl.kind) {
                (Some(value), _) => {
                    thread.set_var(decl.name.clone(), value.clone());
                    Ok(())
                }
                (None, ArgKind::Optional(default)) => self.bind_default(thread, decl, default),
                (None, _) => Err(self.missing(decl)),
            },
            ArgSpec::List(decls) => {
                let values = match &self.args {
                    None => Vec::new(),
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => vec![other.clone()],
                };
                let total = values.len();
                let mut remaining = values.into_iter();

                for decl in decls {
                    match &decl.kind {
                        ArgKind::Required => match remaining.next() {
                            Some(value) => thread.set_var(decl.name.clone(), value),
                            None => return Err(self.missing(decl)),
                        },
                        ArgKind::Optional(default) => match remaining.next() {
                            Some(value) => thread.set_var(decl.name.clone(), value),
                            None => self.bind_default(thread, decl, default)?,
                        },
                        ArgKind::Other => {
                            let rest: Vec<Value> = remaining.by_ref().collect();
                            thread.set_var(decl.name.clone(), Value::Array(rest));
                        }
                    }
                }

                if let Some(extra) = remaining.next() {
                    return Err(ArgError::validate(
                        &self.call_location,
                        format!(
                            "Too many call arguments ({}).  Function \"{}\" only handles {} arguments.\nFirst additional argument: {}",
                            total,
                            name,
                            decls.len(),
                            to_display_string(&extra)
                        ),
                    ));
                }
                Ok(())
            }
            ArgSpec::Map(decls) => {
                let mut values = match &self.args {
                    None | Some(Value::Null) => serde_json::Map::new(),
                    Some(Value::Object(map)) => map.clone(),
                    Some(_) => {
                        return Err(ArgError::validate(
                            &self.call_location,
                            format!("Function \"{}\" requires arguments in a map form.", name),
                        ))
                    }
                };

                for decl in decls {
                    match &decl.kind {
                        ArgKind::Required => match values.remove(&decl.name) {
                            Some(value) => thread.set_var(decl.name.clone(), value),
                            None => return Err(self.missing(decl)),
                        },
                        ArgKind::Optional(default) => match values.remove(&decl.name) {
                            Some(value) => thread.set_var(decl.name.clone(), value),
                            None => self.bind_default(thread, decl, default)?,
                        },
                        ArgKind::Other => {
                            let rest = std::mem::take(&mut values);
                            thread.set_var(decl.name.clone(), Value::Object(rest));
                        }
                    }
                }

                if !values.is_empty() {
                    let extra: Vec<&str> = values.keys().map(String::as_str).collect();
                    return Err(ArgError::validate(
                        &self.call_location,
                        format!(
                            "Too many call arguments for function \"{}\".  Extra arguments: {}",
                            name,
                            extra.join(", ")
                        ),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl Action for FunctionAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        let phase = self.lock().phase;

        match phase {
            FunctionPhase::Init => self.enter(thread),
            FunctionPhase::FunctionCalled => {
                self.exit(thread);
                thread.set_var(vars::RESULT, Value::Null);
            }
            FunctionPhase::Complete => {
                thread.pop_action();
            }
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, condition: &Condition) {
        self.exit(thread);

        match condition {
            Condition::Return { value, .. } => {
                thread.set_var(vars::RESULT, value.clone());
                thread.remove_condition(condition);
            }
            _ => thread.set_var(vars::RESULT, Value::Null),
        }

        thread.remove_conditions_where(Condition::is_return);
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        Arc::new(FunctionAction::new(
            self.definition.clone(),
            self.args.clone(),
            self.call_location.clone(),
        ))
    }

    fn details(&self) -> String {
        format!("function {}", self.definition.name)
    }
}

#[cfg(test)]
#[path = "function_tests.rs"]
mod tests;
