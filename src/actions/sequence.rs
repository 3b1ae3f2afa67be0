//! Structural actions: sequence, assign and return

use std::sync::{Arc, Mutex};

use crate::action::{instantiate, Action, ActionDef, ActionDefinition};
use crate::actions::breakpoint::BreakpointDefinition;
use crate::condition::Condition;
use crate::errors::Location;
use crate::thread::Thread;
use crate::types::{SignalKind, Value};

/// Runs its children one after another
#[derive(Clone)]
pub struct SequenceDefinition {
    pub location: Location,
    pub children: Vec<ActionDef>,
}

impl SequenceDefinition {
    pub fn new(children: Vec<ActionDef>) -> Self {
        Self {
            location: Location::inline("sequence"),
            children,
        }
    }
}

impl ActionDefinition for SequenceDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        Arc::new(SequenceAction {
            definition: self,
            next: Mutex::new(0),
        })
    }
}

pub struct SequenceAction {
    definition: Arc<SequenceDefinition>,
    next: Mutex<usize>,
}

impl Action for SequenceAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        let index = {
            let mut next = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let index = *next;
            *next += 1;
            index
        };

        let Some(child) = self.definition.children.get(index) else {
            thread.pop_action();
            return;
        };

        thread.push_action(instantiate(child));

        // A pending step request stops the thread before the next child
        if thread.clear_step_mode().is_some() {
            let breakpoint = BreakpointDefinition::at(child.location().clone());
            thread.push_action(Arc::new(breakpoint).instantiate());
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        self.definition.clone().instantiate()
    }
}

/// Sets a variable from an expression
#[derive(Debug, Clone)]
pub struct AssignDefinition {
    pub location: Location,
    pub var: String,
    pub expr: String,
}

impl AssignDefinition {
    pub fn new(var: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            location: Location::inline("script"),
            var: var.into(),
            expr: expr.into(),
        }
    }
}

impl ActionDefinition for AssignDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        Arc::new(AssignAction { definition: self })
    }
}

pub struct AssignAction {
    definition: Arc<AssignDefinition>,
}

impl Action for AssignAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        thread.pop_action();

        match thread.eval_value(&self.definition.expr) {
            Ok(value) => thread.set_var(self.definition.var.clone(), value),
            Err(e) => thread.raise_error(
                SignalKind::EvaluationError,
                &self.definition.location,
                None,
                &format!("{} = {}\n\n{}", self.definition.var, self.definition.expr, e),
            ),
        }
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        self.definition.clone().instantiate()
    }
}

/// Returns from the innermost function with an optional value
#[derive(Debug, Clone)]
pub struct ReturnDefinition {
    pub location: Location,
    pub expr: Option<String>,
}

impl ReturnDefinition {
    pub fn new(expr: Option<&str>) -> Self {
        Self {
            location: Location::inline("return"),
            expr: expr.map(str::to_string),
        }
    }
}

impl ActionDefinition for ReturnDefinition {
    fn location(&self) -> &Location {
        &self.location
    }

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action> {
        Arc::new(ReturnAction { definition: self })
    }
}

pub struct ReturnAction {
    definition: Arc<ReturnDefinition>,
}

impl Action for ReturnAction {
    fn location(&self) -> &Location {
        &self.definition.location
    }

    fn execute(&self, thread: &Arc<Thread>) {
        thread.pop_action();

        let value = match &self.definition.expr {
            None => Value::Null,
            Some(expr) => match thread.eval_value(expr) {
                Ok(value) => value,
                Err(e) => {
                    thread.raise_error(
                        SignalKind::EvaluationError,
                        &self.definition.location,
                        None,
                        &e.to_string(),
                    );
                    return;
                }
            },
        };

        thread.raise_condition(Condition::returning(value));
    }

    fn handle_condition(&self, thread: &Arc<Thread>, _condition: &Condition) {
        thread.pop_action();
    }

    fn clone_action(&self) -> Arc<dyn Action> {
        self.definition.clone().instantiate()
    }
}
