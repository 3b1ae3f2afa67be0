//! The contract every action obeys
//!
//! Definitions are immutable and shared by every thread that runs them. An
//! instance carries the mutable state of one execution, and cloning an action
//! means instantiating a fresh instance from the same definition.

use std::fmt;
use std::sync::Arc;

use crate::condition::Condition;
use crate::errors::Location;
use crate::thread::Thread;

/// A resumable unit of work on a thread's action stack
///
/// `execute` advances the action by one state transition. An action that has
/// to wait adds a hold to the thread and returns without popping itself; it is
/// executed again once the hold is removed and the thread rescheduled.
pub trait Action: Send + Sync {
    fn location(&self) -> &Location;

    fn execute(&self, thread: &Arc<Thread>);

    fn handle_condition(&self, thread: &Arc<Thread>, condition: &Condition);

    /// A new instance with independent state for use on another stack slot
    fn clone_action(&self) -> Arc<dyn Action>;

    /// Short description used in logs and thread listings
    fn details(&self) -> String {
        self.location().element.clone()
    }
}

impl fmt::Debug for dyn Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("details", &self.details())
            .finish()
    }
}

/// Parsed, immutable description of an action
pub trait ActionDefinition: Send + Sync {
    fn location(&self) -> &Location;

    fn instantiate(self: Arc<Self>) -> Arc<dyn Action>;
}

impl fmt::Debug for dyn ActionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("location", self.location())
            .finish()
    }
}

pub type ActionDef = Arc<dyn ActionDefinition>;

/// Create a fresh instance of a shared definition
pub fn instantiate(definition: &ActionDef) -> Arc<dyn Action> {
    definition.clone().instantiate()
}
