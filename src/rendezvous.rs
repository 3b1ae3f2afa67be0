//! Waiting for an external operation and the nested action run beside it
//!
//! Process and job actions may run a nested action on a child thread while
//! their external operation is in flight. The action finishes only once both
//! are done, whichever order they finish in.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::action::{instantiate, ActionDef};
use crate::condition::Hold;
use crate::errors::EngineError;
use crate::thread::{Thread, ThreadCompleteListener};
use crate::types::{ThreadEndCode, Value};

#[derive(Debug, Default)]
pub struct Rendezvous {
    external_running: bool,
    children: BTreeMap<u64, Arc<Thread>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn external_started(&mut self) {
        self.external_running = true;
    }

    /// Returns true if the external operation was running
    pub fn external_finished(&mut self) -> bool {
        std::mem::replace(&mut self.external_running, false)
    }

    pub fn is_external_running(&self) -> bool {
        self.external_running
    }

    pub fn add_child(&mut self, child: Arc<Thread>) {
        self.children.insert(child.number(), child);
    }

    /// Forget a finished child; returns true once no child remains
    pub fn child_finished(&mut self, number: u64) -> bool {
        self.children.remove(&number);
        self.children.is_empty()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn children(&self) -> Vec<Arc<Thread>> {
        self.children.values().cloned().collect()
    }

    /// Both the external operation and the nested action are done
    pub fn is_ready(&self) -> bool {
        !self.external_running && self.children.is_empty()
    }

    /// Hold `thread` and ask every child to stop
    ///
    /// Returns false if there was nothing to wait for.
    pub fn stop_children(&self, thread: &Thread, hard_hold: &Hold) -> bool {
        if self.children.is_empty() {
            return false;
        }

        thread.add_hold(hard_hold);
        for child in self.children.values() {
            child.terminate(ThreadEndCode::StoppedByParent);
        }
        true
    }
}

/// Run a fresh instance of `action` on a new child of `thread`
///
/// `vars` are set on the child before it starts; `listener` hears when the
/// child finishes.
pub fn start_nested(
    thread: &Arc<Thread>,
    action: &ActionDef,
    vars: &[(&str, Value)],
    listener: Arc<dyn ThreadCompleteListener>,
) -> Result<Arc<Thread>, EngineError> {
    let child = thread.create_child_thread()?;

    for (name, value) in vars {
        child.set_var(*name, value.clone());
    }
    child.add_completion_listener(listener);
    child.push_action(instantiate(action));

    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_needs_both_sides() {
        let mut rendezvous = Rendezvous::new();
        assert!(rendezvous.is_ready());

        rendezvous.external_started();
        assert!(!rendezvous.is_ready());
        assert!(rendezvous.external_finished());
        assert!(!rendezvous.external_finished());
        assert!(rendezvous.is_ready());
    }
}
