//! Holds and conditions
//!
//! A thread tracks two separate things:
//! - holds: what the thread is waiting for (soft or hard)
//! - pending conditions: events that the top action must handle
//!
//! Both are visited in a fixed priority order (lower value first):
//!
//! | priority | entry            |
//! |----------|------------------|
//! | 100      | hard hold        |
//! | 200      | terminate        |
//! | 400      | soft hold        |
//! | 700      | return           |
//!
//! A hard hold blocks the thread even when a terminate is pending. A
//! terminate is delivered past a soft hold. A return is only delivered once
//! no hold remains.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Value;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub const HARD_HOLD_PRIORITY: u16 = 100;
pub const TERMINATE_PRIORITY: u16 = 200;
pub const SOFT_HOLD_PRIORITY: u16 = 400;
pub const RETURN_PRIORITY: u16 = 700;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldKind {
    /// Removed by whatever satisfies it; a terminate is still delivered
    Soft,
    /// Blocks everything until the action's children have all completed
    Hard,
}

/// A marker that keeps a thread from running
///
/// Each hold has its own identity, so adding or removing the same hold twice
/// is a no-op and never affects another action's hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    id: u64,
    kind: HoldKind,
    reason: String,
}

impl Hold {
    pub fn soft(reason: impl Into<String>) -> Self {
        Self {
            id: next_id(),
            kind: HoldKind::Soft,
            reason: reason.into(),
        }
    }

    pub fn hard(reason: impl Into<String>) -> Self {
        Self {
            id: next_id(),
            kind: HoldKind::Hard,
            reason: reason.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> HoldKind {
        self.kind
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn priority(&self) -> u16 {
        match self.kind {
            HoldKind::Hard => HARD_HOLD_PRIORITY,
            HoldKind::Soft => SOFT_HOLD_PRIORITY,
        }
    }
}

/// An event delivered to the top action's `handle_condition`
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Terminate,
    Return { id: u64, value: Value },
}

impl Condition {
    pub fn returning(value: Value) -> Self {
        Condition::Return { id: next_id(), value }
    }

    pub fn priority(&self) -> u16 {
        match self {
            Condition::Terminate => TERMINATE_PRIORITY,
            Condition::Return { .. } => RETURN_PRIORITY,
        }
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Condition::Return { .. })
    }

    fn same_as(&self, other: &Condition) -> bool {
        match (self, other) {
            (Condition::Terminate, Condition::Terminate) => true,
            (Condition::Return { id: a, .. }, Condition::Return { id: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// What the thread should do next
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    Blocked(HoldKind),
    Deliver(Condition),
    Execute,
}

/// Holds plus pending conditions for one thread
#[derive(Debug, Default)]
pub struct ConditionSet {
    holds: BTreeMap<u64, Hold>,
    pending: BTreeMap<(u16, u64), Condition>,
    sequence: u64,
}

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the hold was already present
    pub fn add_hold(&mut self, hold: &Hold) -> bool {
        self.holds.insert(hold.id, hold.clone()).is_none()
    }

    /// Returns false if the hold was not present
    pub fn remove_hold(&mut self, hold: &Hold) -> bool {
        self.holds.remove(&hold.id).is_some()
    }

    pub fn contains_hold(&self, hold: &Hold) -> bool {
        self.holds.contains_key(&hold.id)
    }

    pub fn holds(&self) -> impl Iterator<Item = &Hold> {
        self.holds.values()
    }

    pub fn has_hold(&self, kind: HoldKind) -> bool {
        self.holds.values().any(|hold| hold.kind == kind)
    }

    /// Add a pending condition. A terminate is only ever pending once.
    pub fn raise(&mut self, condition: Condition) -> bool {
        if self.pending.values().any(|existing| existing.same_as(&condition)) {
            return false;
        }

        self.sequence += 1;
        self.pending
            .insert((condition.priority(), self.sequence), condition);
        true
    }

    /// Remove a pending condition; absent conditions are ignored
    pub fn remove(&mut self, condition: &Condition) -> bool {
        let key = self
            .pending
            .iter()
            .find(|(_, existing)| existing.same_as(condition))
            .map(|(key, _)| *key);

        match key {
            Some(key) => self.pending.remove(&key).is_some(),
            None => false,
        }
    }

    /// Remove every pending condition matching `predicate`
    pub fn remove_where(&mut self, predicate: impl Fn(&Condition) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, condition| !predicate(condition));
        before - self.pending.len()
    }

    pub fn has_pending(&self, predicate: impl Fn(&Condition) -> bool) -> bool {
        self.pending.values().any(predicate)
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty() && self.pending.is_empty()
    }

    /// Decide what the owning thread does next, in priority order
    pub fn next(&self) -> Next {
        if self.has_hold(HoldKind::Hard) {
            return Next::Blocked(HoldKind::Hard);
        }

        let top = self.pending.values().next();

        if let Some(condition) = top {
            if condition.priority() < SOFT_HOLD_PRIORITY {
                return Next::Deliver(condition.clone());
            }
        }

        if self.has_hold(HoldKind::Soft) {
            return Next::Blocked(HoldKind::Soft);
        }

        match top {
            Some(condition) => Next::Deliver(condition.clone()),
            None => Next::Execute,
        }
    }
}
