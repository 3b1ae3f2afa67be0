//! Correlation of asynchronous completions with waiting actions
//!
//! An external operation can finish before the action that started it has
//! registered to wait for it. Each key therefore holds either the waiter or
//! the completion that arrived first, and whichever side arrives second takes
//! the entry out and resolves it.
//!
//! `CorrelationMap` itself is not synchronized; it lives inside a
//! [`SharedMap`], whose lock makes every check-then-act atomic.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::EngineError;

enum Entry<W, C> {
    Waiting(Arc<W>),
    Completed(C),
}

/// Outcome of registering a waiter
pub enum Registration<C> {
    /// The waiter is parked until the completion arrives
    Registered,
    /// The completion was already here; the entry has been removed
    AlreadyCompleted(C),
}

/// Outcome of delivering a completion
pub enum Delivery<W, C> {
    /// A waiter was registered; the entry has been removed
    Waiter(Arc<W>, C),
    /// Nobody is waiting yet; the completion is parked under the key
    Parked,
    /// The waiter gave up on the key; the completion is discarded
    Dropped,
}

pub struct CorrelationMap<K, W, C> {
    entries: HashMap<K, Entry<W, C>>,
    /// Keys whose waiter unregistered before its completion arrived
    abandoned: HashSet<K>,
}

impl<K: Eq + Hash, W, C> CorrelationMap<K, W, C> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            abandoned: HashSet::new(),
        }
    }

    /// Register `waiter` under `key`, or take a completion that arrived first
    pub fn register(&mut self, key: K, waiter: Arc<W>) -> Registration<C> {
        self.abandoned.remove(&key);
        match self.entries.remove(&key) {
            Some(Entry::Completed(completion)) => Registration::AlreadyCompleted(completion),
            // A second registration replaces a stale waiter
            Some(Entry::Waiting(_)) | None => {
                self.entries.insert(key, Entry::Waiting(waiter));
                Registration::Registered
            }
        }
    }

    /// Deliver `completion` for `key`, or park it until a waiter registers
    pub fn complete(&mut self, key: K, completion: C) -> Delivery<W, C> {
        if self.abandoned.remove(&key) {
            return Delivery::Dropped;
        }
        match self.entries.remove(&key) {
            Some(Entry::Waiting(waiter)) => Delivery::Waiter(waiter, completion),
            // Only the latest completion for a key is kept
            Some(Entry::Completed(_)) | None => {
                self.entries.insert(key, Entry::Completed(completion));
                Delivery::Parked
            }
        }
    }

    pub fn waiters(&self) -> Vec<Arc<W>> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Waiting(waiter) => Some(waiter.clone()),
                Entry::Completed(_) => None,
            })
            .collect()
    }

    pub fn is_waiting(&self, key: &K) -> bool {
        matches!(self.entries.get(key), Some(Entry::Waiting(_)))
    }

    pub fn is_parked(&self, key: &K) -> bool {
        matches!(self.entries.get(key), Some(Entry::Completed(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Clone, W, C> CorrelationMap<K, W, C> {
    /// Drop the entry for `key` if it is a waiter; parked completions stay
    ///
    /// A completion that arrives later for an unregistered waiter is dropped
    /// instead of parked.
    pub fn unregister(&mut self, key: &K) -> Option<Arc<W>> {
        if !self.is_waiting(key) {
            return None;
        }

        match self.entries.remove(key) {
            Some(Entry::Waiting(waiter)) => {
                self.abandoned.insert(key.clone());
                Some(waiter)
            }
            _ => None,
        }
    }

    /// Keys that have a registered waiter
    pub fn waiting_keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Waiting(_)))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl<K: Eq + Hash, W, C> Default for CorrelationMap<K, W, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// A job-scoped structure that exists between `init_job` and `terminate_job`
///
/// Access after teardown reports `DoesNotExist` instead of panicking, since a
/// late callback can race a terminating job.
pub struct SharedMap<T> {
    name: &'static str,
    inner: Mutex<Option<T>>,
}

impl<T> SharedMap<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn install(&self, value: T) {
        *self.lock() = Some(value);
    }

    pub fn teardown(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn is_installed(&self) -> bool {
        self.lock().is_some()
    }

    /// Run `f` under the map's lock
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, EngineError> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(value) => Ok(f(value)),
            None => Err(EngineError::DoesNotExist(self.name.to_string())),
        }
    }
}
