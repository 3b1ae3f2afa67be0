//! Timed event queue
//!
//! Events are kept sorted by deadline and fired by a single background task
//! that sleeps until the earliest deadline. Adding an earlier event wakes the
//! task so it can re-arm its sleep. A removed event never fires, and every
//! event fires at most once.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Receives a callback when its deadline passes
pub trait TimedEventListener: Send + Sync {
    fn timed_event_occurred(&self);
}

/// Handle used to cancel a pending timed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimedEventId(u64);

#[derive(Default)]
struct Pending {
    by_deadline: BTreeMap<(Instant, u64), Arc<dyn TimedEventListener>>,
    deadlines: HashMap<u64, Instant>,
}

struct Shared {
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    wakeup: Notify,
    shutdown: CancellationToken,
}

/// Sorted queue of timed events fired by a background tokio task
#[derive(Clone)]
pub struct TimedEventQueue {
    shared: Arc<Shared>,
}

impl TimedEventQueue {
    /// Create the queue and spawn its firing task on the current runtime
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run(shared.clone()));

        Self { shared }
    }

    /// Schedule `listener` to fire after `delay`
    pub fn add(&self, delay: Duration, listener: Arc<dyn TimedEventListener>) -> TimedEventId {
        self.add_at(Instant::now() + delay, listener)
    }

    /// Schedule `listener` to fire at `deadline`
    pub fn add_at(&self, deadline: Instant, listener: Arc<dyn TimedEventListener>) -> TimedEventId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.by_deadline.insert((deadline, id), listener);
            pending.deadlines.insert(id, deadline);
        }

        self.shared.wakeup.notify_one();
        TimedEventId(id)
    }

    /// Cancel a pending event. Returns false if it already fired or was removed.
    pub fn remove(&self, id: TimedEventId) -> bool {
        let Ok(mut pending) = self.shared.pending.lock() else {
            return false;
        };

        match pending.deadlines.remove(&id.0) {
            Some(deadline) => pending.by_deadline.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.shared
            .pending
            .lock()
            .map(|pending| pending.by_deadline.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the firing task; pending events are dropped
    pub fn end(&self) {
        self.shared.shutdown.cancel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.by_deadline.clear();
            pending.deadlines.clear();
        }
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        let next_deadline = shared
            .pending
            .lock()
            .ok()
            .and_then(|pending| pending.by_deadline.keys().next().map(|(deadline, _)| *deadline));

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => fire_due(&shared),
                    _ = shared.wakeup.notified() => {}
                    _ = shared.shutdown.cancelled() => break,
                }
            }
            None => {
                tokio::select! {
                    _ = shared.wakeup.notified() => {}
                    _ = shared.shutdown.cancelled() => break,
                }
            }
        }
    }

    tracing::debug!("Timed event queue stopped");
}

fn fire_due(shared: &Shared) {
    let now = Instant::now();
    let mut due = Vec::new();

    if let Ok(mut pending) = shared.pending.lock() {
        while let Some(entry) = pending.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), listener) = entry.remove_entry();
            pending.deadlines.remove(&id);
            due.push(listener);
        }
    }

    // Listeners run without the queue lock so they may add or remove events
    for listener in due {
        listener.timed_event_occurred();
    }
}
