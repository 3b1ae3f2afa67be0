//! Runs runnable threads on a pool of tokio worker tasks

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::thread::Thread;

pub const DEFAULT_MAX_NON_BLOCKING_ACTIONS: usize = 100;

/// Queue of runnable threads shared by every job of an engine
#[derive(Clone)]
pub struct Scheduler {
    sender: mpsc::UnboundedSender<Arc<Thread>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Spawn `workers` tasks that each run one thread at a time
    pub fn start(workers: usize, max_non_blocking_actions: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Arc<Thread>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let shutdown = CancellationToken::new();
        let max_actions = max_non_blocking_actions.max(1);

        for worker in 0..workers.max(1) {
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                tracing::trace!(worker, "Scheduler worker started");

                loop {
                    let next = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            thread = receiver.recv() => thread,
                            _ = shutdown.cancelled() => None,
                        }
                    };

                    let Some(thread) = next else {
                        break;
                    };

                    thread.run(max_actions);
                    tokio::task::yield_now().await;
                }

                tracing::trace!(worker, "Scheduler worker stopped");
            });
        }

        Self { sender, shutdown }
    }

    pub fn enqueue(&self, thread: Arc<Thread>) {
        if self.sender.send(thread).is_err() {
            tracing::warn!("Scheduler is shut down; thread not run");
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
