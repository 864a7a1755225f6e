//! Handle to a polling task.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::Resolvable;

/// Receives each result of a polled lookup until it turns terminal.
///
/// The polling task belongs to the subscription: dropping (or cancelling)
/// it aborts the task, and nothing is published afterwards.
#[derive(Debug)]
pub struct PollSubscription<T> {
    rx: watch::Receiver<Option<T>>,
    task: JoinHandle<()>,
}

impl<T: Resolvable> PollSubscription<T> {
    pub(crate) fn new(rx: watch::Receiver<Option<T>>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Most recently published result, `None` before the first fetch ends.
    pub fn latest(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next published result. `None` once polling has ended
    /// and every result has been seen.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }

    /// Wait until a terminal result is published. If polling ends without
    /// one, returns the last result seen.
    pub async fn wait_terminal(&mut self) -> Option<T> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(result) = current.as_ref() {
                if result.status().is_terminal() {
                    return current;
                }
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow_and_update().clone();
            }
        }
    }

    /// Whether the polling task has ended (terminal result, or aborted).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop polling now.
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl<T> Drop for PollSubscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
