//! Task admission and cooperative shutdown
//!
//! Every lifecycle and worker task registers with the [`TaskManager`] before
//! doing work. Closing the manager cancels the shared stop token, so every
//! blocking wait that selects on it returns promptly, and then waits for the
//! admitted tasks to leave. No task is admitted after close.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct TaskCounter {
    active: AtomicUsize,
    left: Notify,
}

/// Admission guard shared by all tasks of the upload engine.
#[derive(Debug, Clone)]
pub struct TaskManager {
    stop: CancellationToken,
    closed: Arc<AtomicBool>,
    counter: Arc<TaskCounter>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
            counter: Arc::new(TaskCounter::default()),
        }
    }

    /// Admit a task. The returned guard must be held for the task's life.
    pub fn add(&self) -> Result<TaskGuard> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TaskManagerClosed);
        }
        self.counter.active.fetch_add(1, Ordering::AcqRel);
        // close() may have raced the increment
        if self.closed.load(Ordering::Acquire) {
            self.leave();
            return Err(Error::TaskManagerClosed);
        }
        Ok(TaskGuard {
            counter: Arc::clone(&self.counter),
        })
    }

    /// Token cancelled once shutdown begins.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Number of admitted tasks still running.
    pub fn active(&self) -> usize {
        self.counter.active.load(Ordering::Acquire)
    }

    /// Stop admitting tasks, signal shutdown and wait for admitted tasks.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("task manager already closed");
        }
        self.stop.cancel();
        info!(active = self.active(), "task manager closing");

        loop {
            let left = self.counter.left.notified();
            if self.active() == 0 {
                break;
            }
            left.await;
        }
        info!("task manager closed");
    }

    fn leave(&self) {
        self.counter.active.fetch_sub(1, Ordering::AcqRel);
        self.counter.left.notify_waiters();
    }
}

/// RAII registration of an admitted task.
#[derive(Debug)]
pub struct TaskGuard {
    counter: Arc<TaskCounter>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.active.fetch_sub(1, Ordering::AcqRel);
        self.counter.left.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_add_and_drop() {
        let tm = TaskManager::new();
        let g1 = tm.add().unwrap();
        let g2 = tm.add().unwrap();
        assert_eq!(tm.active(), 2);

        drop(g1);
        assert_eq!(tm.active(), 1);
        drop(g2);
        assert_eq!(tm.active(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_new_tasks() {
        let tm = TaskManager::new();
        tm.close().await;

        assert!(tm.is_stopped());
        assert_matches!(tm.add(), Err(Error::TaskManagerClosed));
    }

    #[tokio::test]
    async fn test_close_waits_for_admitted_tasks() {
        let tm = TaskManager::new();
        let guard = tm.add().unwrap();
        let stop = tm.stop_token().clone();

        let task = tokio::spawn(async move {
            stop.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        tm.close().await;
        assert_eq!(tm.active(), 0);
        task.await.unwrap();
    }
}
