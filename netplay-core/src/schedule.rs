//! Explicit scheduled tasks with per-room cancellation.
//!
//! Deferred work (slot reclamation after the reconnection grace period) is
//! described by a [`ScheduledTask`] value and run on a tokio task owned by the
//! room's [`RoomTimers`]. At most one task is outstanding per identity;
//! scheduling again replaces it. Deleting the room cancels everything.
//!
//! Tasks re-validate their target when they fire: the room may have been
//! deleted, or the identity may have reconnected, in the meantime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Deferred reclamation of one identity's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub room_id: String,
    pub identity: String,
    /// Disconnect epoch the task was scheduled for
    pub epoch: u64,
    pub deadline: Instant,
}

#[derive(Default)]
pub struct RoomTimers {
    tasks: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
}

impl RoomTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` at the task's deadline, replacing any task already
    /// pending for the same identity.
    pub fn schedule<F, Fut>(&self, task: ScheduledTask, action: F)
    where
        F: FnOnce(ScheduledTask) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let identity = task.identity.clone();
        let epoch = task.epoch;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(task.deadline).await;
            action(task).await;
        });

        let mut tasks = self.lock();
        if let Some((_, previous)) = tasks.insert(identity, (epoch, handle)) {
            previous.abort();
        }
    }

    /// Cancel the pending task for `identity`, if any.
    pub fn cancel(&self, identity: &str) -> bool {
        match self.lock().remove(identity) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget a task that has fired. Only removes the entry if it still
    /// belongs to `epoch`, so a fired task never drops its replacement.
    pub fn complete(&self, identity: &str, epoch: u64) {
        let mut tasks = self.lock();
        if tasks.get(identity).is_some_and(|(e, _)| *e == epoch) {
            tasks.remove(identity);
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, handle)) in self.lock().drain() {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, JoinHandle<()>)>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RoomTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
