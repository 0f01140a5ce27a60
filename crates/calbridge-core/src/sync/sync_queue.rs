//! Outbound sync queue.
//!
//! A thin handle over the durable `entity_sync_status` table plus a
//! [`Notify`] that wakes the background worker. Enqueueing never waits on
//! the provider.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::model::{Routine, Task};
use crate::storage::traits::SyncStore;
use crate::sync::types::{ChangeKind, EntityKind, JobState, SyncError};

#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn SyncStore>,
    notify: Arc<Notify>,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Queue a task change and wake the worker.
    pub fn enqueue_task(&self, task: &Task, change: ChangeKind) -> Result<(), SyncError> {
        let payload = serde_json::to_value(task)?;
        self.store
            .enqueue(EntityKind::Task, task.id, &task.user_id, change, &payload)?;
        tracing::debug!(
            task_id = task.id,
            change = change.as_str(),
            "task queued for outbound sync"
        );
        self.wake();
        Ok(())
    }

    /// Queue a routine change and wake the worker.
    pub fn enqueue_routine(&self, routine: &Routine, change: ChangeKind) -> Result<(), SyncError> {
        let payload = serde_json::to_value(routine)?;
        self.store
            .enqueue(EntityKind::Routine, routine.id, &routine.user_id, change, &payload)?;
        tracing::debug!(
            routine_id = routine.id,
            change = change.as_str(),
            "routine queued for outbound sync"
        );
        self.wake();
        Ok(())
    }

    /// Whether the entity has a change waiting to be pushed.
    pub fn has_pending(&self, kind: EntityKind, entity_id: i64) -> Result<bool, SyncError> {
        Ok(self
            .store
            .get_job(kind, entity_id)?
            .is_some_and(|job| matches!(job.state, JobState::Pending | JobState::Retrying)))
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves on the next [`wake`](Self::wake), or immediately if one
    /// happened since the last wait.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Time until the earliest queued job is due; zero when one is overdue.
    pub fn time_until_next(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<std::time::Duration>, SyncError> {
        Ok(self
            .store
            .next_due_at()?
            .map(|at| (at - now).to_std().unwrap_or_default()))
    }
}
