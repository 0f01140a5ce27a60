//! Store interfaces consumed by the sync pipeline.
//!
//! The application's own CRUD layer owns tasks and routines; sync reaches
//! them only through these traits. [`super::SqliteStore`] implements all of
//! them over one SQLite connection.

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::DatabaseError;
use crate::model::{CalendarLink, Routine, RoutineEventRecord, Task};
use crate::sync::types::{ChangeKind, EntityKind, StatusCounts, SyncJob};

pub type StoreResult<T> = Result<T, DatabaseError>;

/// Read/write access to CalendarLink rows (at most one per user).
pub trait LinkStore: Send + Sync {
    fn get_link(&self, user_id: &str) -> StoreResult<Option<CalendarLink>>;

    /// Insert or replace the user's link (new consent). Returns the stored row.
    fn save_link(&self, link: &CalendarLink) -> StoreResult<CalendarLink>;

    /// Write `link` if the stored version still equals `link.version`.
    ///
    /// Fails with [`DatabaseError::VersionConflict`] otherwise. Returns the
    /// stored row with its new version.
    fn update_link(&self, link: &CalendarLink) -> StoreResult<CalendarLink>;

    fn delete_link(&self, user_id: &str) -> StoreResult<()>;

    fn list_links(&self) -> StoreResult<Vec<CalendarLink>>;
}

pub trait TaskStore: Send + Sync {
    /// Insert a task; `task.id == 0` lets the database pick one.
    fn create_task(&self, task: &Task) -> StoreResult<i64>;
    fn get_task(&self, id: i64) -> StoreResult<Option<Task>>;
    fn update_task(&self, task: &Task) -> StoreResult<()>;
    fn delete_task(&self, id: i64) -> StoreResult<()>;
    fn list_tasks(&self, user_id: &str) -> StoreResult<Vec<Task>>;
    fn find_task_by_event(&self, user_id: &str, event_id: &str) -> StoreResult<Option<Task>>;

    /// Set the provider mapping of a task without touching its content.
    fn set_task_sync(
        &self,
        id: i64,
        event_id: Option<&str>,
        calendar_id: Option<&str>,
        synced_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Non-private dated tasks that were never pushed or changed since.
    fn list_pending_outbound(&self, user_id: &str) -> StoreResult<Vec<Task>>;

    /// Insert or overwrite the task holding `task.event_id`. Returns its id.
    fn upsert_from_inbound(&self, task: &Task) -> StoreResult<i64>;
}

pub trait RoutineStore: Send + Sync {
    fn create_routine(&self, routine: &Routine) -> StoreResult<i64>;
    fn get_routine(&self, id: i64) -> StoreResult<Option<Routine>>;
    fn list_routines(&self, user_id: &str) -> StoreResult<Vec<Routine>>;
    fn delete_routine(&self, id: i64) -> StoreResult<()>;

    /// Update title/description only. Schedule and completion stay untouched.
    fn update_routine_display(
        &self,
        id: i64,
        title: &str,
        description: Option<&str>,
    ) -> StoreResult<()>;
}

/// Routine occurrence records and materialization windows.
pub trait LedgerStore: Send + Sync {
    fn routine_records(&self, routine_id: i64) -> StoreResult<Vec<RoutineEventRecord>>;
    fn find_routine_record(&self, event_id: &str) -> StoreResult<Option<RoutineEventRecord>>;
    fn insert_routine_record(&self, record: &RoutineEventRecord) -> StoreResult<()>;
    fn delete_routine_record(&self, routine_id: i64, date: NaiveDate) -> StoreResult<()>;
    /// Returns whether a record was removed.
    fn delete_routine_record_by_event(&self, event_id: &str) -> StoreResult<bool>;
    fn delete_routine_records(&self, routine_id: i64) -> StoreResult<usize>;
    fn routine_window_end(&self, routine_id: i64) -> StoreResult<Option<NaiveDate>>;

    /// Window refresh as one transaction: drop records dated before
    /// `stale_before`, insert `new_records`, and move the window end (if
    /// `window_end` is given).
    fn commit_routine_window(
        &self,
        routine_id: i64,
        stale_before: NaiveDate,
        new_records: &[RoutineEventRecord],
        window_end: Option<NaiveDate>,
    ) -> StoreResult<()>;

    fn delete_routine_window(&self, routine_id: i64) -> StoreResult<()>;

    /// Forget every provider mapping owned by `user_id` (on disconnect).
    fn clear_user_ledger(&self, user_id: &str) -> StoreResult<()>;
}

/// Durable outbound queue; one row per entity.
pub trait SyncStatusStore: Send + Sync {
    /// Queue a change, replacing any pending change for the same entity.
    fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: i64,
        user_id: &str,
        change: ChangeKind,
        payload: &serde_json::Value,
    ) -> StoreResult<()>;

    fn get_job(&self, kind: EntityKind, entity_id: i64) -> StoreResult<Option<SyncJob>>;

    /// Pending/retrying jobs whose next attempt is due, oldest first.
    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<SyncJob>>;

    /// Earliest next attempt among pending/retrying jobs.
    fn next_due_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

    fn mark_synced(&self, job: &SyncJob) -> StoreResult<()>;
    fn mark_retry(
        &self,
        job: &SyncJob,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()>;
    fn mark_failed(&self, job: &SyncJob, attempts: u32, error: &str) -> StoreResult<()>;
    fn mark_skipped(&self, job: &SyncJob, warning: &str) -> StoreResult<()>;

    fn list_jobs(&self, user_id: &str) -> StoreResult<Vec<SyncJob>>;
    fn status_counts(&self, user_id: &str) -> StoreResult<StatusCounts>;

    /// Move failed jobs back to pending. Returns how many were moved.
    fn requeue_failed(&self, user_id: &str) -> StoreResult<usize>;

    /// Make every pending/retrying job of `user_id` due at `at` (used to
    /// release jobs parked while the link was disconnected).
    fn reschedule_user(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<usize>;
}

/// Everything the sync engine needs from storage.
pub trait SyncStore: LinkStore + TaskStore + RoutineStore + LedgerStore + SyncStatusStore {}

impl<T> SyncStore for T where
    T: LinkStore + TaskStore + RoutineStore + LedgerStore + SyncStatusStore
{
}
