//! Durable outbound queue: one status row per entity.
//!
//! Every enqueue bumps the row's `revision`. Status writes carry the revision
//! of the job they were computed for and are dropped when a newer change has
//! been queued in the meantime, so a slow provider call never clobbers a
//! fresher edit.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};

use super::database::{format_ts, get_ts, SqliteStore};
use super::traits::{StoreResult, SyncStatusStore};
use crate::error::DatabaseError;
use crate::sync::types::{ChangeKind, EntityKind, JobState, StatusCounts, SyncJob};

const JOB_COLUMNS: &str = "entity_kind, entity_id, user_id, change_kind, payload, state,
    attempts, next_attempt_at, last_error, revision, updated_at";

/// Fixed-width UTC form so `next_attempt_at` compares correctly as text.
fn sortable(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn bad_value(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}

fn row_to_job(row: &rusqlite::Row) -> Result<SyncJob, rusqlite::Error> {
    let kind: String = row.get(0)?;
    let change: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let state: String = row.get(5)?;
    Ok(SyncJob {
        entity_kind: EntityKind::parse(&kind).ok_or_else(|| bad_value(0, &kind))?,
        entity_id: row.get(1)?,
        user_id: row.get(2)?,
        change: ChangeKind::parse(&change).ok_or_else(|| bad_value(3, &change))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        state: JobState::parse(&state).ok_or_else(|| bad_value(5, &state))?,
        attempts: row.get(6)?,
        next_attempt_at: get_ts(row, 7)?,
        last_error: row.get(8)?,
        revision: row.get(9)?,
        updated_at: get_ts(row, 10)?,
    })
}

impl SqliteStore {
    fn set_job_state(
        &self,
        job: &SyncJob,
        state: JobState,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let changed = self.conn().execute(
            "UPDATE entity_sync_status
             SET state = ?3, attempts = ?4, next_attempt_at = ?5, last_error = ?6, updated_at = ?7
             WHERE entity_kind = ?1 AND entity_id = ?2 AND revision = ?8",
            params![
                job.entity_kind.as_str(),
                job.entity_id,
                state.as_str(),
                attempts,
                sortable(next_attempt_at),
                error,
                format_ts(Utc::now()),
                job.revision,
            ],
        )?;
        if changed == 0 {
            tracing::debug!(
                kind = job.entity_kind.as_str(),
                entity_id = job.entity_id,
                revision = job.revision,
                "status write superseded by a newer change"
            );
        }
        Ok(())
    }
}

impl SyncStatusStore for SqliteStore {
    fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: i64,
        user_id: &str,
        change: ChangeKind,
        payload: &serde_json::Value,
    ) -> StoreResult<()> {
        let payload =
            serde_json::to_string(payload).map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO entity_sync_status (entity_kind, entity_id, user_id, change_kind,
                 payload, state, attempts, next_attempt_at, last_error, revision, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, NULL, 1, ?7)
             ON CONFLICT(entity_kind, entity_id) DO UPDATE SET
                 user_id = excluded.user_id,
                 change_kind = excluded.change_kind,
                 payload = excluded.payload,
                 state = 'pending',
                 attempts = 0,
                 next_attempt_at = excluded.next_attempt_at,
                 last_error = NULL,
                 revision = entity_sync_status.revision + 1,
                 updated_at = excluded.updated_at",
            params![
                kind.as_str(),
                entity_id,
                user_id,
                change.as_str(),
                payload,
                sortable(now),
                format_ts(now),
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, kind: EntityKind, entity_id: i64) -> StoreResult<Option<SyncJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM entity_sync_status
             WHERE entity_kind = ?1 AND entity_id = ?2"
        );
        Ok(self
            .conn()
            .query_row(&sql, params![kind.as_str(), entity_id], row_to_job)
            .optional()?)
    }

    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<SyncJob>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM entity_sync_status
             WHERE state IN ('pending', 'retrying') AND next_attempt_at <= ?1
             ORDER BY next_attempt_at, updated_at
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let jobs = stmt
            .query_map(params![sortable(now), limit], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn next_due_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let next: Option<String> = self.conn().query_row(
            "SELECT MIN(next_attempt_at) FROM entity_sync_status
             WHERE state IN ('pending', 'retrying')",
            [],
            |row| row.get(0),
        )?;
        next.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| DatabaseError::Corrupt {
                    column: "next_attempt_at",
                    message: e.to_string(),
                })
        })
        .transpose()
    }

    fn mark_synced(&self, job: &SyncJob) -> StoreResult<()> {
        self.set_job_state(job, JobState::Synced, job.attempts, Utc::now(), None)
    }

    fn mark_retry(
        &self,
        job: &SyncJob,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        self.set_job_state(job, JobState::Retrying, attempts, next_attempt_at, Some(error))
    }

    fn mark_failed(&self, job: &SyncJob, attempts: u32, error: &str) -> StoreResult<()> {
        self.set_job_state(job, JobState::Failed, attempts, Utc::now(), Some(error))
    }

    fn mark_skipped(&self, job: &SyncJob, warning: &str) -> StoreResult<()> {
        self.set_job_state(job, JobState::Skipped, job.attempts, Utc::now(), Some(warning))
    }

    fn list_jobs(&self, user_id: &str) -> StoreResult<Vec<SyncJob>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM entity_sync_status
             WHERE user_id = ?1 ORDER BY updated_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![user_id], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn status_counts(&self, user_id: &str) -> StoreResult<StatusCounts> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM entity_sync_status WHERE user_id = ?1 GROUP BY state",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = StatusCounts::default();
        for (state, n) in rows {
            let n = usize::try_from(n).unwrap_or(0);
            match JobState::parse(&state) {
                Some(JobState::Pending) => counts.pending = n,
                Some(JobState::Retrying) => counts.retrying = n,
                Some(JobState::Failed) => counts.failed = n,
                Some(JobState::Skipped) => counts.skipped = n,
                Some(JobState::Synced) | None => {}
            }
        }
        Ok(counts)
    }

    fn requeue_failed(&self, user_id: &str) -> StoreResult<usize> {
        let now = Utc::now();
        let moved = self.conn().execute(
            "UPDATE entity_sync_status
             SET state = 'pending', attempts = 0, next_attempt_at = ?2,
                 revision = revision + 1, updated_at = ?3
             WHERE user_id = ?1 AND state = 'failed'",
            params![user_id, sortable(now), format_ts(now)],
        )?;
        Ok(moved)
    }

    fn reschedule_user(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<usize> {
        let moved = self.conn().execute(
            "UPDATE entity_sync_status SET next_attempt_at = ?2
             WHERE user_id = ?1 AND state IN ('pending', 'retrying')",
            params![user_id, sortable(at)],
        )?;
        Ok(moved)
    }
}
