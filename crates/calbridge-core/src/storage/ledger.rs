//! Routine occurrence records and materialization windows.
//!
//! A record ties one (routine, date) pair to the provider event created for
//! it. The window row holds the last date that has been materialized.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use super::database::{format_date, format_ts, get_date, get_ts, SqliteStore};
use super::traits::{LedgerStore, StoreResult};
use crate::model::RoutineEventRecord;

const RECORD_COLUMNS: &str = "routine_id, occurrence_date, event_id, calendar_id, created_at";

fn row_to_record(row: &rusqlite::Row) -> Result<RoutineEventRecord, rusqlite::Error> {
    Ok(RoutineEventRecord {
        routine_id: row.get(0)?,
        occurrence_date: get_date(row, 1)?,
        event_id: row.get(2)?,
        calendar_id: row.get(3)?,
        created_at: get_ts(row, 4)?,
    })
}

fn insert_record(conn: &Connection, record: &RoutineEventRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO routine_event_records
             (routine_id, occurrence_date, event_id, calendar_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.routine_id,
            format_date(record.occurrence_date),
            record.event_id,
            record.calendar_id,
            format_ts(record.created_at),
        ],
    )?;
    Ok(())
}

impl LedgerStore for SqliteStore {
    fn routine_records(&self, routine_id: i64) -> StoreResult<Vec<RoutineEventRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM routine_event_records
             WHERE routine_id = ?1 ORDER BY occurrence_date"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![routine_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn find_routine_record(&self, event_id: &str) -> StoreResult<Option<RoutineEventRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM routine_event_records WHERE event_id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![event_id], row_to_record)
            .optional()?)
    }

    fn insert_routine_record(&self, record: &RoutineEventRecord) -> StoreResult<()> {
        insert_record(&self.conn(), record)
    }

    fn delete_routine_record(&self, routine_id: i64, date: NaiveDate) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM routine_event_records WHERE routine_id = ?1 AND occurrence_date = ?2",
            params![routine_id, format_date(date)],
        )?;
        Ok(())
    }

    fn delete_routine_record_by_event(&self, event_id: &str) -> StoreResult<bool> {
        let removed = self.conn().execute(
            "DELETE FROM routine_event_records WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(removed > 0)
    }

    fn delete_routine_records(&self, routine_id: i64) -> StoreResult<usize> {
        let removed = self.conn().execute(
            "DELETE FROM routine_event_records WHERE routine_id = ?1",
            params![routine_id],
        )?;
        Ok(removed)
    }

    fn routine_window_end(&self, routine_id: i64) -> StoreResult<Option<NaiveDate>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT window_end FROM routine_windows WHERE routine_id = ?1",
                params![routine_id],
                |row| get_date(row, 0),
            )
            .optional()?)
    }

    fn commit_routine_window(
        &self,
        routine_id: i64,
        stale_before: NaiveDate,
        new_records: &[RoutineEventRecord],
        window_end: Option<NaiveDate>,
    ) -> StoreResult<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "DELETE FROM routine_event_records WHERE routine_id = ?1 AND occurrence_date < ?2",
            params![routine_id, format_date(stale_before)],
        )?;
        for record in new_records {
            insert_record(&tx, record)?;
        }
        if let Some(end) = window_end {
            tx.execute(
                "INSERT INTO routine_windows (routine_id, window_end) VALUES (?1, ?2)
                 ON CONFLICT(routine_id) DO UPDATE SET window_end = excluded.window_end",
                params![routine_id, format_date(end)],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_routine_window(&self, routine_id: i64) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM routine_windows WHERE routine_id = ?1",
            params![routine_id],
        )?;
        Ok(())
    }

    fn clear_user_ledger(&self, user_id: &str) -> StoreResult<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "DELETE FROM routine_event_records
             WHERE routine_id IN (SELECT id FROM routines WHERE user_id = ?1)",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM routine_windows
             WHERE routine_id IN (SELECT id FROM routines WHERE user_id = ?1)",
            params![user_id],
        )?;
        tx.execute(
            "UPDATE tasks SET event_id = NULL, calendar_id = NULL, last_synced_at = NULL
             WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM entity_sync_status WHERE user_id = ?1",
            params![user_id],
        )?;

        tx.commit()?;
        Ok(())
    }
}
