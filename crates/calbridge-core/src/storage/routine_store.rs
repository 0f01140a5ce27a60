use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};

use super::database::{format_time, format_ts, get_opt_time, get_ts, SqliteStore};
use super::traits::{RoutineStore, StoreResult};
use crate::error::DatabaseError;
use crate::model::Routine;

const ROUTINE_COLUMNS: &str = "id, user_id, title, description, days, start_time,
    duration_minutes, private, completed_count, updated_at";

fn row_to_routine(row: &rusqlite::Row) -> Result<Routine, rusqlite::Error> {
    let days_json: String = row.get(4)?;
    let days = serde_json::from_str(&days_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Routine {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        days,
        start_time: get_opt_time(row, 5)?,
        duration_minutes: row.get(6)?,
        private: row.get(7)?,
        completed_count: row.get(8)?,
        updated_at: get_ts(row, 9)?,
    })
}

impl RoutineStore for SqliteStore {
    fn create_routine(&self, routine: &Routine) -> StoreResult<i64> {
        let days = serde_json::to_string(&routine.days)
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO routines (id, user_id, title, description, days, start_time,
                 duration_minutes, private, completed_count, updated_at)
             VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                routine.id,
                routine.user_id,
                routine.title,
                routine.description,
                days,
                routine.start_time.map(format_time),
                routine.duration_minutes,
                routine.private,
                routine.completed_count,
                format_ts(routine.updated_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_routine(&self, id: i64) -> StoreResult<Option<Routine>> {
        let sql = format!("SELECT {ROUTINE_COLUMNS} FROM routines WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id], row_to_routine)
            .optional()?)
    }

    fn list_routines(&self, user_id: &str) -> StoreResult<Vec<Routine>> {
        let conn = self.conn();
        let sql = format!("SELECT {ROUTINE_COLUMNS} FROM routines WHERE user_id = ?1 ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let routines = stmt
            .query_map(params![user_id], row_to_routine)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(routines)
    }

    fn delete_routine(&self, id: i64) -> StoreResult<()> {
        self.conn()
            .execute("DELETE FROM routines WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn update_routine_display(
        &self,
        id: i64,
        title: &str,
        description: Option<&str>,
    ) -> StoreResult<()> {
        let changed = self.conn().execute(
            "UPDATE routines SET title = ?2, description = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, title, description, format_ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "routine",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
