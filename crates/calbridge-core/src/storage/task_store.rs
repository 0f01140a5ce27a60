//! Task rows as seen by the sync pipeline.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::database::{
    format_date, format_time, format_ts, get_opt_date, get_opt_time, get_opt_ts, get_ts,
    SqliteStore,
};
use super::traits::{StoreResult, TaskStore};
use crate::error::DatabaseError;
use crate::model::Task;

const TASK_COLUMNS: &str = "id, user_id, title, description, date, start_time, end_time,
    all_day, private, event_id, calendar_id, last_synced_at, updated_at";

fn row_to_task(row: &rusqlite::Row) -> Result<Task, rusqlite::Error> {
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        date: get_opt_date(row, 4)?,
        start_time: get_opt_time(row, 5)?,
        end_time: get_opt_time(row, 6)?,
        all_day: row.get(7)?,
        private: row.get(8)?,
        event_id: row.get(9)?,
        calendar_id: row.get(10)?,
        last_synced_at: get_opt_ts(row, 11)?,
        updated_at: get_ts(row, 12)?,
    })
}

fn insert_task(conn: &Connection, task: &Task) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO tasks (id, user_id, title, description, date, start_time, end_time,
             all_day, private, event_id, calendar_id, last_synced_at, updated_at)
         VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            task.id,
            task.user_id,
            task.title,
            task.description,
            task.date.map(format_date),
            task.start_time.map(format_time),
            task.end_time.map(format_time),
            task.all_day,
            task.private,
            task.event_id,
            task.calendar_id,
            task.last_synced_at.map(format_ts),
            format_ts(task.updated_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn write_task(conn: &Connection, task: &Task) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE tasks SET user_id = ?2, title = ?3, description = ?4, date = ?5,
             start_time = ?6, end_time = ?7, all_day = ?8, private = ?9, event_id = ?10,
             calendar_id = ?11, last_synced_at = ?12, updated_at = ?13
         WHERE id = ?1",
        params![
            task.id,
            task.user_id,
            task.title,
            task.description,
            task.date.map(format_date),
            task.start_time.map(format_time),
            task.end_time.map(format_time),
            task.all_day,
            task.private,
            task.event_id,
            task.calendar_id,
            task.last_synced_at.map(format_ts),
            format_ts(task.updated_at),
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "task",
            id: task.id.to_string(),
        });
    }
    Ok(())
}

fn query_tasks(conn: &Connection, filter: &str, user_id: &str) -> StoreResult<Vec<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {filter} ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(params![user_id], row_to_task)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
}

impl TaskStore for SqliteStore {
    fn create_task(&self, task: &Task) -> StoreResult<i64> {
        insert_task(&self.conn(), task)
    }

    fn get_task(&self, id: i64) -> StoreResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id], row_to_task)
            .optional()?)
    }

    fn update_task(&self, task: &Task) -> StoreResult<()> {
        write_task(&self.conn(), task)
    }

    fn delete_task(&self, id: i64) -> StoreResult<()> {
        self.conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn list_tasks(&self, user_id: &str) -> StoreResult<Vec<Task>> {
        query_tasks(&self.conn(), "user_id = ?1", user_id)
    }

    fn find_task_by_event(&self, user_id: &str, event_id: &str) -> StoreResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 AND event_id = ?2");
        Ok(self
            .conn()
            .query_row(&sql, params![user_id, event_id], row_to_task)
            .optional()?)
    }

    fn set_task_sync(
        &self,
        id: i64,
        event_id: Option<&str>,
        calendar_id: Option<&str>,
        synced_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let changed = self.conn().execute(
            "UPDATE tasks SET event_id = ?2, calendar_id = ?3, last_synced_at = ?4 WHERE id = ?1",
            params![id, event_id, calendar_id, synced_at.map(format_ts)],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn list_pending_outbound(&self, user_id: &str) -> StoreResult<Vec<Task>> {
        let tasks = query_tasks(
            &self.conn(),
            "user_id = ?1 AND private = 0 AND date IS NOT NULL",
            user_id,
        )?;
        Ok(tasks
            .into_iter()
            .filter(|t| match (&t.event_id, t.last_synced_at) {
                (Some(_), Some(synced)) => t.updated_at > synced,
                _ => true,
            })
            .collect())
    }

    fn upsert_from_inbound(&self, task: &Task) -> StoreResult<i64> {
        let conn = self.conn();
        let existing = match &task.event_id {
            Some(event_id) => conn
                .query_row(
                    "SELECT id FROM tasks WHERE user_id = ?1 AND event_id = ?2",
                    params![task.user_id, event_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
            None => None,
        };

        match existing {
            Some(id) => {
                let mut updated = task.clone();
                updated.id = id;
                write_task(&conn, &updated)?;
                Ok(id)
            }
            None => {
                let mut fresh = task.clone();
                fresh.id = 0;
                insert_task(&conn, &fresh)
            }
        }
    }
}
