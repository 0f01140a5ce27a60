//! SQLite-backed implementation of every store trait.
//!
//! Provides persistent storage for:
//! - Calendar links (credentials + sync configuration)
//! - Tasks and routines as the application sees them
//! - The sync state ledger and the durable outbound queue

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

use super::data_dir;
use super::migrations;
use crate::error::{DatabaseError, Result};

/// SQLite database shared by the sync pipeline.
///
/// The connection sits behind a mutex so one store can be shared across
/// tokio tasks; every method holds the lock for a single statement or
/// transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the database at `~/.config/calbridge/calbridge.db`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self> {
        let path = data_dir()?.join("calbridge.db");
        Self::open_at(&path)
    }

    /// Open (or create) the database at `path`.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests and dry runs).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        migrations::migrate(&conn)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection. A poisoned lock is recovered; SQLite keeps its
    /// own consistency across a panicking holder.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// === Column helpers ===
//
// Timestamps are stored as RFC 3339 text, dates as `%Y-%m-%d` and times as
// `%H:%M`. A value that fails to decode surfaces as a conversion error on the
// column that held it.

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
}

fn parse_time(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(s, "%H:%M").or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn get_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    parse_date(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_opt_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_date(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn get_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_time(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}
