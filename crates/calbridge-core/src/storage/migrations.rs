//! Database schema migrations for calbridge.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const SCHEMA_VERSION: i32 = 3;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }
    if current_version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub(crate) fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or_else(|e| {
        if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            tracing::warn!(error = %e, "failed to read schema_version");
        }
        0
    })
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration v1: links, tasks and routines.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS calendar_links (
            user_id               TEXT PRIMARY KEY,
            access_token          TEXT NOT NULL,
            refresh_token         TEXT NOT NULL,
            token_expires_at      TEXT NOT NULL,
            enabled               INTEGER NOT NULL DEFAULT 1,
            direction             TEXT NOT NULL DEFAULT 'bidirectional',
            calendar_id           TEXT NOT NULL,
            timezone              TEXT NOT NULL DEFAULT 'UTC',
            auth_state            TEXT NOT NULL DEFAULT 'active',
            health                TEXT NOT NULL DEFAULT 'healthy',
            last_error            TEXT,
            last_outbound_sync_at TEXT,
            last_inbound_sync_at  TEXT,
            version               INTEGER NOT NULL DEFAULT 1,
            updated_at            TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        TEXT NOT NULL,
            title          TEXT NOT NULL,
            description    TEXT,
            date           TEXT,
            start_time     TEXT,
            end_time       TEXT,
            all_day        INTEGER NOT NULL DEFAULT 0,
            private        INTEGER NOT NULL DEFAULT 0,
            event_id       TEXT,
            calendar_id    TEXT,
            last_synced_at TEXT,
            updated_at     TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_event_unique
            ON tasks(user_id, event_id) WHERE event_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);

        CREATE TABLE IF NOT EXISTS routines (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          TEXT NOT NULL,
            title            TEXT NOT NULL,
            description      TEXT,
            days             TEXT NOT NULL DEFAULT '[]',
            start_time       TEXT,
            duration_minutes INTEGER NOT NULL DEFAULT 60,
            private          INTEGER NOT NULL DEFAULT 0,
            completed_count  INTEGER NOT NULL DEFAULT 0,
            updated_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_routines_user ON routines(user_id);",
    )?;

    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [1])?;
    tx.commit()?;
    Ok(())
}

/// Migration v2: sync state ledger.
///
/// Adds:
/// - routine_event_records: (routine, date) -> provider event id
/// - routine_windows: inclusive end of each routine's materialized horizon
/// - entity_sync_status: durable outbound queue and per-entity status
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS routine_event_records (
            routine_id      INTEGER NOT NULL,
            occurrence_date TEXT NOT NULL,
            event_id        TEXT NOT NULL,
            calendar_id     TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            PRIMARY KEY (routine_id, occurrence_date)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_routine_records_event
            ON routine_event_records(event_id);

        CREATE TABLE IF NOT EXISTS routine_windows (
            routine_id INTEGER PRIMARY KEY,
            window_end TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entity_sync_status (
            entity_kind     TEXT NOT NULL,
            entity_id       INTEGER NOT NULL,
            user_id         TEXT NOT NULL,
            change_kind     TEXT NOT NULL,
            payload         TEXT NOT NULL,
            state           TEXT NOT NULL,
            attempts        INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT NOT NULL,
            last_error      TEXT,
            revision        INTEGER NOT NULL DEFAULT 1,
            updated_at      TEXT NOT NULL,
            PRIMARY KEY (entity_kind, entity_id)
        );

        CREATE INDEX IF NOT EXISTS idx_sync_status_due
            ON entity_sync_status(state, next_attempt_at);",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}

/// Migration v3: health of the last inbound pass, kept apart from the
/// outbound queue so a successful push cannot hide a failing pull.
fn migrate_v3(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "ALTER TABLE calendar_links ADD COLUMN inbound_health TEXT NOT NULL DEFAULT 'healthy'",
        [],
    )?;
    set_schema_version(&tx, 3)?;
    tx.commit()?;
    Ok(())
}
