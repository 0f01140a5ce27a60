//! CalendarLink persistence with optimistic concurrency.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::database::{format_ts, get_opt_ts, get_ts, SqliteStore};
use super::traits::{LinkStore, StoreResult};
use crate::error::DatabaseError;
use crate::model::{AuthState, CalendarLink, SyncDirection, SyncHealth};

const LINK_COLUMNS: &str = "user_id, access_token, refresh_token, token_expires_at, enabled,
    direction, calendar_id, timezone, auth_state, health, last_error,
    last_outbound_sync_at, last_inbound_sync_at, version, updated_at, inbound_health";

fn row_to_link(row: &rusqlite::Row) -> Result<CalendarLink, rusqlite::Error> {
    let direction: String = row.get(5)?;
    let auth_state: String = row.get(8)?;
    let health: String = row.get(9)?;
    let inbound_health: String = row.get(15)?;
    Ok(CalendarLink {
        user_id: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        token_expires_at: get_ts(row, 3)?,
        enabled: row.get(4)?,
        direction: SyncDirection::parse(&direction),
        calendar_id: row.get(6)?,
        timezone: row.get(7)?,
        auth_state: AuthState::parse(&auth_state),
        health: SyncHealth::parse(&health),
        inbound_health: SyncHealth::parse(&inbound_health),
        last_error: row.get(10)?,
        last_outbound_sync_at: get_opt_ts(row, 11)?,
        last_inbound_sync_at: get_opt_ts(row, 12)?,
        version: row.get(13)?,
        updated_at: get_ts(row, 14)?,
    })
}

fn load_link(conn: &Connection, user_id: &str) -> StoreResult<Option<CalendarLink>> {
    let sql = format!("SELECT {LINK_COLUMNS} FROM calendar_links WHERE user_id = ?1");
    Ok(conn
        .query_row(&sql, params![user_id], row_to_link)
        .optional()?)
}

fn stored(conn: &Connection, user_id: &str) -> StoreResult<CalendarLink> {
    load_link(conn, user_id)?.ok_or_else(|| DatabaseError::NotFound {
        entity: "calendar_link",
        id: user_id.to_string(),
    })
}

impl LinkStore for SqliteStore {
    fn get_link(&self, user_id: &str) -> StoreResult<Option<CalendarLink>> {
        load_link(&self.conn(), user_id)
    }

    fn save_link(&self, link: &CalendarLink) -> StoreResult<CalendarLink> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO calendar_links (user_id, access_token, refresh_token, token_expires_at,
                 enabled, direction, calendar_id, timezone, auth_state, health, last_error,
                 last_outbound_sync_at, last_inbound_sync_at, version, updated_at, inbound_health)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, ?14, ?15)
             ON CONFLICT(user_id) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 token_expires_at = excluded.token_expires_at,
                 enabled = excluded.enabled,
                 direction = excluded.direction,
                 calendar_id = excluded.calendar_id,
                 timezone = excluded.timezone,
                 auth_state = excluded.auth_state,
                 health = excluded.health,
                 last_error = excluded.last_error,
                 last_outbound_sync_at = excluded.last_outbound_sync_at,
                 last_inbound_sync_at = excluded.last_inbound_sync_at,
                 inbound_health = excluded.inbound_health,
                 version = calendar_links.version + 1,
                 updated_at = excluded.updated_at",
            params![
                link.user_id,
                link.access_token,
                link.refresh_token,
                format_ts(link.token_expires_at),
                link.enabled,
                link.direction.as_str(),
                link.calendar_id,
                link.timezone,
                link.auth_state.as_str(),
                link.health.as_str(),
                link.last_error,
                link.last_outbound_sync_at.map(format_ts),
                link.last_inbound_sync_at.map(format_ts),
                format_ts(Utc::now()),
                link.inbound_health.as_str(),
            ],
        )?;
        stored(&conn, &link.user_id)
    }

    fn update_link(&self, link: &CalendarLink) -> StoreResult<CalendarLink> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE calendar_links SET
                 access_token = ?2, refresh_token = ?3, token_expires_at = ?4, enabled = ?5,
                 direction = ?6, calendar_id = ?7, timezone = ?8, auth_state = ?9,
                 health = ?10, last_error = ?11, last_outbound_sync_at = ?12,
                 last_inbound_sync_at = ?13, inbound_health = ?16,
                 version = version + 1, updated_at = ?14
             WHERE user_id = ?1 AND version = ?15",
            params![
                link.user_id,
                link.access_token,
                link.refresh_token,
                format_ts(link.token_expires_at),
                link.enabled,
                link.direction.as_str(),
                link.calendar_id,
                link.timezone,
                link.auth_state.as_str(),
                link.health.as_str(),
                link.last_error,
                link.last_outbound_sync_at.map(format_ts),
                link.last_inbound_sync_at.map(format_ts),
                format_ts(Utc::now()),
                link.version,
                link.inbound_health.as_str(),
            ],
        )?;

        if changed == 0 {
            // Either the row is gone or someone else wrote first.
            stored(&conn, &link.user_id)?;
            return Err(DatabaseError::VersionConflict {
                entity: "calendar_link",
                id: link.user_id.clone(),
                expected: link.version,
            });
        }
        stored(&conn, &link.user_id)
    }

    fn delete_link(&self, user_id: &str) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM calendar_links WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    fn list_links(&self) -> StoreResult<Vec<CalendarLink>> {
        let conn = self.conn();
        let sql = format!("SELECT {LINK_COLUMNS} FROM calendar_links ORDER BY user_id");
        let mut stmt = conn.prepare(&sql)?;
        let links = stmt
            .query_map([], row_to_link)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_link() -> (SqliteStore, CalendarLink) {
        let store = SqliteStore::open_memory().unwrap();
        let link = CalendarLink::new("u1", "at-1", "rt-1", 3600, "primary", "Europe/Berlin");
        let saved = store.save_link(&link).unwrap();
        (store, saved)
    }

    #[test]
    fn save_and_get_round_trip() {
        let (store, saved) = store_with_link();
        assert_eq!(saved.version, 1);
        let loaded = store.get_link("u1").unwrap().unwrap();
        assert_eq!(loaded.access_token, "at-1");
        assert_eq!(loaded.timezone, "Europe/Berlin");
        assert_eq!(loaded.direction, SyncDirection::Bidirectional);
        assert_eq!(
            loaded.token_expires_at.timestamp(),
            saved.token_expires_at.timestamp()
        );
        assert!(store.get_link("nobody").unwrap().is_none());
    }

    #[test]
    fn save_replaces_existing_link() {
        let (store, _) = store_with_link();
        let fresh = CalendarLink::new("u1", "at-2", "rt-2", 3600, "work", "UTC");
        let saved = store.save_link(&fresh).unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(saved.calendar_id, "work");
        assert_eq!(store.list_links().unwrap().len(), 1);
    }

    #[test]
    fn update_bumps_version() {
        let (store, mut link) = store_with_link();
        link.health = SyncHealth::Degraded;
        link.inbound_health = SyncHealth::Degraded;
        link.last_error = Some("boom".into());
        let updated = store.update_link(&link).unwrap();
        assert_eq!(updated.version, link.version + 1);
        assert_eq!(updated.health, SyncHealth::Degraded);
        assert_eq!(updated.inbound_health, SyncHealth::Degraded);
        assert_eq!(updated.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn stale_update_is_a_version_conflict() {
        let (store, link) = store_with_link();
        let mut first = link.clone();
        first.access_token = "at-first".into();
        store.update_link(&first).unwrap();

        let mut stale = link;
        stale.access_token = "at-stale".into();
        let err = store.update_link(&stale).unwrap_err();
        assert!(matches!(err, DatabaseError::VersionConflict { expected: 1, .. }));
        assert_eq!(store.get_link("u1").unwrap().unwrap().access_token, "at-first");
    }

    #[test]
    fn update_of_missing_link_is_not_found() {
        let store = SqliteStore::open_memory().unwrap();
        let link = CalendarLink::new("ghost", "at", "rt", 60, "primary", "UTC");
        assert!(matches!(
            store.update_link(&link),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_removes_link() {
        let (store, _) = store_with_link();
        store.delete_link("u1").unwrap();
        assert!(store.get_link("u1").unwrap().is_none());
    }
}
