//! Link health bookkeeping.
//!
//! Health is derived from the link's auth state, the status table and the
//! outcome of the last inbound pass, never from a single job, and is
//! recomputed after every outbound job and every inbound pass.

use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::model::{CalendarLink, SyncHealth};
use crate::storage::traits::{LinkStore, StoreResult, SyncStatusStore};
use crate::sync::types::StatusCounts;

const MAX_CONFLICT_RETRIES: usize = 5;

/// Extra fact to record on the link along with the recomputed health.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthNote {
    None,
    OutboundSynced(DateTime<Utc>),
    InboundSynced(DateTime<Utc>),
    /// An inbound pass gave up; the pass health stays until one succeeds.
    InboundFailed(SyncHealth, String),
    Error(String),
}

/// Health for a link given its queue state and last inbound pass.
pub fn compute_health(link: &CalendarLink, counts: &StatusCounts) -> SyncHealth {
    let outbound = if !link.is_connected() || counts.failed > 0 {
        SyncHealth::NeedsAttention
    } else if counts.retrying > 0 {
        SyncHealth::Degraded
    } else {
        SyncHealth::Healthy
    };
    outbound.worst(link.inbound_health)
}

/// Apply `change` to the user's link, reloading and retrying on version
/// conflicts. Returns `None` when the user has no link. Nothing is written
/// when `change` leaves the link as it was.
pub(crate) fn modify_link<S, F>(
    store: &S,
    user_id: &str,
    mut change: F,
) -> StoreResult<Option<CalendarLink>>
where
    S: LinkStore + ?Sized,
    F: FnMut(&mut CalendarLink),
{
    let mut attempt = 0;
    loop {
        let Some(current) = store.get_link(user_id)? else {
            return Ok(None);
        };
        let mut next = current.clone();
        change(&mut next);
        if next == current {
            return Ok(Some(current));
        }
        next.updated_at = Utc::now();
        match store.update_link(&next) {
            Ok(stored) => return Ok(Some(stored)),
            Err(DatabaseError::VersionConflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                tracing::debug!(user_id, attempt, "link changed underneath us, reloading");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Recompute and persist the user's health, recording `note`.
pub(crate) fn refresh_health<S>(
    store: &S,
    user_id: &str,
    note: HealthNote,
) -> StoreResult<Option<SyncHealth>>
where
    S: LinkStore + SyncStatusStore + ?Sized,
{
    let counts = store.status_counts(user_id)?;
    let link = modify_link(store, user_id, |link| {
        match &note {
            HealthNote::None => {}
            HealthNote::OutboundSynced(at) => link.last_outbound_sync_at = Some(*at),
            HealthNote::InboundSynced(at) => {
                link.last_inbound_sync_at = Some(*at);
                link.inbound_health = SyncHealth::Healthy;
            }
            HealthNote::InboundFailed(health, message) => {
                link.inbound_health = *health;
                link.last_error = Some(message.clone());
            }
            HealthNote::Error(message) => link.last_error = Some(message.clone()),
        }
        let health = compute_health(link, &counts);
        if health != link.health {
            tracing::info!(user_id, from = %link.health, to = %health, "sync health changed");
        }
        let failure = matches!(note, HealthNote::Error(_) | HealthNote::InboundFailed(..));
        if health == SyncHealth::Healthy && !failure {
            link.last_error = None;
        }
        link.health = health;
    })?;
    Ok(link.map(|l| l.health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthState;
    use crate::storage::SqliteStore;
    use crate::sync::types::{ChangeKind, EntityKind};

    fn store_with_link() -> SqliteStore {
        let store = SqliteStore::open_memory().unwrap();
        store
            .save_link(&CalendarLink::new("u1", "at", "rt", 3600, "primary", "UTC"))
            .unwrap();
        store
    }

    #[test]
    fn health_rules() {
        let mut link = CalendarLink::new("u1", "at", "rt", 3600, "primary", "UTC");
        let mut counts = StatusCounts::default();
        assert_eq!(compute_health(&link, &counts), SyncHealth::Healthy);

        counts.retrying = 2;
        assert_eq!(compute_health(&link, &counts), SyncHealth::Degraded);

        counts.failed = 1;
        assert_eq!(compute_health(&link, &counts), SyncHealth::NeedsAttention);

        link.auth_state = AuthState::Disconnected;
        assert_eq!(
            compute_health(&link, &StatusCounts::default()),
            SyncHealth::NeedsAttention
        );

        link.auth_state = AuthState::Active;
        link.inbound_health = SyncHealth::Degraded;
        assert_eq!(compute_health(&link, &StatusCounts::default()), SyncHealth::Degraded);
        counts = StatusCounts::default();
        counts.failed = 1;
        assert_eq!(compute_health(&link, &counts), SyncHealth::NeedsAttention);
    }

    #[test]
    fn failed_pull_stays_visible_until_a_pass_succeeds() {
        let store = store_with_link();
        let health = refresh_health(
            &store,
            "u1",
            HealthNote::InboundFailed(SyncHealth::Degraded, "rate limited".into()),
        )
        .unwrap();
        assert_eq!(health, Some(SyncHealth::Degraded));

        // An outbound success alone does not clear it.
        let health = refresh_health(&store, "u1", HealthNote::OutboundSynced(Utc::now())).unwrap();
        assert_eq!(health, Some(SyncHealth::Degraded));
        assert_eq!(
            store.get_link("u1").unwrap().unwrap().last_error.as_deref(),
            Some("rate limited")
        );

        let health = refresh_health(&store, "u1", HealthNote::InboundSynced(Utc::now())).unwrap();
        assert_eq!(health, Some(SyncHealth::Healthy));
        let link = store.get_link("u1").unwrap().unwrap();
        assert_eq!(link.inbound_health, SyncHealth::Healthy);
        assert!(link.last_error.is_none());
    }

    #[test]
    fn failed_job_surfaces_and_requeue_clears() {
        let store = store_with_link();
        store
            .enqueue(EntityKind::Task, 1, "u1", ChangeKind::Create, &serde_json::json!({}))
            .unwrap();
        let job = store.get_job(EntityKind::Task, 1).unwrap().unwrap();
        store.mark_failed(&job, 5, "HTTP 400").unwrap();

        let health = refresh_health(&store, "u1", HealthNote::Error("HTTP 400".into())).unwrap();
        assert_eq!(health, Some(SyncHealth::NeedsAttention));
        let link = store.get_link("u1").unwrap().unwrap();
        assert_eq!(link.last_error.as_deref(), Some("HTTP 400"));

        store.requeue_failed("u1").unwrap();
        let job = store.get_job(EntityKind::Task, 1).unwrap().unwrap();
        store.mark_synced(&job).unwrap();
        let now = Utc::now();
        let health = refresh_health(&store, "u1", HealthNote::OutboundSynced(now)).unwrap();
        assert_eq!(health, Some(SyncHealth::Healthy));
        let link = store.get_link("u1").unwrap().unwrap();
        assert!(link.last_error.is_none());
        assert!(link.last_outbound_sync_at.is_some());
    }

    #[test]
    fn unchanged_link_is_not_rewritten() {
        let store = store_with_link();
        let before = store.get_link("u1").unwrap().unwrap();
        refresh_health(&store, "u1", HealthNote::None).unwrap();
        let after = store.get_link("u1").unwrap().unwrap();
        assert_eq!(before.version, after.version);
    }

    #[test]
    fn missing_link_is_none() {
        let store = SqliteStore::open_memory().unwrap();
        assert_eq!(refresh_health(&store, "nobody", HealthNote::None).unwrap(), None);
    }
}
