//! Conflict resolution between a local task and its provider event.
//!
//! Last writer wins on the provider's clock: the event replaces the task only
//! when it was modified strictly after the task last synced. A task that has
//! never synced always takes the provider's version. Private tasks are never
//! overwritten.

use chrono::{DateTime, Utc};

use crate::model::{ExternalEvent, Task};

/// Merge decision for a linked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    UseLocal,
    UseRemote,
}

/// Decide from timestamps alone.
pub fn decide_merge(
    local_synced: Option<DateTime<Utc>>,
    remote_updated: Option<DateTime<Utc>>,
    local_private: bool,
) -> MergeDecision {
    if local_private {
        return MergeDecision::UseLocal;
    }
    match (local_synced, remote_updated) {
        (None, _) => MergeDecision::UseRemote,
        // No timestamp means nothing proves the event is newer.
        (Some(_), None) => MergeDecision::UseLocal,
        (Some(synced), Some(updated)) if updated > synced => MergeDecision::UseRemote,
        _ => MergeDecision::UseLocal,
    }
}

/// Decide for a task and the event it is linked to.
pub fn resolve_conflict(local: &Task, remote: &ExternalEvent) -> MergeDecision {
    decide_merge(local.last_synced_at, remote.updated, local.private)
}
