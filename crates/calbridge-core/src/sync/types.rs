//! Core types for calendar synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DatabaseError;
use crate::integrations::traits::ProviderError;
use crate::model::SyncHealth;
use crate::sync::event_mapper::MappingError;

/// Kind of local entity an outbound job refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Routine,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Routine => "routine",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(EntityKind::Task),
            "routine" => Some(EntityKind::Routine),
            _ => None,
        }
    }
}

/// Local mutation being propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(ChangeKind::Create),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// Lifecycle of a per-entity status row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Retrying,
    Failed,
    /// Permanently skipped (mapping warning or sync disabled).
    Skipped,
    Synced,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Retrying => "retrying",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "retrying" => Some(JobState::Retrying),
            "failed" => Some(JobState::Failed),
            "skipped" => Some(JobState::Skipped),
            "synced" => Some(JobState::Synced),
            _ => None,
        }
    }
}

/// A durable outbound job / per-entity sync status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    pub user_id: String,
    pub change: ChangeKind,
    /// Snapshot of the entity at enqueue time.
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Bumped on every enqueue; status writes only land on the revision
    /// they were computed for.
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

/// Counts of status rows per state for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Current sync status of a link, as shown to the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub health: SyncHealth,
    pub last_error: Option<String>,
    pub last_outbound_sync_at: Option<DateTime<Utc>>,
    pub last_inbound_sync_at: Option<DateTime<Utc>>,
    pub counts: StatusCounts,
    /// Whether an inbound pass is currently running.
    pub in_progress: bool,
}

/// What happened to one fetched provider event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    SkippedUntitled,
    SkippedSelfAuthored,
    RoutineRecordRemoved,
    RoutineMetadataUpdated,
    RoutineUnchanged,
    TaskDeleted,
    /// Provider value adopted over the local one. Informational.
    ConflictResolved,
    TaskUnchanged,
    /// Event id adopted onto the task that authored it.
    TaskAdopted,
    TaskCreated,
    Ignored,
}

/// Summary of one inbound reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub adopted: usize,
    pub skipped: usize,
    pub routine_records_removed: usize,
    pub routine_updates: usize,
    pub mapping_warnings: Vec<String>,
    /// The pass stopped early on a cancellation request.
    pub cancelled: bool,
}

impl ReconcileReport {
    pub(crate) fn record(&mut self, outcome: &InboundOutcome) {
        match outcome {
            InboundOutcome::SkippedUntitled
            | InboundOutcome::SkippedSelfAuthored
            | InboundOutcome::Ignored => self.skipped += 1,
            InboundOutcome::RoutineRecordRemoved => self.routine_records_removed += 1,
            InboundOutcome::RoutineMetadataUpdated => self.routine_updates += 1,
            InboundOutcome::RoutineUnchanged | InboundOutcome::TaskUnchanged => {
                self.unchanged += 1
            }
            InboundOutcome::TaskDeleted => self.deleted += 1,
            InboundOutcome::ConflictResolved => self.updated += 1,
            InboundOutcome::TaskAdopted => self.adopted += 1,
            InboundOutcome::TaskCreated => self.created += 1,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "fetched {} | +{} ~{} -{} ={} adopted {} skipped {} | routine records -{} ~{}",
            self.fetched,
            self.created,
            self.updated,
            self.deleted,
            self.unchanged,
            self.adopted,
            self.skipped,
            self.routine_records_removed,
            self.routine_updates,
        )
    }
}

/// Sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Refresh token rejected; the user has to reconnect.
    #[error("Calendar access expired; reconnect required")]
    AuthExpired,

    #[error("Calendar provider unavailable: {0}")]
    TransientProvider(String),

    #[error("Rate limited by calendar provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Cannot map entity: {0}")]
    Mapping(#[from] MappingError),

    /// Provider refused the request for a reason retrying will not fix.
    #[error("Calendar provider rejected request: {0}")]
    Rejected(String),

    #[error("No calendar connected for user '{0}'")]
    NotConnected(String),

    #[error("Storage error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the outbound worker should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientProvider(_) | SyncError::RateLimited { .. } | SyncError::Store(_)
        )
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidGrant(_) => SyncError::AuthExpired,
            ProviderError::Unauthorized => {
                SyncError::TransientProvider("access token rejected".to_string())
            }
            ProviderError::RateLimited { retry_after } => SyncError::RateLimited { retry_after },
            ProviderError::Transient(msg) | ProviderError::Decode(msg) => {
                SyncError::TransientProvider(msg)
            }
            ProviderError::NotFound => SyncError::Rejected("event not found".to_string()),
            ProviderError::Rejected { status, message } => {
                SyncError::Rejected(format!("HTTP {status}: {message}"))
            }
        }
    }
}

