//! Google Calendar synchronization layer.
//!
//! Pushes local tasks and routine occurrences to the user's calendar and
//! pulls provider-side edits back:
//! - outbound changes go through a durable queue drained by a background
//!   worker ([`dispatcher`])
//! - routines keep a rolling window of discrete events ([`materializer`])
//! - inbound passes merge provider events into tasks ([`reconciler`])

pub mod conflict_resolver;
pub mod dispatcher;
pub mod event_mapper;
pub mod health;
pub mod materializer;
pub mod reconciler;
pub mod retry;
pub mod sync_engine;
pub mod sync_queue;
pub mod token_manager;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod sync_engine_tests;
#[cfg(test)]
mod types_tests;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use conflict_resolver::{decide_merge, resolve_conflict, MergeDecision};
pub use dispatcher::{JobOutcome, OutboundDispatcher, RoutineSyncReport};
pub use event_mapper::{EventMapper, MappingError};
pub use materializer::{needs_refresh, RoutineMaterializer};
pub use reconciler::InboundReconciler;
pub use retry::RetryPolicy;
pub use sync_engine::{EngineHandle, SyncEngine};
pub use sync_queue::SyncQueue;
pub use token_manager::TokenManager;
pub use types::{
    ChangeKind, EntityKind, InboundOutcome, JobState, ReconcileReport, StatusCounts, SyncError,
    SyncJob, SyncStatus,
};

/// Source of the current time. Swappable so tests can move through days.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
