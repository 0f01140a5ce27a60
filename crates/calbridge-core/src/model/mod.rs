//! Domain types shared by the sync pipeline.
//!
//! - [`CalendarLink`]: per-user credentials and sync configuration
//! - [`Task`] / [`Routine`]: the internal scheduling entities
//! - [`RoutineEventRecord`]: one materialized routine occurrence
//! - [`ExternalEvent`] / [`EventBody`]: the provider's view of an event

mod event;
mod link;
mod routine;
mod task;

pub use event::{BodyTime, EventBody, EventOrigin, EventStatus, EventTime, ExternalEvent};
pub use link::{token_expiry, AuthState, CalendarLink, SyncDirection, SyncHealth};
pub use routine::{Routine, RoutineEventRecord};
pub use task::Task;
