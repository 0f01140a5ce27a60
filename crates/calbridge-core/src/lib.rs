//! # Calbridge Core Library
//!
//! Two-way synchronization between a personal task/routine store and a
//! user's Google Calendar. Like the CLI built on top of it, every operation
//! is available as a plain library call; the binary is a thin layer over
//! the same engine.
//!
//! ## Architecture
//!
//! - **Sync Engine**: outbound changes go through a durable per-entity queue
//!   drained by a background worker; inbound passes merge provider events
//!   back into tasks with last-writer-wins conflict resolution
//! - **Routines**: recurring routines are written as a rolling window of
//!   discrete events rather than provider recurrence rules
//! - **Storage**: SQLite for links, tasks, routines, the routine ledger and
//!   the outbound queue; TOML for configuration
//! - **Integrations**: the Google Calendar REST client and the OAuth
//!   desktop flow behind the [`CalendarProvider`] trait
//!
//! ## Key Components
//!
//! - [`SyncEngine`]: entry points and background loops
//! - [`SqliteStore`]: persistence for everything sync touches
//! - [`Config`]: application configuration management
//! - [`CalendarProvider`]: trait the engine talks to the provider through

pub mod error;
pub mod integrations;
pub mod model;
pub mod storage;
pub mod sync;

pub use error::{ConfigError, CoreError, DatabaseError, OAuthError};
pub use integrations::{CalendarProvider, GoogleCalendarClient, OAuthTokens, ProviderError};
pub use model::{CalendarLink, ExternalEvent, Routine, SyncDirection, SyncHealth, Task};
pub use storage::{Config, SqliteStore, SyncConfig};
pub use sync::{ChangeKind, EngineHandle, ReconcileReport, SyncEngine, SyncError, SyncStatus};
