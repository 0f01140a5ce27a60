mod config;
pub mod database;
mod ledger;
mod link_store;
pub mod migrations;
mod routine_store;
mod sync_status;
mod task_store;
pub mod traits;

pub use config::{Config, GoogleConfig, SyncConfig};
pub use database::SqliteStore;
pub use traits::{
    LedgerStore, LinkStore, RoutineStore, StoreResult, SyncStatusStore, SyncStore, TaskStore,
};

use std::path::PathBuf;

/// Returns `~/.config/calbridge[-dev]/` based on CALBRIDGE_ENV.
///
/// Set CALBRIDGE_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("CALBRIDGE_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("calbridge-dev")
    } else {
        base_dir.join("calbridge")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
