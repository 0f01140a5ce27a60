//! Core error types for calbridge-core.
//!
//! Each layer owns a thiserror enum; `CoreError` is the umbrella used by
//! callers that do not care which layer failed (the CLI, mostly).

use std::path::PathBuf;
use thiserror::Error;

use crate::integrations::traits::ProviderError;
use crate::sync::types::SyncError;

/// Core error type for calbridge-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// OAuth-related errors
    #[error("OAuth error: {0}")]
    OAuth(#[from] OAuthError),

    /// Sync pipeline errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Raw provider errors that escaped classification
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// Optimistic concurrency check on a versioned row failed
    #[error("{entity} '{id}' was modified concurrently (expected version {expected})")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: i64,
    },

    /// Row not found
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// A stored value could not be decoded
    #[error("Corrupt value in column '{column}': {message}")]
    Corrupt { column: &'static str, message: String },
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    /// Failed to serialize configuration
    #[error("Failed to write configuration: {0}")]
    WriteFailed(String),
}

/// OAuth-specific errors.
#[derive(Error, Debug)]
pub enum OAuthError {
    /// Authorization failed
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Token exchange failed
    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// Callback timeout
    #[error("OAuth callback timeout: no callback received within {timeout_secs} seconds")]
    CallbackTimeout { timeout_secs: u64 },

    /// Invalid callback
    #[error("Invalid OAuth callback: {0}")]
    InvalidCallback(String),

    /// CSRF state mismatch
    #[error("OAuth state mismatch")]
    StateMismatch,

    /// Credentials not configured
    #[error("OAuth credentials not configured for {service}")]
    CredentialsNotConfigured { service: String },

    /// Keyring access failed
    #[error("Keyring error: {0}")]
    Keyring(String),
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _msg) => {
                if inner.code == rusqlite::ErrorCode::DatabaseBusy
                    || inner.code == rusqlite::ErrorCode::DatabaseLocked
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

impl From<keyring::Error> for OAuthError {
    fn from(err: keyring::Error) -> Self {
        OAuthError::Keyring(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for OAuthError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        OAuthError::CallbackTimeout { timeout_secs: 300 }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_message_names_entity() {
        let err = DatabaseError::VersionConflict {
            entity: "calendar_link",
            id: "user-1".into(),
            expected: 3,
        };
        assert_eq!(
            err.to_string(),
            "calendar_link 'user-1' was modified concurrently (expected version 3)"
        );
    }

    #[test]
    fn rusqlite_errors_convert_to_query_failed() {
        let err: DatabaseError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, DatabaseError::QueryFailed(_)));
    }
}
