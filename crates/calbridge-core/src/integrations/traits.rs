use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{EventBody, ExternalEvent};

/// Half-open `[start, end)` window of provider time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// `[from, from + days)`.
    pub fn days_from(from: DateTime<Utc>, days: u32) -> Self {
        Self {
            start: from,
            end: from + chrono::Duration::days(i64::from(days)),
        }
    }
}

/// One page of a list call.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<ExternalEvent>,
    pub next_page_token: Option<String>,
}

/// Result of a refresh-token grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
}

/// HTTP-level failures of a calendar provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Access token rejected (HTTP 401).
    #[error("access token rejected")]
    Unauthorized,

    /// Refresh token revoked or expired (`invalid_grant`).
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Event does not exist (HTTP 404 or 410).
    #[error("event not found")]
    NotFound,

    /// Network failure or 5xx.
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// A calendar provider the sync engine can push to and pull from.
///
/// Implementations are stateless between calls: the engine hands every call
/// a valid access token obtained from the token manager.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Fetch one page of events in `range`, cancelled events included.
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        range: TimeRange,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError>;

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        body: &EventBody,
    ) -> Result<ExternalEvent, ProviderError>;

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        body: &EventBody,
    ) -> Result<ExternalEvent, ProviderError>;

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, ProviderError>;
}
