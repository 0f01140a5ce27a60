use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way changes are allowed to flow for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    OutboundOnly,
    InboundOnly,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Bidirectional => "bidirectional",
            SyncDirection::OutboundOnly => "outbound_only",
            SyncDirection::InboundOnly => "inbound_only",
        }
    }

    /// Parse the storage form; unknown values fall back to bidirectional.
    pub fn parse(s: &str) -> Self {
        match s {
            "outbound_only" => SyncDirection::OutboundOnly,
            "inbound_only" => SyncDirection::InboundOnly,
            _ => SyncDirection::Bidirectional,
        }
    }
}

/// Credential state of a link.
///
/// `Disconnected` is terminal: only a fresh consent flow replaces the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Active,
    Disconnected,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Active => "active",
            AuthState::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "disconnected" => AuthState::Disconnected,
            _ => AuthState::Active,
        }
    }
}

/// User-visible sync health indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    #[default]
    Healthy,
    /// Something is being retried; no action needed yet.
    Degraded,
    /// The user has to do something (reconnect, inspect failed items).
    NeedsAttention,
}

impl SyncHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncHealth::Healthy => "healthy",
            SyncHealth::Degraded => "degraded",
            SyncHealth::NeedsAttention => "needs_attention",
        }
    }

    /// The more severe of two health values.
    pub fn worst(self, other: SyncHealth) -> SyncHealth {
        fn rank(h: SyncHealth) -> u8 {
            match h {
                SyncHealth::Healthy => 0,
                SyncHealth::Degraded => 1,
                SyncHealth::NeedsAttention => 2,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "degraded" => SyncHealth::Degraded,
            "needs_attention" => SyncHealth::NeedsAttention,
            _ => SyncHealth::Healthy,
        }
    }
}

/// Longest token lifetime taken at face value from the provider.
const MAX_TOKEN_LIFETIME_SECS: i64 = 366 * 24 * 3600;

/// Expiry instant of a token issued at `now` for `expires_in_secs`.
/// Lifetimes outside `0..=366 days` are clamped.
pub fn token_expiry(now: DateTime<Utc>, expires_in_secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(expires_in_secs.clamp(0, MAX_TOKEN_LIFETIME_SECS))
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

impl fmt::Display for SyncHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user sync configuration and credential record.
///
/// The row is versioned: every successful write bumps `version`, and writers
/// must present the version they read (see `LinkStore::update_link`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarLink {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub enabled: bool,
    pub direction: SyncDirection,
    /// Provider calendar identifier (`primary` for the user's main calendar).
    pub calendar_id: String,
    /// IANA timezone name used to interpret task and routine times.
    pub timezone: String,
    pub auth_state: AuthState,
    pub health: SyncHealth,
    /// Outcome of the last inbound pass; folded into `health`.
    #[serde(default)]
    pub inbound_health: SyncHealth,
    pub last_error: Option<String>,
    pub last_outbound_sync_at: Option<DateTime<Utc>>,
    pub last_inbound_sync_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl CalendarLink {
    /// Build a fresh link right after the user granted consent.
    pub fn new(
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in_secs: i64,
        calendar_id: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_expires_at: token_expiry(now, expires_in_secs),
            enabled: true,
            direction: SyncDirection::Bidirectional,
            calendar_id: calendar_id.into(),
            timezone: timezone.into(),
            auth_state: AuthState::Active,
            health: SyncHealth::Healthy,
            inbound_health: SyncHealth::Healthy,
            last_error: None,
            last_outbound_sync_at: None,
            last_inbound_sync_at: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Parsed timezone, UTC when the stored name is not a valid IANA zone.
    pub fn tz(&self) -> Tz {
        self.timezone.parse::<Tz>().unwrap_or(Tz::UTC)
    }

    /// Whether the access token expires within `buffer` of `now`.
    pub fn expires_within(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        self.token_expires_at - now <= buffer
    }

    pub fn is_connected(&self) -> bool {
        self.auth_state == AuthState::Active
    }

    pub fn allows_outbound(&self) -> bool {
        self.enabled && self.direction != SyncDirection::InboundOnly
    }

    pub fn allows_inbound(&self) -> bool {
        self.enabled && self.direction != SyncDirection::OutboundOnly
    }
}
