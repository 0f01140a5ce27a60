//! Access token lifecycle.
//!
//! Every provider call goes through [`TokenManager::ensure_valid_token`].
//! Refreshes are single-flight per user: concurrent callers queue on a
//! per-user async mutex and re-read the link once they hold it, so only the
//! first one talks to the token endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;

use super::health::{modify_link, refresh_health, HealthNote};
use super::retry::RetryPolicy;
use super::types::SyncError;
use crate::integrations::traits::{CalendarProvider, ProviderError};
use crate::model::{token_expiry, AuthState, CalendarLink, SyncHealth};
use crate::storage::traits::SyncStore;
use crate::storage::SyncConfig;

/// Per-user async locks, created on first use.
#[derive(Default)]
pub(crate) struct UserLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub(crate) fn get(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

pub struct TokenManager {
    store: Arc<dyn SyncStore>,
    provider: Arc<dyn CalendarProvider>,
    buffer: Duration,
    policy: RetryPolicy,
    locks: UserLocks,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn SyncStore>,
        provider: Arc<dyn CalendarProvider>,
        buffer: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            buffer,
            policy,
            locks: UserLocks::default(),
        }
    }

    pub fn from_config(
        config: &SyncConfig,
        store: Arc<dyn SyncStore>,
        provider: Arc<dyn CalendarProvider>,
    ) -> Self {
        let buffer = i64::try_from(config.token_refresh_buffer_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::minutes(5));
        Self::new(store, provider, buffer, RetryPolicy::refresh(config))
    }

    fn usable_link(&self, user_id: &str) -> Result<CalendarLink, SyncError> {
        let link = self
            .store
            .get_link(user_id)?
            .ok_or_else(|| SyncError::NotConnected(user_id.to_string()))?;
        if !link.is_connected() {
            return Err(SyncError::AuthExpired);
        }
        Ok(link)
    }

    /// A usable access token for `user_id`, refreshed first when it expires
    /// within the configured buffer.
    pub async fn ensure_valid_token(&self, user_id: &str) -> Result<String, SyncError> {
        let link = self.usable_link(user_id)?;
        if !link.expires_within(self.buffer, Utc::now()) {
            return Ok(link.access_token);
        }

        let lock = self.locks.get(user_id);
        let _guard = lock.lock().await;

        // Whoever held the lock before us may already have refreshed.
        let link = self.usable_link(user_id)?;
        if !link.expires_within(self.buffer, Utc::now()) {
            return Ok(link.access_token);
        }
        self.refresh(link).await
    }

    async fn refresh(&self, link: CalendarLink) -> Result<String, SyncError> {
        let user_id = link.user_id.as_str();
        let mut attempts = 0;
        loop {
            match self.provider.refresh_token(&link.refresh_token).await {
                Ok(token) => {
                    let expires_at = token_expiry(Utc::now(), token.expires_in);
                    let access = token.access_token.clone();
                    modify_link(self.store.as_ref(), user_id, |l| {
                        l.access_token = token.access_token.clone();
                        l.token_expires_at = expires_at;
                        if let Some(rotated) = &token.refresh_token {
                            l.refresh_token = rotated.clone();
                        }
                    })?;
                    tracing::debug!(
                        user_id,
                        rotated = token.refresh_token.is_some(),
                        "access token refreshed"
                    );
                    return Ok(access);
                }
                Err(ProviderError::InvalidGrant(reason)) => {
                    tracing::warn!(user_id, %reason, "refresh token rejected, disconnecting");
                    self.disconnect(user_id, &reason)?;
                    return Err(SyncError::AuthExpired);
                }
                Err(
                    err @ (ProviderError::Transient(_)
                    | ProviderError::RateLimited { .. }
                    | ProviderError::Decode(_)),
                ) => {
                    attempts += 1;
                    if !self.policy.allows(attempts) {
                        tracing::warn!(
                            user_id,
                            attempts,
                            error = %err,
                            "token refresh kept failing, disconnecting"
                        );
                        let reason = format!("token refresh failed {attempts} times: {err}");
                        self.disconnect(user_id, &reason)?;
                        return Err(SyncError::AuthExpired);
                    }
                    let delay = match &err {
                        ProviderError::RateLimited { retry_after: Some(d) } => *d,
                        _ => self.policy.delay(attempts),
                    };
                    tracing::debug!(
                        user_id,
                        attempts,
                        ?delay,
                        error = %err,
                        "retrying token refresh"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn disconnect(&self, user_id: &str, reason: &str) -> Result<(), SyncError> {
        modify_link(self.store.as_ref(), user_id, |l| {
            l.auth_state = AuthState::Disconnected;
            l.health = SyncHealth::NeedsAttention;
        })?;
        refresh_health(
            self.store.as_ref(),
            user_id,
            HealthNote::Error(format!("Calendar access revoked ({reason}); reconnect required")),
        )?;
        Ok(())
    }

    /// Force the next [`ensure_valid_token`](Self::ensure_valid_token) to
    /// refresh. Called after the provider answered 401.
    pub fn invalidate(&self, user_id: &str) -> Result<(), SyncError> {
        modify_link(self.store.as_ref(), user_id, |l| {
            l.token_expires_at = Utc::now() - Duration::seconds(1);
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::LinkStore;
    use crate::sync::testing::{store_with_link, FakeProvider};
    use std::time::Duration as StdDuration;

    fn manager(store: Arc<dyn SyncStore>, provider: Arc<dyn CalendarProvider>) -> TokenManager {
        TokenManager::new(
            store,
            provider,
            Duration::minutes(5),
            RetryPolicy::new(StdDuration::from_millis(1), StdDuration::from_millis(5), 3),
        )
    }

    fn expire_in(store: &dyn SyncStore, user: &str, d: Duration) {
        modify_link(store, user, |l| l.token_expires_at = Utc::now() + d).unwrap();
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let store = store_with_link("u1", "UTC");
        let provider = FakeProvider::shared();
        let tokens = manager(store.clone(), provider.clone());

        assert_eq!(tokens.ensure_valid_token("u1").await.unwrap(), "at-0");
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let store = store_with_link("u1", "UTC");
        expire_in(store.as_ref(), "u1", Duration::minutes(2));
        let provider = Arc::new(FakeProvider::with_refresh_delay(StdDuration::from_millis(50)));
        let tokens = Arc::new(manager(store.clone(), provider.clone()));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let tokens = tokens.clone();
                tokio::spawn(async move { tokens.ensure_valid_token("u1").await })
            })
            .collect();

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(provider.refresh_count(), 1);
        assert!(results.iter().all(|t| t == "at-1"));
        let link = store.get_link("u1").unwrap().unwrap();
        assert_eq!(link.access_token, "at-1");
        assert!(!link.expires_within(Duration::minutes(5), Utc::now()));
    }

    #[tokio::test]
    async fn invalid_grant_disconnects() {
        let store = store_with_link("u1", "UTC");
        expire_in(store.as_ref(), "u1", Duration::seconds(30));
        let provider = FakeProvider::shared();
        provider.fail_refresh(ProviderError::InvalidGrant("revoked".into()));
        let tokens = manager(store.clone(), provider.clone());

        assert!(matches!(
            tokens.ensure_valid_token("u1").await,
            Err(SyncError::AuthExpired)
        ));
        let link = store.get_link("u1").unwrap().unwrap();
        assert_eq!(link.auth_state, AuthState::Disconnected);
        assert_eq!(link.health, SyncHealth::NeedsAttention);
        assert!(link.last_error.unwrap().contains("reconnect"));

        // Terminal: no further refresh attempts.
        assert!(matches!(
            tokens.ensure_valid_token("u1").await,
            Err(SyncError::AuthExpired)
        ));
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_disconnect() {
        let store = store_with_link("u1", "UTC");
        expire_in(store.as_ref(), "u1", Duration::seconds(30));
        let provider = FakeProvider::shared();
        provider.fail_refresh(ProviderError::Transient("502".into()));
        let tokens = manager(store.clone(), provider.clone());

        // One failure, then success.
        assert_eq!(tokens.ensure_valid_token("u1").await.unwrap(), "at-2");
        assert_eq!(provider.refresh_count(), 2);

        tokens.invalidate("u1").unwrap();
        for _ in 0..3 {
            provider.fail_refresh(ProviderError::Transient("503".into()));
        }
        assert!(matches!(
            tokens.ensure_valid_token("u1").await,
            Err(SyncError::AuthExpired)
        ));
        assert_eq!(provider.refresh_count(), 5);
        let link = store.get_link("u1").unwrap().unwrap();
        assert_eq!(link.auth_state, AuthState::Disconnected);
        assert_eq!(link.health, SyncHealth::NeedsAttention);
        assert!(link.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn absurd_token_lifetime_does_not_panic() {
        struct Forever;
        #[async_trait::async_trait]
        impl CalendarProvider for Forever {
            async fn list_events(
                &self,
                _: &str,
                _: &str,
                _: crate::integrations::traits::TimeRange,
                _: Option<&str>,
            ) -> Result<crate::integrations::traits::EventPage, ProviderError> {
                Err(ProviderError::NotFound)
            }
            async fn create_event(
                &self,
                _: &str,
                _: &str,
                _: &crate::model::EventBody,
            ) -> Result<crate::model::ExternalEvent, ProviderError> {
                Err(ProviderError::NotFound)
            }
            async fn update_event(
                &self,
                _: &str,
                _: &str,
                _: &str,
                _: &crate::model::EventBody,
            ) -> Result<crate::model::ExternalEvent, ProviderError> {
                Err(ProviderError::NotFound)
            }
            async fn delete_event(&self, _: &str, _: &str, _: &str) -> Result<(), ProviderError> {
                Err(ProviderError::NotFound)
            }
            async fn refresh_token(
                &self,
                _: &str,
            ) -> Result<crate::integrations::traits::RefreshedToken, ProviderError> {
                Ok(crate::integrations::traits::RefreshedToken {
                    access_token: "at-forever".into(),
                    expires_in: i64::MAX,
                    refresh_token: None,
                })
            }
        }

        let store = store_with_link("u1", "UTC");
        expire_in(store.as_ref(), "u1", Duration::seconds(10));
        let tokens = manager(store.clone(), Arc::new(Forever));
        assert_eq!(tokens.ensure_valid_token("u1").await.unwrap(), "at-forever");
        let link = store.get_link("u1").unwrap().unwrap();
        assert!(link.token_expires_at <= Utc::now() + Duration::days(366));
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_persisted() {
        struct Rotating;
        #[async_trait::async_trait]
        impl CalendarProvider for Rotating {
            async fn list_events(
                &self,
                _: &str,
                _: &str,
                _: crate::integrations::traits::TimeRange,
                _: Option<&str>,
            ) -> Result<crate::integrations::traits::EventPage, ProviderError> {
                Err(ProviderError::NotFound)
            }
            async fn create_event(
                &self,
                _: &str,
                _: &str,
                _: &crate::model::EventBody,
            ) -> Result<crate::model::ExternalEvent, ProviderError> {
                Err(ProviderError::NotFound)
            }
            async fn update_event(
                &self,
                _: &str,
                _: &str,
                _: &str,
                _: &crate::model::EventBody,
            ) -> Result<crate::model::ExternalEvent, ProviderError> {
                Err(ProviderError::NotFound)
            }
            async fn delete_event(&self, _: &str, _: &str, _: &str) -> Result<(), ProviderError> {
                Err(ProviderError::NotFound)
            }
            async fn refresh_token(
                &self,
                _: &str,
            ) -> Result<crate::integrations::traits::RefreshedToken, ProviderError> {
                Ok(crate::integrations::traits::RefreshedToken {
                    access_token: "at-new".into(),
                    expires_in: 3600,
                    refresh_token: Some("rt-new".into()),
                })
            }
        }

        let store = store_with_link("u1", "UTC");
        expire_in(store.as_ref(), "u1", Duration::seconds(10));
        let tokens = TokenManager::new(
            store.clone(),
            Arc::new(Rotating),
            Duration::minutes(5),
            RetryPolicy::new(StdDuration::from_millis(1), StdDuration::from_millis(1), 1),
        );
        assert_eq!(tokens.ensure_valid_token("u1").await.unwrap(), "at-new");
        assert_eq!(store.get_link("u1").unwrap().unwrap().refresh_token, "rt-new");
    }

    #[tokio::test]
    async fn missing_link_is_not_connected() {
        let store: Arc<dyn SyncStore> =
            Arc::new(crate::storage::SqliteStore::open_memory().unwrap());
        let tokens = manager(store, FakeProvider::shared());
        assert!(matches!(
            tokens.ensure_valid_token("ghost").await,
            Err(SyncError::NotConnected(_))
        ));
    }
}
