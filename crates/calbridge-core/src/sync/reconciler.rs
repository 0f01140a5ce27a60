//! Inbound reconciliation: pull provider events and merge them into local
//! tasks and routine metadata.
//!
//! Passes are serialized per user and every event is committed as it is
//! processed, so a pass that stops early (provider failure or cancellation)
//! keeps what it applied and can simply be run again. Transient page
//! fetch failures are retried in place; a pass that still fails leaves its
//! mark on the link's health until a later pass succeeds.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::conflict_resolver::{decide_merge, resolve_conflict, MergeDecision};
use super::event_mapper::{EventMapper, MappingError};
use super::health::{refresh_health, HealthNote};
use super::retry::RetryPolicy;
use super::sync_queue::SyncQueue;
use super::token_manager::{TokenManager, UserLocks};
use super::types::{ChangeKind, InboundOutcome, ReconcileReport, SyncError};
use super::Clock;
use crate::integrations::traits::{CalendarProvider, EventPage, ProviderError, TimeRange};
use crate::model::{CalendarLink, EventOrigin, ExternalEvent, SyncHealth};
use crate::storage::traits::SyncStore;
use crate::storage::SyncConfig;

pub struct InboundReconciler {
    store: Arc<dyn SyncStore>,
    provider: Arc<dyn CalendarProvider>,
    tokens: Arc<TokenManager>,
    queue: SyncQueue,
    mapper: EventMapper,
    horizon_days: u32,
    policy: RetryPolicy,
    clock: Clock,
    locks: UserLocks,
    running: Mutex<HashSet<String>>,
}

/// Removes the user from the running set when the pass ends.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    user_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        running.remove(&self.user_id);
    }
}

impl InboundReconciler {
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn SyncStore>,
        provider: Arc<dyn CalendarProvider>,
        tokens: Arc<TokenManager>,
        queue: SyncQueue,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            provider,
            tokens,
            queue,
            mapper: EventMapper::new(config.routine_marker.clone()),
            horizon_days: config.inbound_horizon_days,
            policy: RetryPolicy::outbound(config),
            clock,
            locks: UserLocks::default(),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Whether a pass for `user_id` is currently running.
    pub fn is_running(&self, user_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(user_id)
    }

    /// Run one inbound pass for `user_id`. An overlapping call waits for
    /// the running one to finish.
    pub async fn reconcile(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, SyncError> {
        let lock = self.locks.get(user_id);
        let _serial = lock.lock().await;

        let link = self
            .store
            .get_link(user_id)?
            .ok_or_else(|| SyncError::NotConnected(user_id.to_string()))?;
        if !link.is_connected() {
            return Err(SyncError::AuthExpired);
        }
        if !link.allows_inbound() {
            tracing::debug!(user_id, "inbound sync disabled for link");
            return Ok(ReconcileReport::default());
        }

        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user_id.to_string());
        let _running = RunningGuard {
            running: &self.running,
            user_id: user_id.to_string(),
        };

        let mut report = ReconcileReport::default();
        match self.scan(&link, cancel, &mut report).await {
            Ok(()) => {
                let note = if report.cancelled {
                    HealthNote::None
                } else {
                    HealthNote::InboundSynced((self.clock)())
                };
                refresh_health(self.store.as_ref(), user_id, note)?;
                tracing::info!(
                    user_id,
                    cancelled = report.cancelled,
                    "inbound pass: {}",
                    report.summary()
                );
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(user_id, error = %err, "inbound pass aborted: {}", report.summary());
                // A rate limit clears up on its own; anything else that got
                // this far has used up its retries.
                let health = match &err {
                    SyncError::RateLimited { .. } => SyncHealth::Degraded,
                    _ => SyncHealth::NeedsAttention,
                };
                refresh_health(
                    self.store.as_ref(),
                    user_id,
                    HealthNote::InboundFailed(health, format!("Inbound sync failed: {err}")),
                )?;
                Err(err)
            }
        }
    }

    async fn scan(
        &self,
        link: &CalendarLink,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        let range = TimeRange::days_from((self.clock)(), self.horizon_days);
        let mut seen_tokens = HashSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let Some(page) = self
                .fetch_page(link, range, page_token.as_deref(), cancel)
                .await?
            else {
                report.cancelled = true;
                return Ok(());
            };
            report.fetched += page.events.len();

            for event in &page.events {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return Ok(());
                }
                let outcome = match self.apply(link, event) {
                    Ok(outcome) => outcome,
                    Err(SyncError::Mapping(e)) => {
                        tracing::warn!(
                            event_id = %event.id,
                            warning = %e,
                            "inbound event cannot be mapped"
                        );
                        report.mapping_warnings.push(e.to_string());
                        match e {
                            MappingError::UntitledEvent(_) => InboundOutcome::SkippedUntitled,
                            _ => InboundOutcome::Ignored,
                        }
                    }
                    Err(e) => return Err(e),
                };
                tracing::debug!(event_id = %event.id, ?outcome, "inbound event processed");
                report.record(&outcome);
            }

            match page.next_page_token {
                None => return Ok(()),
                Some(next) => {
                    if !seen_tokens.insert(next.clone()) {
                        return Err(SyncError::Rejected(format!(
                            "provider repeated page token '{next}'"
                        )));
                    }
                    page_token = Some(next);
                }
            }
        }
    }

    /// One page of events, retrying transient failures and rate limits
    /// with backoff. `None` when cancelled while waiting to retry. A
    /// rate limit asking for longer than the policy's cap is not waited
    /// out here; the next pass picks it up.
    async fn fetch_page(
        &self,
        link: &CalendarLink,
        range: TimeRange,
        page_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<EventPage>, SyncError> {
        let user_id = link.user_id.as_str();
        let mut attempts = 0;
        loop {
            // Re-read every attempt: a 401 invalidates the cached token.
            let token = self.tokens.ensure_valid_token(user_id).await?;
            let err = match self
                .provider
                .list_events(&token, &link.calendar_id, range, page_token)
                .await
            {
                Ok(page) => return Ok(Some(page)),
                Err(e) => self.provider_error(user_id, e),
            };

            let delay = match &err {
                SyncError::RateLimited { retry_after: Some(d) } => *d,
                SyncError::RateLimited { retry_after: None } | SyncError::TransientProvider(_) => {
                    self.policy.delay(attempts + 1)
                }
                _ => return Err(err),
            };
            attempts += 1;
            if !self.policy.allows(attempts) || delay > self.policy.max {
                return Err(err);
            }
            tracing::debug!(user_id, attempts, ?delay, error = %err, "retrying event listing");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    fn provider_error(&self, user_id: &str, err: ProviderError) -> SyncError {
        if matches!(err, ProviderError::Unauthorized) {
            if let Err(e) = self.tokens.invalidate(user_id) {
                tracing::warn!(user_id, error = %e, "could not invalidate access token");
            }
        }
        err.into()
    }

    /// Merge one event. Rules are applied in order; the first that matches
    /// decides the outcome.
    fn apply(
        &self,
        link: &CalendarLink,
        event: &ExternalEvent,
    ) -> Result<InboundOutcome, SyncError> {
        let user_id = link.user_id.as_str();
        let now = (self.clock)();

        // Cancelled events often come back without a title, so the title
        // check only applies to live ones.
        if !event.is_cancelled() && event.title.trim().is_empty() {
            return Err(MappingError::UntitledEvent(event.id.clone()).into());
        }

        if let Some(record) = self.store.find_routine_record(&event.id)? {
            if event.is_cancelled() {
                self.store.delete_routine_record_by_event(&event.id)?;
                if record.occurrence_date >= now.with_timezone(&link.tz()).date_naive() {
                    // Drop the window so the next materialization pass
                    // recreates the occurrence.
                    self.store.delete_routine_window(record.routine_id)?;
                }
                return Ok(InboundOutcome::RoutineRecordRemoved);
            }
            return self.apply_routine_metadata(record.routine_id, event);
        }

        let routine_origin = matches!(event.origin, Some(EventOrigin::Routine { .. }));
        if routine_origin || self.mapper.has_marker(&event.title) {
            return Ok(InboundOutcome::SkippedSelfAuthored);
        }

        let linked = self.store.find_task_by_event(user_id, &event.id)?;

        if event.is_cancelled() {
            return match linked {
                Some(task) => {
                    self.store.delete_task(task.id)?;
                    self.store.delete_routine_record_by_event(&event.id)?;
                    Ok(InboundOutcome::TaskDeleted)
                }
                None => Ok(InboundOutcome::Ignored),
            };
        }

        if let Some(mut task) = linked {
            if resolve_conflict(&task, event) == MergeDecision::UseLocal {
                return Ok(InboundOutcome::TaskUnchanged);
            }
            let synced_at = event.updated.unwrap_or(now);
            self.mapper.apply_event(event, &mut task, link.tz())?;
            task.last_synced_at = Some(synced_at);
            // Matching updated_at keeps the task out of the outbound backlog.
            task.updated_at = synced_at;
            self.store.update_task(&task)?;
            return Ok(InboundOutcome::ConflictResolved);
        }

        if let Some(EventOrigin::Task(task_id)) = event.origin {
            return self.adopt(link, task_id, event, now);
        }

        let mut task = self.mapper.event_to_task(event, user_id, link.tz())?;
        task.private = false;
        task.calendar_id = Some(link.calendar_id.clone());
        task.last_synced_at = Some(now);
        task.updated_at = now;
        self.store.upsert_from_inbound(&task)?;
        Ok(InboundOutcome::TaskCreated)
    }

    fn apply_routine_metadata(
        &self,
        routine_id: i64,
        event: &ExternalEvent,
    ) -> Result<InboundOutcome, SyncError> {
        let Some(routine) = self.store.get_routine(routine_id)? else {
            return Ok(InboundOutcome::Ignored);
        };
        let title = self.mapper.strip_marker(&event.title);
        if title.is_empty() {
            return Ok(InboundOutcome::SkippedUntitled);
        }
        if title == routine.title && event.description == routine.description {
            return Ok(InboundOutcome::RoutineUnchanged);
        }
        // Sibling occurrences still carry the old title until the queued
        // update rewrites them; only an edit newer than the routine counts.
        let decision = decide_merge(Some(routine.updated_at), event.updated, routine.private);
        if decision == MergeDecision::UseLocal {
            return Ok(InboundOutcome::RoutineUnchanged);
        }
        self.store
            .update_routine_display(routine_id, &title, event.description.as_deref())?;
        // Carry the new title to the routine's other occurrences.
        if let Some(updated) = self.store.get_routine(routine_id)? {
            self.queue.enqueue_routine(&updated, ChangeKind::Update)?;
        }
        Ok(InboundOutcome::RoutineMetadataUpdated)
    }

    /// The event was authored by a local task. Adopt its id when the task
    /// has none yet (outbound create raced with this scan).
    fn adopt(
        &self,
        link: &CalendarLink,
        task_id: i64,
        event: &ExternalEvent,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome, SyncError> {
        match self.store.get_task(task_id)? {
            Some(task) if task.user_id == link.user_id && task.event_id.is_none() => {
                let synced_at = event.updated.unwrap_or(now).max(task.updated_at);
                self.store.set_task_sync(
                    task.id,
                    Some(&event.id),
                    Some(&link.calendar_id),
                    Some(synced_at),
                )?;
                Ok(InboundOutcome::TaskAdopted)
            }
            _ => Ok(InboundOutcome::SkippedSelfAuthored),
        }
    }
}
