//! Outbound dispatcher: executes queued jobs against the provider.
//!
//! Each job re-reads the current entity, so a job that sat in the queue
//! pushes the latest local state rather than its enqueue-time snapshot. The
//! snapshot is only used for deletes, when the entity is already gone.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};

use super::event_mapper::EventMapper;
use super::health::{refresh_health, HealthNote};
use super::retry::RetryPolicy;
use super::token_manager::TokenManager;
use super::types::{ChangeKind, EntityKind, SyncError, SyncJob};
use super::Clock;
use crate::integrations::traits::{CalendarProvider, ProviderError};
use crate::model::{CalendarLink, ExternalEvent, Routine, RoutineEventRecord, Task};
use crate::storage::traits::SyncStore;
use crate::storage::SyncConfig;

const BATCH_SIZE: usize = 50;

/// How long a job waits while its link is disconnected. Reconnecting
/// releases it early.
const PARK_HOURS: i64 = 24;

/// Result of a job that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Synced,
    Skipped(String),
}

/// What one routine pass changed on the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutineSyncReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

pub struct OutboundDispatcher {
    store: Arc<dyn SyncStore>,
    provider: Arc<dyn CalendarProvider>,
    tokens: Arc<TokenManager>,
    mapper: EventMapper,
    policy: RetryPolicy,
    window_days: u32,
    clock: Clock,
}

impl OutboundDispatcher {
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn SyncStore>,
        provider: Arc<dyn CalendarProvider>,
        tokens: Arc<TokenManager>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            provider,
            tokens,
            mapper: EventMapper::new(config.routine_marker.clone()),
            policy: RetryPolicy::outbound(config),
            window_days: config.window_days,
            clock,
        }
    }

    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Run every job that is due. Returns how many were processed.
    pub async fn run_due(&self) -> Result<usize, SyncError> {
        let mut processed = 0;
        loop {
            let jobs = self.store.due_jobs((self.clock)(), BATCH_SIZE)?;
            if jobs.is_empty() {
                break;
            }
            let batch = jobs.len();
            for job in jobs {
                self.process(job).await?;
            }
            processed += batch;
            if batch < BATCH_SIZE {
                break;
            }
        }
        Ok(processed)
    }

    /// Execute one job and record its outcome on the status row and the
    /// link's health.
    pub async fn process(&self, job: SyncJob) -> Result<(), SyncError> {
        let now = (self.clock)();
        let kind = job.entity_kind.as_str();
        let note = match self.execute(&job).await {
            Ok(JobOutcome::Synced) => {
                tracing::debug!(
                    kind,
                    id = job.entity_id,
                    change = job.change.as_str(),
                    "outbound job synced"
                );
                self.store.mark_synced(&job)?;
                HealthNote::OutboundSynced(now)
            }
            Ok(JobOutcome::Skipped(reason)) => {
                tracing::debug!(kind, id = job.entity_id, %reason, "outbound job skipped");
                self.store.mark_skipped(&job, &reason)?;
                HealthNote::None
            }
            Err(SyncError::Mapping(e)) => {
                tracing::warn!(
                    kind,
                    id = job.entity_id,
                    warning = %e,
                    "entity cannot be mapped, skipping"
                );
                self.store.mark_skipped(&job, &e.to_string())?;
                HealthNote::None
            }
            Err(SyncError::NotConnected(_)) => {
                self.store.mark_skipped(&job, "no calendar connected")?;
                HealthNote::None
            }
            Err(SyncError::AuthExpired) => {
                // Parked: attempts are not consumed.
                let message = SyncError::AuthExpired.to_string();
                self.store
                    .mark_retry(&job, job.attempts, now + Duration::hours(PARK_HOURS), &message)?;
                HealthNote::Error(message)
            }
            Err(err) if err.is_retryable() => {
                let attempts = job.attempts + 1;
                let message = err.to_string();
                if self.policy.allows(attempts) {
                    let delay = match &err {
                        SyncError::RateLimited { retry_after: Some(d) } => *d,
                        _ => self.policy.delay(attempts),
                    };
                    tracing::warn!(
                        kind,
                        id = job.entity_id,
                        attempts,
                        ?delay,
                        error = %message,
                        "outbound job failed, will retry"
                    );
                    let next =
                        now + Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(60));
                    self.store.mark_retry(&job, attempts, next, &message)?;
                    HealthNote::None
                } else {
                    tracing::error!(
                        kind,
                        id = job.entity_id,
                        attempts,
                        error = %message,
                        "outbound job exhausted retries"
                    );
                    self.store.mark_failed(&job, attempts, &message)?;
                    HealthNote::Error(format!("Last sync failed: {message}"))
                }
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(
                    kind,
                    id = job.entity_id,
                    error = %message,
                    "outbound job rejected"
                );
                self.store.mark_failed(&job, job.attempts + 1, &message)?;
                HealthNote::Error(format!("Last sync failed: {message}"))
            }
        };
        refresh_health(self.store.as_ref(), &job.user_id, note)?;
        Ok(())
    }

    async fn execute(&self, job: &SyncJob) -> Result<JobOutcome, SyncError> {
        let link = self
            .store
            .get_link(&job.user_id)?
            .ok_or_else(|| SyncError::NotConnected(job.user_id.clone()))?;
        if !link.is_connected() {
            return Err(SyncError::AuthExpired);
        }
        if !link.allows_outbound() {
            return Ok(JobOutcome::Skipped("outbound sync disabled".to_string()));
        }
        let token = self.tokens.ensure_valid_token(&job.user_id).await?;

        match job.entity_kind {
            EntityKind::Task => self.sync_task(&link, &token, job).await,
            EntityKind::Routine => self.sync_routine(&link, &token, job).await,
        }
    }

    /// Convert a provider failure, invalidating the token on a 401 so the
    /// retry refreshes it.
    fn provider_error(&self, user_id: &str, err: ProviderError) -> SyncError {
        if matches!(err, ProviderError::Unauthorized) {
            if let Err(e) = self.tokens.invalidate(user_id) {
                tracing::warn!(user_id, error = %e, "could not invalidate access token");
            }
        }
        err.into()
    }

    async fn delete_event(
        &self,
        link: &CalendarLink,
        token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), SyncError> {
        match self.provider.delete_event(token, calendar_id, event_id).await {
            Ok(()) | Err(ProviderError::NotFound) => Ok(()),
            Err(e) => Err(self.provider_error(&link.user_id, e)),
        }
    }

    // === Tasks ===

    async fn sync_task(
        &self,
        link: &CalendarLink,
        token: &str,
        job: &SyncJob,
    ) -> Result<JobOutcome, SyncError> {
        if job.change == ChangeKind::Delete {
            let snapshot: Task = serde_json::from_value(job.payload.clone())?;
            if let Some(event_id) = &snapshot.event_id {
                let calendar = snapshot.calendar_id.as_deref().unwrap_or(&link.calendar_id);
                self.delete_event(link, token, calendar, event_id).await?;
            }
            return Ok(JobOutcome::Synced);
        }

        let Some(task) = self.store.get_task(job.entity_id)? else {
            return Ok(JobOutcome::Skipped("task no longer exists".to_string()));
        };

        let Some(body) = self.mapper.task_to_body(&task, &link.timezone)? else {
            // Private: nothing may stay on the provider.
            if let Some(event_id) = &task.event_id {
                let calendar = task.calendar_id.as_deref().unwrap_or(&link.calendar_id);
                self.delete_event(link, token, calendar, event_id).await?;
                self.store.set_task_sync(task.id, None, None, None)?;
            }
            return Ok(JobOutcome::Synced);
        };

        let (event, calendar) = match &task.event_id {
            Some(event_id) => {
                let calendar = task
                    .calendar_id
                    .clone()
                    .unwrap_or_else(|| link.calendar_id.clone());
                match self.provider.update_event(token, &calendar, event_id, &body).await {
                    Ok(event) => (event, calendar),
                    Err(ProviderError::NotFound) => {
                        tracing::debug!(
                            task_id = task.id,
                            event_id,
                            "event gone on provider, recreating"
                        );
                        let event = self.create_event(link, token, &link.calendar_id, &body).await?;
                        (event, link.calendar_id.clone())
                    }
                    Err(e) => return Err(self.provider_error(&link.user_id, e)),
                }
            }
            None => {
                let event = self.create_event(link, token, &link.calendar_id, &body).await?;
                (event, link.calendar_id.clone())
            }
        };

        let synced_at = event.updated.unwrap_or_else(|| (self.clock)()).max(task.updated_at);
        match self
            .store
            .set_task_sync(task.id, Some(&event.id), Some(&calendar), Some(synced_at))
        {
            Ok(()) => Ok(JobOutcome::Synced),
            Err(crate::error::DatabaseError::NotFound { .. }) => {
                // Deleted locally while the call was in flight.
                self.delete_event(link, token, &calendar, &event.id).await?;
                Ok(JobOutcome::Synced)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_event(
        &self,
        link: &CalendarLink,
        token: &str,
        calendar_id: &str,
        body: &crate::model::EventBody,
    ) -> Result<ExternalEvent, SyncError> {
        self.provider
            .create_event(token, calendar_id, body)
            .await
            .map_err(|e| self.provider_error(&link.user_id, e))
    }

    // === Routines ===

    async fn sync_routine(
        &self,
        link: &CalendarLink,
        token: &str,
        job: &SyncJob,
    ) -> Result<JobOutcome, SyncError> {
        let routine = match job.change {
            ChangeKind::Delete => None,
            ChangeKind::Create | ChangeKind::Update => self.store.get_routine(job.entity_id)?,
        };
        let today = (self.clock)().with_timezone(&link.tz()).date_naive();

        let report = match routine {
            Some(routine) if !routine.private => {
                self.materialize(link, token, &routine, today, job.change == ChangeKind::Update)
                    .await?
            }
            // Deleted or private: remove every occurrence.
            _ => self.remove_routine(link, token, job.entity_id).await?,
        };
        tracing::debug!(
            routine_id = job.entity_id,
            created = report.created,
            updated = report.updated,
            removed = report.removed,
            "routine synced"
        );
        Ok(JobOutcome::Synced)
    }

    async fn remove_routine(
        &self,
        link: &CalendarLink,
        token: &str,
        routine_id: i64,
    ) -> Result<RoutineSyncReport, SyncError> {
        let mut report = RoutineSyncReport::default();
        for record in self.store.routine_records(routine_id)? {
            self.delete_event(link, token, &record.calendar_id, &record.event_id)
                .await?;
            self.store
                .delete_routine_record(routine_id, record.occurrence_date)?;
            report.removed += 1;
        }
        self.store.delete_routine_window(routine_id)?;
        Ok(report)
    }

    /// Bring the routine's occurrences in `[today, today + W)` onto the
    /// provider. Existing future events are rewritten only when
    /// `update_existing` is set; dates that no longer match the schedule
    /// are removed. Ledger rows before `today` are dropped and the window
    /// end moves to `today + W - 1` in the same transaction as the new rows.
    pub async fn materialize(
        &self,
        link: &CalendarLink,
        token: &str,
        routine: &Routine,
        today: NaiveDate,
        update_existing: bool,
    ) -> Result<RoutineSyncReport, SyncError> {
        let mut report = RoutineSyncReport::default();
        let mut new_records = Vec::new();
        let result = self
            .materialize_inner(
                link,
                token,
                routine,
                today,
                update_existing,
                &mut report,
                &mut new_records,
            )
            .await;

        let window_end = result
            .is_ok()
            .then(|| today + Duration::days(i64::from(self.window_days.max(1)) - 1));
        // Whatever was created is recorded even when the pass failed midway.
        self.store
            .commit_routine_window(routine.id, today, &new_records, window_end)?;
        result.map(|()| report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize_inner(
        &self,
        link: &CalendarLink,
        token: &str,
        routine: &Routine,
        today: NaiveDate,
        update_existing: bool,
        report: &mut RoutineSyncReport,
        new_records: &mut Vec<RoutineEventRecord>,
    ) -> Result<(), SyncError> {
        let existing: HashMap<NaiveDate, RoutineEventRecord> = self
            .store
            .routine_records(routine.id)?
            .into_iter()
            .filter(|r| r.occurrence_date >= today)
            .map(|r| (r.occurrence_date, r))
            .collect();

        for (date, record) in &existing {
            if !routine.occurs_on(*date) {
                self.delete_event(link, token, &record.calendar_id, &record.event_id)
                    .await?;
                self.store.delete_routine_record(routine.id, *date)?;
                report.removed += 1;
                continue;
            }
            if !update_existing {
                continue;
            }
            let Some(body) =
                self.mapper.routine_occurrence_body(routine, *date, &link.timezone)?
            else {
                continue;
            };
            match self
                .provider
                .update_event(token, &record.calendar_id, &record.event_id, &body)
                .await
            {
                Ok(_) => report.updated += 1,
                Err(ProviderError::NotFound) => {
                    let event = self.create_event(link, token, &link.calendar_id, &body).await?;
                    new_records.push(self.record(routine.id, *date, link, event.id));
                    report.created += 1;
                }
                Err(e) => return Err(self.provider_error(&link.user_id, e)),
            }
        }

        for date in routine.occurrences(today, self.window_days) {
            if existing.contains_key(&date) {
                continue;
            }
            let Some(body) =
                self.mapper.routine_occurrence_body(routine, date, &link.timezone)?
            else {
                continue;
            };
            let event = self.create_event(link, token, &link.calendar_id, &body).await?;
            new_records.push(self.record(routine.id, date, link, event.id));
            report.created += 1;
        }
        Ok(())
    }

    fn record(
        &self,
        routine_id: i64,
        date: NaiveDate,
        link: &CalendarLink,
        event_id: String,
    ) -> RoutineEventRecord {
        RoutineEventRecord {
            routine_id,
            occurrence_date: date,
            event_id,
            calendar_id: link.calendar_id.clone(),
            created_at: (self.clock)(),
        }
    }
}
