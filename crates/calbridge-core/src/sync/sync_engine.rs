//! Sync engine for bidirectional calendar synchronization.
//!
//! [`SyncEngine`] wires the token manager, outbound dispatcher, routine
//! materializer and inbound reconciler over one store and one provider, and
//! exposes the entry points the application calls. [`SyncEngine::start`]
//! spawns the background loops.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::OutboundDispatcher;
use super::health::{refresh_health, HealthNote};
use super::materializer::RoutineMaterializer;
use super::reconciler::InboundReconciler;
use super::retry::RetryPolicy;
use super::sync_queue::SyncQueue;
use super::token_manager::TokenManager;
use super::types::{ChangeKind, EntityKind, ReconcileReport, SyncError, SyncStatus};
use super::{system_clock, Clock};
use crate::integrations::oauth::OAuthTokens;
use crate::integrations::traits::CalendarProvider;
use crate::model::{CalendarLink, Routine, Task};
use crate::storage::traits::SyncStore;
use crate::storage::SyncConfig;

/// Upper bound on how long the worker sleeps with nothing due.
const IDLE_POLL: Duration = Duration::from_secs(60);

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn SyncStore>,
    queue: SyncQueue,
    tokens: Arc<TokenManager>,
    dispatcher: Arc<OutboundDispatcher>,
    materializer: Arc<RoutineMaterializer>,
    reconciler: Arc<InboundReconciler>,
    clock: Clock,
    shutdown: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn SyncStore>,
        provider: Arc<dyn CalendarProvider>,
    ) -> Self {
        Self::with_clock(config, store, provider, system_clock())
    }

    /// Engine whose notion of "now" comes from `clock`.
    pub fn with_clock(
        config: &SyncConfig,
        store: Arc<dyn SyncStore>,
        provider: Arc<dyn CalendarProvider>,
        clock: Clock,
    ) -> Self {
        let queue = SyncQueue::new(store.clone());
        let tokens = Arc::new(TokenManager::from_config(config, store.clone(), provider.clone()));
        let dispatcher = OutboundDispatcher::new(
            config,
            store.clone(),
            provider.clone(),
            tokens.clone(),
            clock.clone(),
        );
        let materializer = RoutineMaterializer::new(store.clone(), queue.clone(), clock.clone());
        let reconciler = InboundReconciler::new(
            config,
            store.clone(),
            provider,
            tokens.clone(),
            queue.clone(),
            clock.clone(),
        );
        Self {
            config: config.clone(),
            store,
            queue,
            tokens,
            dispatcher: Arc::new(dispatcher),
            materializer: Arc::new(materializer),
            reconciler: Arc::new(reconciler),
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the retry policy for outbound jobs and inbound page fetches.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        // Only called while building, before anything else holds the Arcs.
        if let Some(dispatcher) = Arc::get_mut(&mut self.dispatcher) {
            dispatcher.set_policy(policy);
        }
        if let Some(reconciler) = Arc::get_mut(&mut self.reconciler) {
            reconciler.set_policy(policy);
        }
        self
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    // === Entry points ===

    /// Queue a task change for the provider. Returns once the change is
    /// durable; the provider call happens on the background worker.
    pub fn sync_task_outbound(&self, task: &Task, change: ChangeKind) -> Result<(), SyncError> {
        self.queue.enqueue_task(task, change)
    }

    /// Queue a routine change for the provider.
    pub fn sync_routine_outbound(
        &self,
        routine: &Routine,
        change: ChangeKind,
    ) -> Result<(), SyncError> {
        self.queue.enqueue_routine(routine, change)
    }

    /// Run one inbound pass. Cancelled by [`EngineHandle::shutdown`].
    pub async fn reconcile_inbound(&self, user_id: &str) -> Result<ReconcileReport, SyncError> {
        let cancel = self.shutdown.child_token();
        self.reconcile_inbound_with(user_id, &cancel).await
    }

    /// Run one inbound pass that stops early when `cancel` fires.
    pub async fn reconcile_inbound_with(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, SyncError> {
        self.reconciler.reconcile(user_id, cancel).await
    }

    /// Process every due outbound job now. Returns how many ran.
    pub async fn run_outbound_now(&self) -> Result<usize, SyncError> {
        self.dispatcher.run_due().await
    }

    /// Queue routines whose window needs extending. Returns how many.
    pub fn refresh_routine_windows(&self) -> Result<usize, SyncError> {
        self.materializer.run_once()
    }

    /// Queue every task that was never pushed or changed since its last
    /// sync. Returns how many were queued.
    pub fn enqueue_pending(&self, user_id: &str) -> Result<usize, SyncError> {
        let tasks = self.store.list_pending_outbound(user_id)?;
        let mut queued = 0;
        for task in &tasks {
            if self.queue.has_pending(EntityKind::Task, task.id)? {
                continue;
            }
            self.queue.enqueue_task(task, ChangeKind::Update)?;
            queued += 1;
        }
        Ok(queued)
    }

    // === Link management ===

    /// Store a fresh link after the consent flow and release anything that
    /// was parked while the user was disconnected.
    pub fn connect(
        &self,
        user_id: &str,
        tokens: &OAuthTokens,
        calendar_id: &str,
        timezone: &str,
    ) -> Result<CalendarLink, SyncError> {
        if timezone.parse::<Tz>().is_err() {
            return Err(SyncError::Config(format!("unknown timezone '{timezone}'")));
        }
        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| {
                SyncError::Config("authorization returned no refresh token".to_string())
            })?;

        let mut link = CalendarLink::new(
            user_id,
            tokens.access_token.clone(),
            refresh_token,
            tokens.expires_in,
            calendar_id,
            timezone,
        );
        // Keep the user's settings across reconnects.
        if let Some(previous) = self.store.get_link(user_id)? {
            link.enabled = previous.enabled;
            link.direction = previous.direction;
        }
        let link = self.store.save_link(&link)?;

        let released = self.store.reschedule_user(user_id, (self.clock)())?;
        let queued = self.enqueue_pending(user_id)?;
        self.materializer.run_once()?;
        refresh_health(self.store.as_ref(), user_id, HealthNote::None)?;
        self.queue.wake();
        tracing::info!(user_id, calendar_id, released, queued, "calendar connected");
        Ok(link)
    }

    /// Remove the link and forget every provider mapping of the user.
    /// Events already on the calendar are left alone.
    pub fn disconnect(&self, user_id: &str) -> Result<(), SyncError> {
        self.store.clear_user_ledger(user_id)?;
        self.store.delete_link(user_id)?;
        tracing::info!(user_id, "calendar disconnected");
        Ok(())
    }

    pub fn status(&self, user_id: &str) -> Result<SyncStatus, SyncError> {
        let link = self
            .store
            .get_link(user_id)?
            .ok_or_else(|| SyncError::NotConnected(user_id.to_string()))?;
        Ok(SyncStatus {
            health: link.health,
            last_error: link.last_error,
            last_outbound_sync_at: link.last_outbound_sync_at,
            last_inbound_sync_at: link.last_inbound_sync_at,
            counts: self.store.status_counts(user_id)?,
            in_progress: self.reconciler.is_running(user_id),
        })
    }

    /// Move failed jobs back into the queue. Returns how many.
    pub fn retry_failed(&self, user_id: &str) -> Result<usize, SyncError> {
        let moved = self.store.requeue_failed(user_id)?;
        if moved > 0 {
            refresh_health(self.store.as_ref(), user_id, HealthNote::None)?;
            self.queue.wake();
        }
        Ok(moved)
    }

    // === Background loops ===

    /// Spawn the outbound worker, the periodic routine window refresh and,
    /// when `reconcile_interval_secs` is nonzero, periodic inbound passes
    /// for every connected user.
    pub fn start(&self) -> EngineHandle {
        let cancel = self.shutdown.clone();
        let mut tasks = vec![
            tokio::spawn(outbound_loop(
                self.dispatcher.clone(),
                self.queue.clone(),
                self.clock.clone(),
                cancel.clone(),
            )),
            tokio::spawn(materialize_loop(
                self.materializer.clone(),
                Duration::from_secs(self.config.materialize_interval_secs.max(1)),
                cancel.clone(),
            )),
        ];
        if self.config.reconcile_interval_secs > 0 {
            tasks.push(tokio::spawn(reconcile_loop(
                self.store.clone(),
                self.reconciler.clone(),
                Duration::from_secs(self.config.reconcile_interval_secs),
                cancel.clone(),
            )));
        }
        tracing::info!(loops = tasks.len(), "sync engine started");
        EngineHandle { cancel, tasks }
    }
}

/// Handle to the background loops started by [`SyncEngine::start`].
pub struct EngineHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Token that fires when the engine shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every loop and any running inbound pass, then wait for the
    /// loops to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sync loop ended abnormally");
            }
        }
        tracing::info!("sync engine stopped");
    }
}

async fn outbound_loop(
    dispatcher: Arc<OutboundDispatcher>,
    queue: SyncQueue,
    clock: Clock,
    cancel: CancellationToken,
) {
    loop {
        match dispatcher.run_due().await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(processed = n, "outbound batch done"),
            Err(e) => tracing::error!(error = %e, "outbound worker error"),
        }

        let wait = match queue.time_until_next(clock()) {
            Ok(Some(d)) => d.min(IDLE_POLL),
            Ok(None) => IDLE_POLL,
            Err(e) => {
                tracing::warn!(error = %e, "could not read queue");
                IDLE_POLL
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = queue.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn materialize_loop(
    materializer: Arc<RoutineMaterializer>,
    every: Duration,
    cancel: CancellationToken,
) {
    // The first tick fires immediately, so the pass also runs at start.
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = materializer.run_once() {
                    tracing::error!(error = %e, "routine window refresh failed");
                }
            }
        }
    }
}

async fn reconcile_loop(
    store: Arc<dyn SyncStore>,
    reconciler: Arc<InboundReconciler>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let links = match store.list_links() {
            Ok(links) => links,
            Err(e) => {
                tracing::error!(error = %e, "could not list calendar links");
                continue;
            }
        };
        for link in links.iter().filter(|l| l.is_connected() && l.allows_inbound()) {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = reconciler.reconcile(&link.user_id, &cancel).await {
                tracing::warn!(user_id = %link.user_id, error = %e, "periodic inbound pass failed");
            }
        }
    }
}
