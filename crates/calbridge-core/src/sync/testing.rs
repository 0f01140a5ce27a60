//! In-memory calendar provider for engine tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::integrations::traits::{
    CalendarProvider, EventPage, ProviderError, RefreshedToken, TimeRange,
};
use crate::model::{BodyTime, CalendarLink, EventBody, EventStatus, EventTime, ExternalEvent};
use crate::storage::traits::LinkStore;
use crate::storage::SqliteStore;

#[derive(Default)]
struct FakeState {
    /// event id -> (calendar id, event)
    events: BTreeMap<String, (String, ExternalEvent)>,
    next_id: u64,
    fail_next: VecDeque<ProviderError>,
    refresh_failures: VecDeque<ProviderError>,
    calls: Vec<String>,
}

pub(crate) struct FakeProvider {
    state: Mutex<FakeState>,
    refreshes: AtomicUsize,
    lists_in_flight: AtomicUsize,
    max_lists_in_flight: AtomicUsize,
    pub refresh_delay: Duration,
    pub list_delay: Duration,
    pub page_size: usize,
    pub repeat_page_token: bool,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            refreshes: AtomicUsize::new(0),
            lists_in_flight: AtomicUsize::new(0),
            max_lists_in_flight: AtomicUsize::new(0),
            refresh_delay: Duration::ZERO,
            list_delay: Duration::ZERO,
            page_size: 100,
            repeat_page_token: false,
        }
    }
}

fn to_event_time(time: &BodyTime, tz: Tz) -> EventTime {
    match time {
        BodyTime::Date(d) => EventTime::Date(*d),
        BodyTime::Local(naive) => {
            let zoned = tz
                .from_local_datetime(naive)
                .earliest()
                .unwrap_or_else(|| tz.from_utc_datetime(naive));
            EventTime::DateTime(zoned.fixed_offset())
        }
    }
}

fn starts_at(event: &ExternalEvent) -> Option<DateTime<Utc>> {
    match event.start? {
        EventTime::DateTime(dt) => Some(dt.with_timezone(&Utc)),
        EventTime::Date(d) => d.and_hms_opt(0, 0, 0).map(|n| n.and_utc()),
    }
}

impl FakeProvider {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Provider whose token endpoint takes `delay` to answer.
    pub fn with_refresh_delay(delay: Duration) -> Self {
        Self {
            refresh_delay: delay,
            ..Self::default()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_failure(&self, call: String) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls.push(call);
        match state.fail_next.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn event_from_body(id: String, body: &EventBody) -> ExternalEvent {
        let tz = body.time_zone.parse::<Tz>().unwrap_or(Tz::UTC);
        ExternalEvent {
            id,
            title: body.summary.clone(),
            description: body.description.clone(),
            start: Some(to_event_time(&body.start, tz)),
            end: Some(to_event_time(&body.end, tz)),
            time_zone: Some(body.time_zone.clone()),
            status: EventStatus::Confirmed,
            updated: Some(Utc::now()),
            origin: Some(body.origin),
        }
    }

    /// Queue an error for the next event call (list/create/update/delete).
    pub fn fail_next(&self, err: ProviderError) {
        self.lock().fail_next.push_back(err);
    }

    /// Queue an error for the next refresh call.
    pub fn fail_refresh(&self, err: ProviderError) {
        self.lock().refresh_failures.push_back(err);
    }

    /// Put an event on the calendar as if another client created it.
    pub fn insert(&self, calendar_id: &str, event: ExternalEvent) {
        self.lock()
            .events
            .insert(event.id.clone(), (calendar_id.to_string(), event));
    }

    pub fn edit(&self, event_id: &str, change: impl FnOnce(&mut ExternalEvent)) {
        if let Some((_, ev)) = self.lock().events.get_mut(event_id) {
            change(ev);
        }
    }

    pub fn event(&self, event_id: &str) -> Option<ExternalEvent> {
        self.lock().events.get(event_id).map(|(_, e)| e.clone())
    }

    /// Live (non-cancelled) events, ordered by id.
    pub fn live_events(&self) -> Vec<ExternalEvent> {
        self.lock()
            .events
            .values()
            .filter(|(_, e)| !e.is_cancelled())
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Most list calls that were ever in flight at the same time.
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_lists_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalendarProvider for FakeProvider {
    async fn list_events(
        &self,
        _access_token: &str,
        calendar_id: &str,
        range: TimeRange,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError> {
        self.take_failure(format!("list:{}", page_token.unwrap_or("")))?;
        if !self.list_delay.is_zero() {
            let running = self.lists_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_lists_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.list_delay).await;
            self.lists_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        let state = self.lock();
        let matching: Vec<ExternalEvent> = state
            .events
            .values()
            .filter(|(cal, _)| cal == calendar_id)
            .map(|(_, e)| e)
            .filter(|e| match starts_at(e) {
                Some(start) => start >= range.start && start < range.end,
                None => e.is_cancelled(),
            })
            .cloned()
            .collect();

        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let page: Vec<ExternalEvent> = matching
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = offset + page.len();
        let next_page_token = if next < matching.len() {
            Some(if self.repeat_page_token {
                offset.to_string()
            } else {
                next.to_string()
            })
        } else {
            None
        };
        Ok(EventPage {
            events: page,
            next_page_token,
        })
    }

    async fn create_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        body: &EventBody,
    ) -> Result<ExternalEvent, ProviderError> {
        self.take_failure("create".to_string())?;
        let mut state = self.lock();
        state.next_id += 1;
        let event = Self::event_from_body(format!("ev-{}", state.next_id), body);
        state
            .events
            .insert(event.id.clone(), (calendar_id.to_string(), event.clone()));
        Ok(event)
    }

    async fn update_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        event_id: &str,
        body: &EventBody,
    ) -> Result<ExternalEvent, ProviderError> {
        self.take_failure(format!("update:{event_id}"))?;
        let mut state = self.lock();
        match state.events.get(event_id) {
            Some((_, existing)) if !existing.is_cancelled() => {
                let event = Self::event_from_body(event_id.to_string(), body);
                state
                    .events
                    .insert(event_id.to_string(), (calendar_id.to_string(), event.clone()));
                Ok(event)
            }
            _ => Err(ProviderError::NotFound),
        }
    }

    async fn delete_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError> {
        self.take_failure(format!("delete:{event_id}"))?;
        let mut state = self.lock();
        match state.events.get_mut(event_id) {
            Some((_, ev)) if !ev.is_cancelled() => {
                ev.status = EventStatus::Cancelled;
                ev.updated = Some(Utc::now());
                Ok(())
            }
            _ => Err(ProviderError::NotFound),
        }
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<RefreshedToken, ProviderError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        if let Some(err) = self.lock().refresh_failures.pop_front() {
            return Err(err);
        }
        Ok(RefreshedToken {
            access_token: format!("at-{n}"),
            expires_in: 3600,
            refresh_token: None,
        })
    }
}

/// In-memory store with a connected link for `user_id`.
pub(crate) fn store_with_link(user_id: &str, timezone: &str) -> Arc<SqliteStore> {
    let store = SqliteStore::open_memory().unwrap();
    store
        .save_link(&CalendarLink::new(user_id, "at-0", "rt-0", 3600, "primary", timezone))
        .unwrap();
    Arc::new(store)
}

/// Manually advanced clock.
#[derive(Clone)]
pub(crate) struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    /// Slightly ahead of the wall clock, so rows the store stamps with the
    /// real time are already due.
    pub fn starting_now() -> Self {
        Self::at(Utc::now() + chrono::Duration::minutes(1))
    }

    pub fn today(&self) -> chrono::NaiveDate {
        self.now().date_naive()
    }

    pub fn clock(&self) -> super::Clock {
        let inner = self.0.clone();
        Arc::new(move || *inner.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

/// Engine over `store` and `provider` with millisecond retries.
pub(crate) fn engine(
    store: Arc<SqliteStore>,
    provider: Arc<FakeProvider>,
    clock: &TestClock,
) -> super::SyncEngine {
    let config = crate::storage::SyncConfig::default();
    super::SyncEngine::with_clock(&config, store, provider, clock.clock()).with_retry_policy(
        super::RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
            config.max_attempts,
        ),
    )
}
