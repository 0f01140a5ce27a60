//! Tests for sync_engine module.

#[cfg(test)]
mod tests {
    use crate::integrations::oauth::OAuthTokens;
    use crate::model::{
        AuthState, EventStatus, EventTime, ExternalEvent, Routine, SyncDirection, SyncHealth, Task,
    };
    use crate::storage::traits::{LedgerStore, LinkStore, RoutineStore, SyncStatusStore, TaskStore};
    use crate::sync::health::modify_link;
    use crate::sync::testing::{engine, store_with_link, FakeProvider, TestClock};
    use crate::sync::types::{ChangeKind, EntityKind, JobState, SyncError};
    use chrono::{Duration, NaiveTime};
    use std::time::Duration as StdDuration;

    fn tokens(refresh: Option<&str>) -> OAuthTokens {
        OAuthTokens {
            access_token: "at-new".into(),
            refresh_token: refresh.map(str::to_string),
            expires_in: 3600,
        }
    }

    #[tokio::test]
    async fn background_worker_drains_the_queue() {
        let store = store_with_link("u1", "UTC");
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store.clone(), provider.clone(), &clock);
        let handle = engine.start();

        let id = store
            .create_task(&Task {
                date: Some(clock.today()),
                start_time: NaiveTime::from_hms_opt(15, 0, 0),
                ..Task::new("u1", "Background")
            })
            .unwrap();
        let task = store.get_task(id).unwrap().unwrap();
        engine.sync_task_outbound(&task, ChangeKind::Create).unwrap();

        let synced = tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                let job = store.get_job(EntityKind::Task, id).unwrap().unwrap();
                if job.state == JobState::Synced {
                    break;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await;
        assert!(synced.is_ok(), "worker never picked up the job");
        assert_eq!(provider.calls("create"), 1);

        let token = handle.cancellation_token();
        handle.shutdown().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_cancels_inbound_passes() {
        let store = store_with_link("u1", "UTC");
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store, provider.clone(), &clock);
        provider.insert(
            "primary",
            ExternalEvent {
                id: "ext-1".into(),
                title: "Offsite".into(),
                description: None,
                start: Some(EventTime::Date(clock.today() + Duration::days(1))),
                end: Some(EventTime::Date(clock.today() + Duration::days(2))),
                time_zone: None,
                status: EventStatus::Confirmed,
                updated: Some(clock.now()),
                origin: None,
            },
        );

        engine.start().shutdown().await;
        let report = engine.reconcile_inbound("u1").await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn status_reports_queue_and_health() {
        let store = store_with_link("u1", "UTC");
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store.clone(), provider, &clock);

        let status = engine.status("u1").unwrap();
        assert_eq!(status.health, SyncHealth::Healthy);
        assert_eq!(status.counts.pending, 0);
        assert!(!status.in_progress);

        let id = store
            .create_task(&Task {
                date: Some(clock.today()),
                ..Task::new("u1", "Queued")
            })
            .unwrap();
        let task = store.get_task(id).unwrap().unwrap();
        engine.sync_task_outbound(&task, ChangeKind::Create).unwrap();
        assert_eq!(engine.status("u1").unwrap().counts.pending, 1);

        assert!(matches!(
            engine.status("nobody"),
            Err(SyncError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_pending_picks_up_unsynced_tasks_once() {
        let store = store_with_link("u1", "UTC");
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store.clone(), provider.clone(), &clock);

        for title in ["One", "Two"] {
            store
                .create_task(&Task {
                    date: Some(clock.today()),
                    ..Task::new("u1", title)
                })
                .unwrap();
        }
        store.create_task(&Task::new("u1", "Undated")).unwrap();

        assert_eq!(engine.enqueue_pending("u1").unwrap(), 2);
        assert_eq!(engine.enqueue_pending("u1").unwrap(), 0, "already queued");
        engine.run_outbound_now().await.unwrap();
        assert_eq!(provider.live_events().len(), 2);
        assert_eq!(engine.enqueue_pending("u1").unwrap(), 0);
    }

    #[tokio::test]
    async fn connect_validates_input() {
        let store = store_with_link("u1", "UTC");
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store.clone(), provider, &clock);

        let err = engine
            .connect("u1", &tokens(Some("rt")), "primary", "Mars/Olympus")
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let err = engine.connect("u1", &tokens(None), "primary", "UTC").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        // The old link is untouched by a rejected connect.
        assert_eq!(store.get_link("u1").unwrap().unwrap().access_token, "at-0");
    }

    #[tokio::test]
    async fn reconnect_keeps_settings_and_clears_disconnection() {
        let store = store_with_link("u1", "UTC");
        modify_link(store.as_ref(), "u1", |l| {
            l.direction = SyncDirection::OutboundOnly;
            l.auth_state = AuthState::Disconnected;
        })
        .unwrap();
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store.clone(), provider, &clock);

        let link = engine
            .connect("u1", &tokens(Some("rt-2")), "work", "Europe/Berlin")
            .unwrap();
        assert_eq!(link.direction, SyncDirection::OutboundOnly);
        assert!(link.is_connected());
        assert_eq!(link.calendar_id, "work");
        assert_eq!(link.refresh_token, "rt-2");
        assert_eq!(engine.status("u1").unwrap().health, SyncHealth::Healthy);
    }

    #[tokio::test]
    async fn connect_materializes_existing_routines() {
        let store = store_with_link("u1", "UTC");
        store.delete_link("u1").unwrap();
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store.clone(), provider.clone(), &clock);

        store
            .create_routine(&Routine {
                user_id: "u1".into(),
                title: "Standup".into(),
                start_time: NaiveTime::from_hms_opt(10, 0, 0),
                ..Default::default()
            })
            .unwrap();

        engine.connect("u1", &tokens(Some("rt")), "primary", "UTC").unwrap();
        engine.run_outbound_now().await.unwrap();
        assert_eq!(provider.live_events().len(), 7);
    }

    #[tokio::test]
    async fn disconnect_forgets_mappings_but_keeps_events() {
        let store = store_with_link("u1", "UTC");
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store.clone(), provider.clone(), &clock);

        let id = store
            .create_routine(&Routine {
                user_id: "u1".into(),
                title: "Standup".into(),
                ..Default::default()
            })
            .unwrap();
        let routine = store.get_routine(id).unwrap().unwrap();
        engine.sync_routine_outbound(&routine, ChangeKind::Create).unwrap();
        engine.run_outbound_now().await.unwrap();
        assert_eq!(store.routine_records(id).unwrap().len(), 7);

        engine.disconnect("u1").unwrap();
        assert!(store.get_link("u1").unwrap().is_none());
        assert!(store.routine_records(id).unwrap().is_empty());
        assert_eq!(store.routine_window_end(id).unwrap(), None);
        assert_eq!(provider.live_events().len(), 7);
        assert!(matches!(engine.status("u1"), Err(SyncError::NotConnected(_))));
    }

    #[tokio::test]
    async fn window_refresh_skips_routines_with_queued_changes() {
        let store = store_with_link("u1", "UTC");
        let provider = FakeProvider::shared();
        let clock = TestClock::starting_now();
        let engine = engine(store.clone(), provider.clone(), &clock);

        let id = store
            .create_routine(&Routine {
                user_id: "u1".into(),
                title: "Read".into(),
                ..Default::default()
            })
            .unwrap();
        let routine = store.get_routine(id).unwrap().unwrap();

        // Never materialized: queued once.
        assert_eq!(engine.refresh_routine_windows().unwrap(), 1);
        assert_eq!(engine.refresh_routine_windows().unwrap(), 0, "job already pending");
        engine.run_outbound_now().await.unwrap();

        // Fresh window: nothing to do until the window is nearly used up.
        assert_eq!(engine.refresh_routine_windows().unwrap(), 0);
        clock.advance(Duration::days(6));
        assert_eq!(engine.refresh_routine_windows().unwrap(), 1);
        engine.run_outbound_now().await.unwrap();
        assert_eq!(
            store.routine_window_end(routine.id).unwrap(),
            Some(clock.today() + Duration::days(6))
        );
    }
}
