//! Tests for sync types module.

#[cfg(test)]
mod tests {
    use super::super::types::*;
    use crate::error::DatabaseError;
    use crate::integrations::traits::ProviderError;
    use std::time::Duration;

    #[test]
    fn provider_errors_classify_into_taxonomy() {
        assert!(matches!(
            SyncError::from(ProviderError::InvalidGrant("revoked".into())),
            SyncError::AuthExpired
        ));
        let limited = SyncError::from(ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        });
        assert!(matches!(
            limited,
            SyncError::RateLimited { retry_after: Some(d) } if d.as_secs() == 30
        ));
        assert!(SyncError::from(ProviderError::Transient("503".into())).is_retryable());
        assert!(SyncError::from(ProviderError::Unauthorized).is_retryable());
        assert!(!SyncError::from(ProviderError::Rejected {
            status: 400,
            message: "bad".into()
        })
        .is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        assert!(!SyncError::AuthExpired.is_retryable());
        assert!(!SyncError::Config("bad tz".into()).is_retryable());
        assert!(!SyncError::NotConnected("u1".into()).is_retryable());
        assert!(SyncError::Store(DatabaseError::VersionConflict {
            entity: "calendar_link",
            id: "u1".into(),
            expected: 3,
        })
        .is_retryable());
    }

    #[test]
    fn storage_forms_round_trip() {
        for k in [EntityKind::Task, EntityKind::Routine] {
            assert_eq!(EntityKind::parse(k.as_str()), Some(k));
        }
        for c in [ChangeKind::Create, ChangeKind::Update, ChangeKind::Delete] {
            assert_eq!(ChangeKind::parse(c.as_str()), Some(c));
        }
        for s in [
            JobState::Pending,
            JobState::Retrying,
            JobState::Failed,
            JobState::Skipped,
            JobState::Synced,
        ] {
            assert_eq!(JobState::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobState::parse("done"), None);
        assert_eq!(EntityKind::parse(""), None);
    }

    #[test]
    fn report_tallies_outcomes() {
        let mut report = ReconcileReport::default();
        report.record(&InboundOutcome::TaskCreated);
        report.record(&InboundOutcome::ConflictResolved);
        report.record(&InboundOutcome::SkippedSelfAuthored);
        report.record(&InboundOutcome::SkippedUntitled);
        report.record(&InboundOutcome::TaskUnchanged);
        report.record(&InboundOutcome::RoutineUnchanged);
        report.record(&InboundOutcome::RoutineRecordRemoved);
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.routine_records_removed, 1);
        assert_eq!(report.deleted, 0);
    }

    #[test]
    fn report_summary_is_one_line() {
        let report = ReconcileReport {
            fetched: 4,
            created: 2,
            deleted: 1,
            ..Default::default()
        };
        let summary = report.summary();
        assert!(summary.starts_with("fetched 4"));
        assert!(summary.contains("+2"));
        assert!(!summary.contains('\n'));
    }

    #[test]
    fn report_serializes_for_the_cli() {
        let report = ReconcileReport {
            created: 3,
            mapping_warnings: vec!["event 'x' has an empty title".into()],
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["created"], 3);
        assert_eq!(json["mapping_warnings"][0], "event 'x' has an empty title");
        assert_eq!(json["cancelled"], false);
    }
}
