use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// A recurring routine definition.
///
/// Sync reads the schedule and writes back only display metadata
/// (title/description); completion state belongs to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    /// Days the routine occurs on; empty means every day.
    pub days: Vec<Weekday>,
    pub start_time: Option<NaiveTime>,
    pub duration_minutes: u32,
    pub private: bool,
    pub completed_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for Routine {
    fn default() -> Self {
        Self {
            id: 0,
            user_id: String::new(),
            title: String::new(),
            description: None,
            days: Vec::new(),
            start_time: None,
            duration_minutes: 60,
            private: false,
            completed_count: 0,
            updated_at: Utc::now(),
        }
    }
}

impl Routine {
    pub fn occurs_on(&self, date: NaiveDate) -> bool {
        self.days.is_empty() || self.days.contains(&date.weekday())
    }

    /// Dates in `[from, from + days)` on which the routine occurs.
    pub fn occurrences(&self, from: NaiveDate, days: u32) -> Vec<NaiveDate> {
        (0..i64::from(days))
            .map(|offset| from + Duration::days(offset))
            .filter(|d| self.occurs_on(*d))
            .collect()
    }
}

/// One materialized occurrence of a routine on the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineEventRecord {
    pub routine_id: i64,
    pub occurrence_date: NaiveDate,
    pub event_id: String,
    pub calendar_id: String,
    pub created_at: DateTime<Utc>,
}
