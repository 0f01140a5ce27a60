use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A dated task that can be mirrored as a calendar event.
///
/// Times are wall-clock values in the owning link's timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 0 until the task is stored.
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub all_day: bool,
    /// Private tasks never leave the device.
    pub private: bool,
    pub event_id: Option<String>,
    pub calendar_id: Option<String>,
    /// None until the first successful sync in either direction.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: 0,
            user_id: String::new(),
            title: String::new(),
            description: None,
            date: None,
            start_time: None,
            end_time: None,
            all_day: false,
            private: false,
            event_id: None,
            calendar_id: None,
            last_synced_at: None,
            updated_at: Utc::now(),
        }
    }
}

impl Task {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn is_linked(&self) -> bool {
        self.event_id.is_some()
    }
}
