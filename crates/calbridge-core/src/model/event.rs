use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const TASK_ID_KEY: &str = "calbridge_task_id";
const ROUTINE_ID_KEY: &str = "calbridge_routine_id";
const OCCURRENCE_KEY: &str = "calbridge_occurrence";

/// Start or end of an event as the provider reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTime {
    /// All-day events carry a bare date.
    Date(NaiveDate),
    /// Timed events carry the offset the provider declared.
    DateTime(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "cancelled" => EventStatus::Cancelled,
            "tentative" => EventStatus::Tentative,
            _ => EventStatus::Confirmed,
        }
    }
}

/// Which local entity authored a provider event.
///
/// Stamped into the event's private extended properties on every outbound
/// write, so a later inbound scan can tie the event back to its source even
/// before the event id has been persisted locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    Task(i64),
    Routine { routine_id: i64, date: NaiveDate },
}

impl EventOrigin {
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        match self {
            EventOrigin::Task(id) => {
                props.insert(TASK_ID_KEY.to_string(), id.to_string());
            }
            EventOrigin::Routine { routine_id, date } => {
                props.insert(ROUTINE_ID_KEY.to_string(), routine_id.to_string());
                props.insert(OCCURRENCE_KEY.to_string(), date.format("%Y-%m-%d").to_string());
            }
        }
        props
    }

    pub fn from_properties(props: &HashMap<String, String>) -> Option<Self> {
        if let Some(id) = props.get(TASK_ID_KEY).and_then(|v| v.parse().ok()) {
            return Some(EventOrigin::Task(id));
        }
        let routine_id = props.get(ROUTINE_ID_KEY)?.parse().ok()?;
        let date = NaiveDate::parse_from_str(props.get(OCCURRENCE_KEY)?, "%Y-%m-%d").ok()?;
        Some(EventOrigin::Routine { routine_id, date })
    }
}

/// A calendar entry fetched from the provider. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    /// Cancelled events may come back without times.
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    /// IANA zone the provider declared for the event, if any.
    pub time_zone: Option<String>,
    pub status: EventStatus,
    pub updated: Option<DateTime<Utc>>,
    pub origin: Option<EventOrigin>,
}

impl ExternalEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }
}

/// Wall-clock time used when writing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyTime {
    Date(NaiveDate),
    /// Local time in [`EventBody::time_zone`].
    Local(NaiveDateTime),
}

/// Payload for provider create/update calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub summary: String,
    pub description: Option<String>,
    pub start: BodyTime,
    pub end: BodyTime,
    pub time_zone: String,
    pub origin: EventOrigin,
}
