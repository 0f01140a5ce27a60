//! Translation between local entities and provider events.
//!
//! Pure functions only; nothing here touches storage or the network.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use chrono_tz::Tz;

use crate::model::{BodyTime, EventBody, EventOrigin, EventTime, ExternalEvent, Routine, Task};

/// An entity or event that cannot be represented on the other side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("{kind} {id} has an empty title")]
    EmptyTitle { kind: &'static str, id: i64 },

    #[error("task {0} has no date")]
    MissingDate(i64),

    #[error("event '{0}' has an empty title")]
    UntitledEvent(String),

    #[error("event '{0}' has no start time")]
    MissingStart(String),
}

fn default_start() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Timed window on `date`: defaults to 09:00 and one hour when unset. An end
/// at or before the start is treated as missing.
fn timed_window(
    date: NaiveDate,
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
    default_len: Duration,
) -> (NaiveDateTime, NaiveDateTime) {
    let start_dt = date.and_time(start.unwrap_or_else(default_start));
    let end_dt = end
        .map(|t| date.and_time(t))
        .filter(|e| *e > start_dt)
        .unwrap_or(start_dt + default_len);
    (start_dt, end_dt)
}

/// Maps tasks and routine occurrences to provider bodies and back.
#[derive(Debug, Clone)]
pub struct EventMapper {
    marker: String,
}

impl EventMapper {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Whether `title` carries the routine marker (trailing space optional).
    pub fn has_marker(&self, title: &str) -> bool {
        let bare = self.marker.trim_end();
        !bare.is_empty() && title.trim_start().starts_with(bare)
    }

    /// `title` with the routine marker removed.
    pub fn strip_marker(&self, title: &str) -> String {
        let trimmed = title.trim_start();
        let bare = self.marker.trim_end();
        if bare.is_empty() {
            return trimmed.to_string();
        }
        trimmed
            .strip_prefix(bare)
            .map(|rest| rest.trim_start().to_string())
            .unwrap_or_else(|| trimmed.to_string())
    }

    /// Provider body for a task. `Ok(None)` for private tasks.
    pub fn task_to_body(
        &self,
        task: &Task,
        time_zone: &str,
    ) -> Result<Option<EventBody>, MappingError> {
        if task.private {
            return Ok(None);
        }
        if task.title.trim().is_empty() {
            return Err(MappingError::EmptyTitle {
                kind: "task",
                id: task.id,
            });
        }
        let date = task.date.ok_or(MappingError::MissingDate(task.id))?;

        let (start, end) = if task.all_day {
            (BodyTime::Date(date), BodyTime::Date(date + Duration::days(1)))
        } else {
            let (s, e) = timed_window(date, task.start_time, task.end_time, Duration::hours(1));
            (BodyTime::Local(s), BodyTime::Local(e))
        };

        Ok(Some(EventBody {
            summary: task.title.trim().to_string(),
            description: task.description.clone(),
            start,
            end,
            time_zone: time_zone.to_string(),
            origin: EventOrigin::Task(task.id),
        }))
    }

    /// Provider body for one routine occurrence. `Ok(None)` for private routines.
    pub fn routine_occurrence_body(
        &self,
        routine: &Routine,
        date: NaiveDate,
        time_zone: &str,
    ) -> Result<Option<EventBody>, MappingError> {
        if routine.private {
            return Ok(None);
        }
        if routine.title.trim().is_empty() {
            return Err(MappingError::EmptyTitle {
                kind: "routine",
                id: routine.id,
            });
        }

        let minutes = if routine.duration_minutes == 0 {
            60
        } else {
            i64::from(routine.duration_minutes)
        };
        let (start, end) = timed_window(date, routine.start_time, None, Duration::minutes(minutes));

        Ok(Some(EventBody {
            summary: format!("{}{}", self.marker, routine.title.trim()),
            description: routine.description.clone(),
            start: BodyTime::Local(start),
            end: BodyTime::Local(end),
            time_zone: time_zone.to_string(),
            origin: EventOrigin::Routine {
                routine_id: routine.id,
                date,
            },
        }))
    }

    /// Overwrite the scheduling and display fields of `task` from `event`,
    /// converting timed events into `tz`.
    pub fn apply_event(
        &self,
        event: &ExternalEvent,
        task: &mut Task,
        tz: Tz,
    ) -> Result<(), MappingError> {
        let title = event.title.trim();
        if title.is_empty() {
            return Err(MappingError::UntitledEvent(event.id.clone()));
        }
        let start = event
            .start
            .ok_or_else(|| MappingError::MissingStart(event.id.clone()))?;

        match start {
            EventTime::Date(d) => {
                task.date = Some(d);
                task.start_time = None;
                task.end_time = None;
                task.all_day = true;
            }
            EventTime::DateTime(dt) => {
                let local_start = dt.with_timezone(&tz);
                let local_end = match event.end {
                    Some(EventTime::DateTime(e)) => Some(e.with_timezone(&tz)),
                    _ => None,
                };
                task.date = Some(local_start.date_naive());
                task.start_time = Some(local_start.time());
                // A task holds one date; an end on another day is dropped.
                task.end_time = local_end
                    .filter(|e| e.date_naive() == local_start.date_naive())
                    .map(|e| e.time());
                task.all_day = false;
            }
        }

        task.title = title.to_string();
        task.description = event.description.clone();
        task.event_id = Some(event.id.clone());
        Ok(())
    }

    /// New task for `user_id` built from `event`.
    pub fn event_to_task(
        &self,
        event: &ExternalEvent,
        user_id: &str,
        tz: Tz,
    ) -> Result<Task, MappingError> {
        let mut task = Task::new(user_id, "");
        self.apply_event(event, &mut task, tz)?;
        Ok(task)
    }
}

impl Default for EventMapper {
    fn default() -> Self {
        Self::new("[Routine] ")
    }
}
