//! Rolling routine window.
//!
//! Each routine keeps W days of discrete events on the provider. A periodic
//! pass queues a routine for re-materialization once its window end is less
//! than a day away (or it was never materialized); the outbound worker does
//! the actual provider work.

use std::sync::Arc;

use chrono::NaiveDate;

use super::sync_queue::SyncQueue;
use super::types::{ChangeKind, EntityKind, SyncError};
use super::Clock;
use crate::storage::traits::SyncStore;

/// Whether a routine whose window ends at `window_end` must be extended.
pub fn needs_refresh(window_end: Option<NaiveDate>, today: NaiveDate) -> bool {
    match window_end {
        None => true,
        Some(end) => (end - today).num_days() < 1,
    }
}

pub struct RoutineMaterializer {
    store: Arc<dyn SyncStore>,
    queue: SyncQueue,
    clock: Clock,
}

impl RoutineMaterializer {
    pub fn new(store: Arc<dyn SyncStore>, queue: SyncQueue, clock: Clock) -> Self {
        Self { store, queue, clock }
    }

    /// Queue every routine whose window needs extending. Returns how many
    /// were queued.
    pub fn run_once(&self) -> Result<usize, SyncError> {
        let now = (self.clock)();
        let mut queued = 0;
        for link in self.store.list_links()? {
            if !link.is_connected() || !link.allows_outbound() {
                continue;
            }
            let today = now.with_timezone(&link.tz()).date_naive();
            for routine in self.store.list_routines(&link.user_id)? {
                if routine.private {
                    continue;
                }
                let window_end = self.store.routine_window_end(routine.id)?;
                if !needs_refresh(window_end, today) {
                    continue;
                }
                // A queued user edit already re-materializes; replacing it
                // with a plain refresh would lose the edit.
                if self.queue.has_pending(EntityKind::Routine, routine.id)? {
                    continue;
                }
                tracing::debug!(
                    routine_id = routine.id,
                    ?window_end,
                    %today,
                    "routine window needs refresh"
                );
                self.queue.enqueue_routine(&routine, ChangeKind::Create)?;
                queued += 1;
            }
        }
        if queued > 0 {
            tracing::info!(queued, "routine windows queued for refresh");
        }
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    #[test]
    fn refresh_threshold() {
        // Window materialized on June 1st covers June 1st to 7th.
        let end = Some(d(7));
        assert!(!needs_refresh(end, d(1)));
        assert!(!needs_refresh(end, d(6)));
        assert!(needs_refresh(end, d(7)));
        assert!(needs_refresh(end, d(9)));
        assert!(needs_refresh(None, d(1)));
    }
}
