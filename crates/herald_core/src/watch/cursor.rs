use std::collections::BTreeMap;
use std::sync::Arc;

use super::{CursorSlot, WatchRegistry};
use crate::error::Result;

/// Decides which upstream items are new and moves cursors forward once a
/// batch has been handed to the queue.
#[derive(Debug, Clone)]
pub struct CursorTracker {
    registry: Arc<WatchRegistry>,
    slot: CursorSlot,
}

impl CursorTracker {
    pub fn new(registry: Arc<WatchRegistry>, slot: CursorSlot) -> Self {
        Self { registry, slot }
    }

    /// An item is new iff it is strictly newer than the cursor.
    pub fn is_new(cursor: i64, candidate_time: i64) -> bool {
        candidate_time > cursor
    }

    pub fn cursor(&self, entity_id: &str) -> Option<i64> {
        self.registry.get(entity_id).and_then(|entity| entity.cursor(self.slot))
    }

    /// Raises one entity's cursor to `max_time` if that is newer, then
    /// persists. Returns whether the cursor moved.
    pub async fn advance(&self, entity_id: &str, max_time: i64) -> Result<bool> {
        let moved = self
            .registry
            .update(entity_id, |entity| entity.raise_cursor(self.slot, max_time))
            .unwrap_or(false);
        self.registry.flush().await?;
        Ok(moved)
    }

    /// Applies every per-entity maximum, then persists once.
    ///
    /// Entities that stopped being watched while the batch was processed
    /// are skipped.
    pub async fn advance_batch(&self, maxima: &BTreeMap<String, i64>) -> Result<usize> {
        let mut moved = 0;
        for (entity_id, &max_time) in maxima {
            let raised = self
                .registry
                .update(entity_id, |entity| entity.raise_cursor(self.slot, max_time))
                .unwrap_or(false);
            if raised {
                moved += 1;
            }
        }
        self.registry.flush().await?;
        Ok(moved)
    }
}
