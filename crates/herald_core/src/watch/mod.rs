//! Per-entity watch state: what we last saw for every monitored upstream
//! entity, and the machinery that keeps it durable.

mod cursor;
mod diff;
mod registry;
mod store;

pub use cursor::CursorTracker;
pub use diff::SnapshotDiffer;
pub use registry::WatchRegistry;
pub use store::{JsonFileStore, MemoryStore, PersistenceStore};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::event::EntityRef;
use crate::id::SourceType;

/// Attribute name to last observed value.
pub type Attributes = BTreeMap<String, String>;

/// Which cursor of an entity a tracker advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorSlot {
    /// Main feed items
    Primary,
    /// Comments on the entity's latest post
    Comment,
}

/// An active comment watch on one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentWatch {
    pub cursor: i64,
    /// Also scan the entity's pinned post
    #[serde(default)]
    pub include_pinned: bool,
}

impl CommentWatch {
    pub fn new(cursor: i64, include_pinned: bool) -> Self {
        Self {
            cursor,
            include_pinned,
        }
    }
}

/// Everything we remember about one watched upstream entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredEntity {
    pub source_type: SourceType,
    pub entity_id: String,
    /// Only items strictly newer than this are reported.
    pub cursor: i64,
    pub last_detail_refresh: i64,
    pub snapshot: Attributes,
    pub comment: Option<CommentWatch>,
}

impl MonitoredEntity {
    pub fn new(source_type: SourceType, entity_id: impl Into<String>, cursor: i64) -> Self {
        Self {
            source_type,
            entity_id: entity_id.into(),
            cursor,
            last_detail_refresh: 0,
            snapshot: Attributes::new(),
            comment: None,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.snapshot.get("name").map(String::as_str)
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_id.clone(), self.display_name().map(str::to_owned))
    }

    pub fn cursor(&self, slot: CursorSlot) -> Option<i64> {
        match slot {
            CursorSlot::Primary => Some(self.cursor),
            CursorSlot::Comment => self.comment.as_ref().map(|watch| watch.cursor),
        }
    }

    /// Raises the slot's cursor to `candidate` if that is newer. Returns
    /// whether the cursor moved.
    pub(crate) fn raise_cursor(&mut self, slot: CursorSlot, candidate: i64) -> bool {
        let cursor = match slot {
            CursorSlot::Primary => &mut self.cursor,
            CursorSlot::Comment => match self.comment.as_mut() {
                Some(watch) => &mut watch.cursor,
                None => return false,
            },
        };
        if candidate > *cursor {
            *cursor = candidate;
            true
        } else {
            false
        }
    }

    pub fn detail_due(&self, now: i64, max_age: Duration) -> bool {
        now.saturating_sub(self.last_detail_refresh) >= max_age.as_secs() as i64
    }
}
