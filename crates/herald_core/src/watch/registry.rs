use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{Attributes, CommentWatch, CursorSlot, MonitoredEntity, PersistenceStore};
use crate::error::{CoreError, Result};
use crate::id::{SourceType, is_valid_entity_id};
use crate::utils::unix_now;

/// All monitored entities of one source type, mirrored to a persistence
/// document named after the source (`{"user": {"<id>": {...}}}`).
///
/// Reads and in-memory updates go through a synchronous lock and never
/// await. Writes to the store are serialized by a separate async lock and
/// always capture the latest in-memory state, so the document on disk only
/// ever moves forward.
#[derive(Debug)]
pub struct WatchRegistry {
    source_type: SourceType,
    entities: RwLock<BTreeMap<String, MonitoredEntity>>,
    store: Arc<dyn PersistenceStore>,
    write_lock: tokio::sync::Mutex<()>,
}

impl WatchRegistry {
    /// Loads the persisted state for `source_type`, repairing records whose
    /// cursors are missing or unreadable by resetting them to now.
    pub async fn load(source_type: SourceType, store: Arc<dyn PersistenceStore>) -> Result<Self> {
        let now = unix_now();
        let (entities, repaired) = match store.load(source_type.as_str()).await? {
            None => (BTreeMap::new(), 0),
            Some(raw) => match decode(source_type, &raw, now) {
                Ok(decoded) => decoded,
                Err(e) => {
                    error!(
                        "{} watch state is unreadable, starting with no watched entities: {}",
                        source_type, e
                    );
                    (BTreeMap::new(), 0)
                }
            },
        };

        debug!("{} watch state loaded with {} entities", source_type, entities.len());

        let registry = Self {
            source_type,
            entities: RwLock::new(entities),
            store,
            write_lock: tokio::sync::Mutex::new(()),
        };
        if repaired > 0 {
            warn!(
                "{} watch state had {} corrupted records, cursors reset to now",
                source_type, repaired
            );
            registry.flush().await?;
        }
        Ok(registry)
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.read().contains_key(entity_id)
    }

    pub fn get(&self, entity_id: &str) -> Option<MonitoredEntity> {
        self.entities.read().get(entity_id).cloned()
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.read().keys().cloned().collect()
    }

    /// Current cursor of every entity that has the given slot.
    pub fn cursors(&self, slot: CursorSlot) -> BTreeMap<String, i64> {
        self.entities
            .read()
            .iter()
            .filter_map(|(id, entity)| entity.cursor(slot).map(|cursor| (id.clone(), cursor)))
            .collect()
    }

    /// Entities with an active comment watch.
    pub fn comment_targets(&self) -> Vec<MonitoredEntity> {
        self.entities
            .read()
            .values()
            .filter(|entity| entity.comment.is_some())
            .cloned()
            .collect()
    }

    /// Entities whose details were last refreshed at least `max_age` ago.
    pub fn detail_due(&self, now: i64, max_age: Duration) -> Vec<String> {
        self.entities
            .read()
            .values()
            .filter(|entity| entity.detail_due(now, max_age))
            .map(|entity| entity.entity_id.clone())
            .collect()
    }

    /// Applies `f` to one entity in memory. Call [`flush`](Self::flush) to
    /// make the change durable.
    pub fn update<R>(&self, entity_id: &str, f: impl FnOnce(&mut MonitoredEntity) -> R) -> Option<R> {
        self.entities.write().get_mut(entity_id).map(f)
    }

    /// Starts watching an entity. Returns `false` if it was already watched.
    pub async fn insert(&self, entity: MonitoredEntity) -> Result<bool> {
        {
            let mut entities = self.entities.write();
            if entities.contains_key(&entity.entity_id) {
                return Ok(false);
            }
            entities.insert(entity.entity_id.clone(), entity);
        }
        self.flush().await?;
        Ok(true)
    }

    /// Stops watching an entity and forgets its state.
    pub async fn remove(&self, entity_id: &str) -> Result<Option<MonitoredEntity>> {
        let removed = self.entities.write().remove(entity_id);
        if removed.is_some() {
            self.flush().await?;
        }
        Ok(removed)
    }

    /// Installs or clears the comment watch of a watched entity. Returns
    /// `false` if the entity is not watched.
    pub async fn set_comment_watch(&self, entity_id: &str, watch: Option<CommentWatch>) -> Result<bool> {
        if self.update(entity_id, |entity| entity.comment = watch).is_none() {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    /// Writes the current in-memory state to the store.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let document = encode(&self.entities.read());
        let contents = serde_json::to_string(&document)
            .map_err(|e| CoreError::serialization("watch state", e))?;
        self.store.save(self.source_type.as_str(), &contents).await
    }
}

fn encode(entities: &BTreeMap<String, MonitoredEntity>) -> Value {
    let users: Map<String, Value> = entities
        .iter()
        .map(|(id, entity)| {
            let mut record = json!({
                "cursor": entity.cursor,
                "last_detail_refresh": entity.last_detail_refresh,
                "snapshot": entity.snapshot,
            });
            if let Some(watch) = &entity.comment {
                record["comment"] = json!({
                    "cursor": watch.cursor,
                    "include_pinned": watch.include_pinned,
                });
            }
            (id.clone(), record)
        })
        .collect();
    json!({ "user": users })
}

/// Returns the decoded entities and how many records needed repair.
fn decode(
    source_type: SourceType,
    raw: &str,
    now: i64,
) -> std::result::Result<(BTreeMap<String, MonitoredEntity>, usize), serde_json::Error> {
    let root: Value = serde_json::from_str(raw)?;
    let mut entities = BTreeMap::new();
    let mut repaired = 0;

    let Some(users) = root.get("user").and_then(Value::as_object) else {
        warn!("{} watch state has no user table", source_type);
        return Ok((entities, 1));
    };

    for (id, record) in users {
        if !is_valid_entity_id(id) {
            warn!("{} watch state: dropping record with invalid uid {:?}", source_type, id);
            repaired += 1;
            continue;
        }

        let cursor = match record.get("cursor").and_then(Value::as_i64) {
            Some(cursor) => cursor,
            None => {
                warn!("{} {}: cursor unreadable, resetting to now", source_type, id);
                repaired += 1;
                now
            }
        };

        let snapshot: Attributes = record
            .get("snapshot")
            .and_then(Value::as_object)
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|(key, value)| match value {
                        Value::String(s) => Some((key.clone(), s.clone())),
                        Value::Null => None,
                        other => Some((key.clone(), other.to_string())),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let comment = match record.get("comment") {
            None | Some(Value::Null) => None,
            Some(watch) => {
                let cursor = match watch.get("cursor").and_then(Value::as_i64) {
                    Some(cursor) => cursor,
                    None => {
                        warn!("{} {}: comment cursor unreadable, resetting to now", source_type, id);
                        repaired += 1;
                        now
                    }
                };
                let include_pinned = watch
                    .get("include_pinned")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Some(CommentWatch::new(cursor, include_pinned))
            }
        };

        let entity = MonitoredEntity {
            source_type,
            entity_id: id.clone(),
            cursor,
            last_detail_refresh: record
                .get("last_detail_refresh")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            snapshot,
            comment,
        };
        entities.insert(id.clone(), entity);
    }

    Ok((entities, repaired))
}
