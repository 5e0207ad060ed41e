use std::collections::BTreeMap;

use super::{Attributes, MonitoredEntity};
use crate::event::{AttributeDelta, EntityRef, Event};

/// Compares observed profile attributes against an entity's snapshot.
pub struct SnapshotDiffer;

impl SnapshotDiffer {
    /// Emits one change event per attribute whose value differs from a
    /// previously known value, and records every observed value.
    ///
    /// The first observation of an attribute only fills the snapshot. The
    /// snapshot is updated in the same step as the comparison, so the same
    /// change is never reported twice.
    pub fn diff(entity: &mut MonitoredEntity, observed: &Attributes, observed_at: i64) -> Vec<Event> {
        Self::diff_with_context(entity, observed, &BTreeMap::new(), observed_at)
    }

    /// Like [`diff`](Self::diff), attaching `context` to every emitted delta.
    pub fn diff_with_context(
        entity: &mut MonitoredEntity,
        observed: &Attributes,
        context: &BTreeMap<String, String>,
        observed_at: i64,
    ) -> Vec<Event> {
        let name = entity
            .display_name()
            .or_else(|| context.get("name").map(String::as_str))
            .map(str::to_owned);
        let user = EntityRef::new(entity.entity_id.clone(), name);

        let mut events = Vec::new();
        for (attribute, now) in observed {
            match entity.snapshot.insert(attribute.clone(), now.clone()) {
                Some(previous) if previous != *now => {
                    events.push(Event::attribute_changed(
                        entity.source_type,
                        user.clone(),
                        AttributeDelta {
                            attribute: attribute.clone(),
                            previous,
                            now: now.clone(),
                            context: context.clone(),
                        },
                        observed_at,
                    ));
                }
                _ => {}
            }
        }
        events
    }
}
