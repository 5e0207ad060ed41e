//! Who wants which events, and how to reach them.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{CoreError, Result};
use crate::id::SourceType;
use crate::watch::PersistenceStore;

const SUBSCRIPTIONS_DOCUMENT: &str = "subscriptions";

/// Reserved address meaning "deliver over the subscriber's persistent channel".
pub const PERSISTENT_ADDRESS: &str = "websocket";

/// Addresses one subscription entry. `subtype == None` is the base level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(rename = "uid")]
    pub entity_id: String,
}

impl SubscriptionKey {
    pub fn new(source_type: SourceType, subtype: Option<String>, entity_id: impl Into<String>) -> Self {
        Self {
            source_type,
            subtype,
            entity_id: entity_id.into(),
        }
    }

    pub fn base(source_type: SourceType, entity_id: impl Into<String>) -> Self {
        Self::new(source_type, None, entity_id)
    }

    pub fn is_base(&self) -> bool {
        self.subtype.is_none()
    }

    pub fn to_base(&self) -> Self {
        Self::base(self.source_type, self.entity_id.clone())
    }
}

/// How a subscriber receives events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// A long-lived channel the subscriber keeps open
    Persistent,
    /// One HTTP POST per event
    FireAndForget { address: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub name: String,
    pub transport: TransportKind,
}

impl Subscriber {
    pub fn persistent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Persistent,
        }
    }

    pub fn fire_and_forget(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::FireAndForget {
                address: address.into(),
            },
        }
    }

    /// Registration address semantics: the reserved word `websocket`
    /// selects the persistent channel, anything else is an HTTP endpoint.
    pub fn from_address(name: impl Into<String>, address: &str) -> Self {
        if address == PERSISTENT_ADDRESS {
            Self::persistent(name)
        } else {
            Self::fire_and_forget(name, address)
        }
    }
}

/// Outcome of removing a subscriber from an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The entry is gone; the caller tears down the upstream watch.
    LastSubscriberRemoved,
    NotSubscribed,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionsDocument {
    #[serde(default)]
    subscribers: BTreeMap<String, TransportKind>,
    #[serde(default)]
    subscriptions: Vec<EntryRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    #[serde(flatten)]
    key: SubscriptionKey,
    subscribers: BTreeSet<String>,
}

/// Map from subscription key to subscriber names, plus the known
/// subscribers themselves.
///
/// Entries never hold an empty subscriber set: removing the last name
/// deletes the entry.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: RwLock<BTreeMap<SubscriptionKey, BTreeSet<String>>>,
    subscribers: RwLock<BTreeMap<String, Subscriber>>,
    store: Arc<dyn PersistenceStore>,
    write_lock: tokio::sync::Mutex<()>,
}

impl SubscriptionRegistry {
    pub async fn load(store: Arc<dyn PersistenceStore>) -> Result<Self> {
        let document = match store.load(SUBSCRIPTIONS_DOCUMENT).await? {
            None => SubscriptionsDocument::default(),
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                error!("subscriptions document is unreadable, starting empty: {}", e);
                SubscriptionsDocument::default()
            }),
        };

        let subscribers = document
            .subscribers
            .into_iter()
            .map(|(name, transport)| (name.clone(), Subscriber { name, transport }))
            .collect();
        let entries = document
            .subscriptions
            .into_iter()
            .filter(|record| !record.subscribers.is_empty())
            .map(|record| (record.key, record.subscribers))
            .collect::<BTreeMap<_, _>>();

        debug!("loaded {} subscription entries", entries.len());

        Ok(Self {
            entries: RwLock::new(entries),
            subscribers: RwLock::new(subscribers),
            store,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Names subscribed to `(source_type, subtype, entity_id)`.
    ///
    /// A subtype with no entry of its own falls back to the entity's base
    /// entry, so attribute changes reach base subscribers.
    pub fn subscribers_for(
        &self,
        source_type: SourceType,
        subtype: Option<&str>,
        entity_id: &str,
    ) -> BTreeSet<String> {
        let entries = self.entries.read();
        let exact = SubscriptionKey::new(source_type, subtype.map(str::to_owned), entity_id);
        if let Some(names) = entries.get(&exact) {
            return names.clone();
        }
        if subtype.is_some() {
            if let Some(names) = entries.get(&exact.to_base()) {
                return names.clone();
            }
        }
        BTreeSet::new()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey, name: &str) -> bool {
        self.entries
            .read()
            .get(key)
            .is_some_and(|names| names.contains(name))
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Adds `name` to the entry, creating it if needed. Returns `true` when
    /// the entry is new. Callers establish the upstream watch first.
    pub fn add(&self, key: SubscriptionKey, name: &str) -> bool {
        let mut entries = self.entries.write();
        let created = !entries.contains_key(&key);
        entries.entry(key).or_default().insert(name.to_string());
        created
    }

    pub fn remove(&self, key: &SubscriptionKey, name: &str) -> Removal {
        let mut entries = self.entries.write();
        let Some(names) = entries.get_mut(key) else {
            return Removal::NotSubscribed;
        };
        if !names.remove(name) {
            return Removal::NotSubscribed;
        }
        if names.is_empty() {
            entries.remove(key);
            Removal::LastSubscriberRemoved
        } else {
            Removal::Removed
        }
    }

    /// Drops every subtype entry of an entity. Returns the removed keys.
    pub fn remove_subtypes(&self, source_type: SourceType, entity_id: &str) -> Vec<SubscriptionKey> {
        let mut entries = self.entries.write();
        let doomed: Vec<SubscriptionKey> = entries
            .keys()
            .filter(|key| key.source_type == source_type && key.entity_id == entity_id && !key.is_base())
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        doomed
    }

    pub fn subscriber(&self, name: &str) -> Option<Subscriber> {
        self.subscribers.read().get(name).cloned()
    }

    /// Inserts or replaces a subscriber's delivery details.
    pub fn register_subscriber(&self, subscriber: Subscriber) {
        self.subscribers
            .write()
            .insert(subscriber.name.clone(), subscriber);
    }

    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let document = SubscriptionsDocument {
            subscribers: self
                .subscribers
                .read()
                .values()
                .map(|s| (s.name.clone(), s.transport.clone()))
                .collect(),
            subscriptions: self
                .entries
                .read()
                .iter()
                .map(|(key, names)| EntryRecord {
                    key: key.clone(),
                    subscribers: names.clone(),
                })
                .collect(),
        };
        let contents = serde_json::to_string(&document)
            .map_err(|e| CoreError::serialization("subscriptions", e))?;
        self.store.save(SUBSCRIPTIONS_DOCUMENT, &contents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::MemoryStore;
    use pretty_assertions::assert_eq;

    async fn registry(store: Arc<MemoryStore>) -> SubscriptionRegistry {
        SubscriptionRegistry::load(store).await.unwrap()
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn last_removal_deletes_entry() {
        let subs = registry(Arc::new(MemoryStore::new())).await;
        let key = SubscriptionKey::base(SourceType::Weibo, "1");

        assert!(subs.add(key.clone(), "a"));
        assert!(!subs.add(key.clone(), "b"));
        assert_eq!(subs.remove(&key, "c"), Removal::NotSubscribed);
        assert_eq!(subs.remove(&key, "a"), Removal::Removed);
        assert_eq!(subs.remove(&key, "b"), Removal::LastSubscriberRemoved);
        assert!(!subs.contains(&key));
        assert_eq!(subs.remove(&key, "b"), Removal::NotSubscribed);
    }

    #[tokio::test]
    async fn subtype_lookup_falls_back_to_base() {
        let subs = registry(Arc::new(MemoryStore::new())).await;
        subs.add(SubscriptionKey::base(SourceType::BiliDyn, "1"), "a");
        subs.add(
            SubscriptionKey::new(SourceType::BiliDyn, Some("comment".into()), "1"),
            "b",
        );

        assert_eq!(subs.subscribers_for(SourceType::BiliDyn, None, "1"), names(&["a"]));
        assert_eq!(
            subs.subscribers_for(SourceType::BiliDyn, Some("comment"), "1"),
            names(&["b"])
        );
        assert_eq!(
            subs.subscribers_for(SourceType::BiliDyn, Some("name"), "1"),
            names(&["a"])
        );
        assert!(subs.subscribers_for(SourceType::BiliDyn, None, "2").is_empty());
        assert!(subs.subscribers_for(SourceType::Weibo, None, "1").is_empty());
    }

    #[tokio::test]
    async fn cascade_removes_only_subtypes() {
        let subs = registry(Arc::new(MemoryStore::new())).await;
        subs.add(SubscriptionKey::base(SourceType::Weibo, "1"), "a");
        subs.add(SubscriptionKey::new(SourceType::Weibo, Some("comment".into()), "1"), "a");
        subs.add(SubscriptionKey::new(SourceType::Weibo, Some("comment".into()), "2"), "a");

        let removed = subs.remove_subtypes(SourceType::Weibo, "1");
        assert_eq!(removed.len(), 1);
        assert_eq!(subs.keys().len(), 2);
    }

    #[tokio::test]
    async fn flush_and_reload() {
        let store = Arc::new(MemoryStore::new());
        let subs = registry(store.clone()).await;
        subs.register_subscriber(Subscriber::from_address("bot", "http://127.0.0.1:8080/push"));
        subs.register_subscriber(Subscriber::from_address("ws-bot", PERSISTENT_ADDRESS));
        subs.add(SubscriptionKey::base(SourceType::BiliLive, "7"), "bot");
        subs.flush().await.unwrap();

        let reloaded = registry(store).await;
        assert_eq!(
            reloaded.subscriber("bot"),
            Some(Subscriber::fire_and_forget("bot", "http://127.0.0.1:8080/push"))
        );
        assert_eq!(reloaded.subscriber("ws-bot"), Some(Subscriber::persistent("ws-bot")));
        assert!(reloaded.is_subscribed(&SubscriptionKey::base(SourceType::BiliLive, "7"), "bot"));
    }
}
