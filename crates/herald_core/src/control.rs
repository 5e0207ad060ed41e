//! Subscription management.
//!
//! The control plane is the only writer of the subscription registry and
//! the only place that creates or deletes watched entities. It keeps two
//! things in lockstep: a subscription entry exists exactly when the
//! upstream watch behind it is established.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::data_source::SourceAdapter;
use crate::error::ControlError;
use crate::id::{COMMENT_SUBTYPE, SourceType, is_valid_entity_id, normalize_subtype};
use crate::subscription::{PERSISTENT_ADDRESS, Removal, Subscriber, SubscriptionKey, SubscriptionRegistry};
use crate::transport::{ChannelLease, PersistentChannels};
use crate::utils::unix_now;
use crate::watch::{CommentWatch, MonitoredEntity, WatchRegistry};

/// Everything the control plane needs to know about one enabled source.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    pub adapter: Arc<dyn SourceAdapter>,
    pub registry: Arc<WatchRegistry>,
    /// Subtypes that may be subscribed to, e.g. `comment`
    pub subtypes: BTreeSet<String>,
}

/// Arguments of `subscribe` and `unsubscribe`, as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(rename = "uid")]
    pub entity_id: String,
    #[serde(rename = "client_name")]
    pub subscriber: String,
    /// Comment subscriptions only: also scan the pinned post
    #[serde(default, rename = "is_top")]
    pub include_pinned: bool,
}

/// The `{code, msg}` body every control command is answered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub code: i32,
    pub msg: String,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            code: 0,
            msg: "success".to_string(),
        }
    }

    pub fn from_result<T>(result: &Result<T, ControlError>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::from(e),
        }
    }
}

impl From<&ControlError> for ControlResponse {
    fn from(err: &ControlError) -> Self {
        Self {
            code: err.code(),
            msg: err.to_string(),
        }
    }
}

/// A validated subscribe/unsubscribe target.
struct Target<'a> {
    handle: &'a SourceHandle,
    key: SubscriptionKey,
}

#[derive(Debug)]
pub struct ControlPlane {
    sources: BTreeMap<SourceType, SourceHandle>,
    subscriptions: Arc<SubscriptionRegistry>,
    channels: Arc<PersistentChannels>,
    // Serializes mutations so watch setup and registry updates never interleave.
    op_lock: tokio::sync::Mutex<()>,
}

impl ControlPlane {
    pub fn new(
        sources: BTreeMap<SourceType, SourceHandle>,
        subscriptions: Arc<SubscriptionRegistry>,
        channels: Arc<PersistentChannels>,
    ) -> Self {
        Self {
            sources,
            subscriptions,
            channels,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn channels(&self) -> &Arc<PersistentChannels> {
        &self.channels
    }

    pub fn source(&self, source_type: SourceType) -> Option<&SourceHandle> {
        self.sources.get(&source_type)
    }

    /// Creates or replaces a subscriber. The address is either the reserved
    /// word `websocket` or an http(s) URL to POST events to.
    pub async fn register_subscriber(&self, name: &str, address: &str) -> Result<(), ControlError> {
        if name.is_empty() {
            return Err(ControlError::MissingParameter("client_name".to_string()));
        }
        if address.is_empty() {
            return Err(ControlError::MissingParameter("url".to_string()));
        }
        if address != PERSISTENT_ADDRESS {
            let url = Url::parse(address).map_err(|e| ControlError::InvalidAddress(e.to_string()))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ControlError::InvalidAddress(format!(
                    "unsupported scheme {}",
                    url.scheme()
                )));
            }
        }

        let _guard = self.op_lock.lock().await;
        self.subscriptions
            .register_subscriber(Subscriber::from_address(name, address));
        self.subscriptions.flush().await?;
        info!("registered subscriber {} at {}", name, address);
        Ok(())
    }

    /// Opens the persistent channel for `name`, registering it as a
    /// persistent subscriber. Fails while another live channel holds the
    /// name.
    pub async fn open_channel(&self, name: &str) -> Result<ChannelLease, ControlError> {
        if name.is_empty() {
            return Err(ControlError::MissingParameter("client_name".to_string()));
        }
        let lease = self.channels.open(name).ok_or(ControlError::NameInUse)?;

        let _guard = self.op_lock.lock().await;
        self.subscriptions.register_subscriber(Subscriber::persistent(name));
        if let Err(e) = self.subscriptions.flush().await {
            self.channels.close(name, lease.id);
            return Err(e.into());
        }
        info!("persistent channel opened for {}", name);
        Ok(lease)
    }

    pub fn close_channel(&self, name: &str, lease_id: u64) {
        if self.channels.close(name, lease_id) {
            info!("persistent channel closed for {}", name);
        }
    }

    /// Adds the subscriber to `(type, subtype, uid)`, establishing the
    /// upstream watch first if nobody was watching yet.
    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<(), ControlError> {
        let target = self.resolve(request)?;
        if self.subscriptions.subscriber(&request.subscriber).is_none() {
            return Err(ControlError::SubscriberNotInitialized);
        }

        let _guard = self.op_lock.lock().await;
        let Target { handle, key } = target;
        if self.subscriptions.is_subscribed(&key, &request.subscriber) {
            return Ok(());
        }
        if !self.subscriptions.contains(&key) {
            self.establish(handle, &key, request.include_pinned).await?;
        }

        self.subscriptions.add(key.clone(), &request.subscriber);
        self.subscriptions.flush().await?;
        info!(
            "{} subscribed to {} {:?} {}",
            request.subscriber, key.source_type, key.subtype, key.entity_id
        );
        Ok(())
    }

    /// Removes the subscriber from `(type, subtype, uid)`. Removing the last
    /// subscriber tears the upstream watch down.
    pub async fn unsubscribe(&self, request: &SubscribeRequest) -> Result<(), ControlError> {
        let Target { handle, key } = self.resolve(request)?;
        if self.subscriptions.subscriber(&request.subscriber).is_none() {
            return Err(ControlError::SubscriberNotInitialized);
        }

        let _guard = self.op_lock.lock().await;
        match self.subscriptions.remove(&key, &request.subscriber) {
            Removal::NotSubscribed => return Err(ControlError::NotSubscribed),
            Removal::Removed => {}
            Removal::LastSubscriberRemoved => self.tear_down(handle, &key).await?,
        }
        self.subscriptions.flush().await?;
        info!(
            "{} unsubscribed from {} {:?} {}",
            request.subscriber, key.source_type, key.subtype, key.entity_id
        );
        Ok(())
    }

    /// Checks uid, type, enablement and subtype, in that order.
    fn resolve(&self, request: &SubscribeRequest) -> Result<Target<'_>, ControlError> {
        if request.entity_id.is_empty() {
            return Err(ControlError::MissingParameter("uid".to_string()));
        }
        if request.subscriber.is_empty() {
            return Err(ControlError::MissingParameter("client_name".to_string()));
        }
        if !is_valid_entity_id(&request.entity_id) {
            return Err(ControlError::InvalidEntityId);
        }
        let source_type = SourceType::from_str(&request.source_type).map_err(|_| ControlError::InvalidType)?;
        let handle = self.sources.get(&source_type).ok_or(ControlError::SourceDisabled)?;

        let subtype = normalize_subtype(source_type, request.subtype.as_deref());
        if let Some(subtype) = &subtype {
            if !handle.subtypes.contains(subtype) {
                return Err(ControlError::SubtypeDisabled);
            }
        }
        Ok(Target {
            handle,
            key: SubscriptionKey::new(source_type, subtype, request.entity_id.clone()),
        })
    }

    async fn establish(&self, handle: &SourceHandle, key: &SubscriptionKey, include_pinned: bool) -> Result<(), ControlError> {
        let watch_failed = |e: crate::error::FetchError| ControlError::WatchFailed { reason: e.to_string() };

        match key.subtype.as_deref() {
            None => {
                if handle.registry.contains(&key.entity_id) {
                    return Ok(());
                }
                handle
                    .adapter
                    .establish_watch(&key.entity_id, None)
                    .await
                    .map_err(watch_failed)?;
                handle
                    .registry
                    .insert(MonitoredEntity::new(key.source_type, key.entity_id.clone(), unix_now()))
                    .await?;
            }
            Some(subtype) => {
                if !handle.registry.contains(&key.entity_id) {
                    return Err(ControlError::BaseWatchMissing);
                }
                handle
                    .adapter
                    .establish_watch(&key.entity_id, Some(subtype))
                    .await
                    .map_err(watch_failed)?;
                if subtype == COMMENT_SUBTYPE {
                    handle
                        .registry
                        .set_comment_watch(&key.entity_id, Some(CommentWatch::new(unix_now(), include_pinned)))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn tear_down(&self, handle: &SourceHandle, key: &SubscriptionKey) -> Result<(), ControlError> {
        match key.subtype.as_deref() {
            None => {
                handle.registry.remove(&key.entity_id).await?;
                let dropped = self.subscriptions.remove_subtypes(key.source_type, &key.entity_id);
                if !dropped.is_empty() {
                    warn!(
                        "{} {} is no longer watched, dropped {} subtype subscriptions",
                        key.source_type,
                        key.entity_id,
                        dropped.len()
                    );
                }
                info!("stopped watching {} {}", key.source_type, key.entity_id);
            }
            Some(COMMENT_SUBTYPE) => {
                handle.registry.set_comment_watch(&key.entity_id, None).await?;
                info!("stopped comment watch on {} {}", key.source_type, key.entity_id);
            }
            Some(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::CadenceClass;
    use crate::test_helpers::MockAdapter;
    use crate::watch::MemoryStore;
    use pretty_assertions::assert_eq;

    struct Fixture {
        control: ControlPlane,
        adapter: Arc<MockAdapter>,
        registry: Arc<WatchRegistry>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(MockAdapter::new(SourceType::BiliDyn).supporting(CadenceClass::Comment));
        let registry = Arc::new(WatchRegistry::load(SourceType::BiliDyn, store.clone()).await.unwrap());
        let handle = SourceHandle {
            adapter: adapter.clone(),
            registry: registry.clone(),
            subtypes: BTreeSet::from([COMMENT_SUBTYPE.to_string()]),
        };
        let subscriptions = Arc::new(SubscriptionRegistry::load(store).await.unwrap());
        let control = ControlPlane::new(
            BTreeMap::from([(SourceType::BiliDyn, handle)]),
            subscriptions,
            Arc::new(PersistentChannels::new()),
        );
        Fixture {
            control,
            adapter,
            registry,
        }
    }

    fn request(source_type: &str, subtype: Option<&str>, uid: &str, name: &str) -> SubscribeRequest {
        SubscribeRequest {
            source_type: source_type.to_string(),
            subtype: subtype.map(str::to_string),
            entity_id: uid.to_string(),
            subscriber: name.to_string(),
            include_pinned: false,
        }
    }

    fn code(result: Result<(), ControlError>) -> i32 {
        ControlResponse::from_result(&result).code
    }

    #[tokio::test]
    async fn validation_order_and_codes() {
        let f = fixture().await;
        assert_eq!(code(f.control.subscribe(&request("bili_dyn", None, "", "a")).await), 1);
        assert_eq!(code(f.control.subscribe(&request("bili_dyn", None, "12a", "a")).await), 2);
        assert_eq!(code(f.control.subscribe(&request("twitter", None, "1", "a")).await), 3);
        assert_eq!(code(f.control.subscribe(&request("weibo", None, "1", "a")).await), 4);
        assert_eq!(code(f.control.subscribe(&request("bili_dyn", Some("live"), "1", "a")).await), 5);
        assert_eq!(code(f.control.subscribe(&request("bili_dyn", None, "1", "a")).await), 6);
        assert_eq!(code(f.control.unsubscribe(&request("bili_dyn", None, "1", "a")).await), 6);

        f.control.register_subscriber("a", "websocket").await.unwrap();
        assert_eq!(code(f.control.unsubscribe(&request("bili_dyn", None, "1", "a")).await), 7);
    }

    #[tokio::test]
    async fn subscribe_establishes_the_watch_once() {
        let f = fixture().await;
        f.control.register_subscriber("a", "websocket").await.unwrap();
        f.control.register_subscriber("b", "http://127.0.0.1:9000/hook").await.unwrap();

        f.control.subscribe(&request("bili_dyn", None, "1", "a")).await.unwrap();
        f.control.subscribe(&request("bili_dyn", None, "1", "b")).await.unwrap();
        // Subtype equal to the type name is the base level.
        f.control.subscribe(&request("bili_dyn", Some("bili_dyn"), "1", "b")).await.unwrap();

        assert_eq!(f.adapter.watches.lock().len(), 1);
        assert!(f.registry.contains("1"));
        let names = f.control.subscriptions().subscribers_for(SourceType::BiliDyn, None, "1");
        assert_eq!(names, BTreeSet::from(["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn failed_watch_creates_nothing() {
        let f = fixture().await;
        f.adapter.refuse_watches();
        f.control.register_subscriber("a", "websocket").await.unwrap();

        let result = f.control.subscribe(&request("bili_dyn", None, "1", "a")).await;
        assert_eq!(code(result), 8);
        assert!(!f.registry.contains("1"));
        assert!(f.control.subscriptions().keys().is_empty());
    }

    #[tokio::test]
    async fn comment_subscription_needs_the_base_watch() {
        let f = fixture().await;
        f.control.register_subscriber("a", "websocket").await.unwrap();
        let result = f.control.subscribe(&request("bili_dyn", Some("comment"), "1", "a")).await;
        assert_eq!(code(result), 15);

        f.control.subscribe(&request("bili_dyn", None, "1", "a")).await.unwrap();
        let mut comment = request("bili_dyn", Some("comment"), "1", "a");
        comment.include_pinned = true;
        f.control.subscribe(&comment).await.unwrap();

        let watch = f.registry.get("1").unwrap().comment.unwrap();
        assert!(watch.include_pinned);
    }

    #[tokio::test]
    async fn last_comment_subscriber_clears_only_the_comment_watch() {
        let f = fixture().await;
        f.control.register_subscriber("s1", "websocket").await.unwrap();
        f.control.subscribe(&request("bili_dyn", None, "1", "s1")).await.unwrap();
        f.control.subscribe(&request("bili_dyn", Some("comment"), "1", "s1")).await.unwrap();

        f.control.unsubscribe(&request("bili_dyn", Some("comment"), "1", "s1")).await.unwrap();

        let entity = f.registry.get("1").unwrap();
        assert!(entity.comment.is_none());
        let subs = f.control.subscriptions();
        assert!(!subs.contains(&SubscriptionKey::new(SourceType::BiliDyn, Some("comment".into()), "1")));
        assert!(subs.contains(&SubscriptionKey::base(SourceType::BiliDyn, "1")));
    }

    #[tokio::test]
    async fn dropping_the_base_watch_cascades_to_subtypes() {
        let f = fixture().await;
        f.control.register_subscriber("s1", "websocket").await.unwrap();
        f.control.register_subscriber("s2", "websocket").await.unwrap();
        f.control.subscribe(&request("bili_dyn", None, "1", "s1")).await.unwrap();
        f.control.subscribe(&request("bili_dyn", Some("comment"), "1", "s2")).await.unwrap();

        f.control.unsubscribe(&request("bili_dyn", None, "1", "s1")).await.unwrap();

        assert!(!f.registry.contains("1"));
        assert!(f.control.subscriptions().keys().is_empty());
    }

    #[tokio::test]
    async fn subscriber_addresses_are_checked() {
        let f = fixture().await;
        let err = f.control.register_subscriber("a", "not a url").await.unwrap_err();
        assert_eq!(err.code(), 10);
        let err = f.control.register_subscriber("a", "ftp://host/x").await.unwrap_err();
        assert_eq!(err.code(), 10);
        assert!(f.control.subscriptions().subscriber("a").is_none());
    }

    #[tokio::test]
    async fn one_live_channel_per_name() {
        let f = fixture().await;
        let lease = f.control.open_channel("ws").await.unwrap();
        assert_eq!(f.control.open_channel("ws").await.unwrap_err(), ControlError::NameInUse);

        f.control.close_channel("ws", lease.id);
        assert!(f.control.open_channel("ws").await.is_ok());
        assert_eq!(
            f.control.subscriptions().subscriber("ws"),
            Some(Subscriber::persistent("ws"))
        );
    }
}
