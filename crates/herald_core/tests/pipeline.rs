//! End-to-end behaviour of the detection and delivery pipeline.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use herald_core::data_source::{FeedBatch, FeedItem, PollerConfig};
use herald_core::error::DeliveryError;
use herald_core::event::{EntityRef, Post};
use herald_core::subscription::Subscriber;
use herald_core::utils::unix_now;
use herald_core::watch::{Attributes, CursorSlot, JsonFileStore, MemoryStore, SnapshotDiffer};
use herald_core::{
    CadenceClass, ControlPlane, Dispatcher, Event, EventKind, EventPayload, FetchOutcome,
    HeraldConfig, HeraldRuntime, MonitoredEntity, SourceAdapter, SourceHandle, SourcePoller,
    SourceType, SubscribeRequest, SubscriptionKey, SubscriptionRegistry, Transport, WatchRegistry,
    event_queue,
};

#[derive(Debug)]
struct ScriptedFeed {
    source_type: SourceType,
    feed: Mutex<VecDeque<FeedBatch>>,
}

impl ScriptedFeed {
    fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            feed: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, batch: FeedBatch) {
        self.feed.lock().push_back(batch);
    }
}

#[async_trait]
impl SourceAdapter for ScriptedFeed {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn fetch_feed(&self, _entity_ids: &[String]) -> FetchOutcome<FeedBatch> {
        FetchOutcome::from_option(self.feed.lock().pop_front())
    }
}

#[derive(Debug, Default)]
struct Inbox {
    received: Mutex<BTreeMap<String, Vec<Event>>>,
}

impl Inbox {
    fn of(&self, name: &str) -> Vec<Event> {
        self.received.lock().get(name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Transport for Inbox {
    async fn deliver(&self, subscriber: &Subscriber, payload: &str) -> Result<(), DeliveryError> {
        let event: Event = serde_json::from_str(payload).expect("payload is an event");
        self.received
            .lock()
            .entry(subscriber.name.clone())
            .or_default()
            .push(event);
        Ok(())
    }
}

/// Upstream order: newest first, like every feed we poll.
fn batch(uid: &str, times: &[i64]) -> FeedBatch {
    FeedBatch {
        items: times
            .iter()
            .map(|&t| {
                Ok(FeedItem {
                    user: EntityRef::new(uid, None),
                    created_time: t,
                    post: Post {
                        id: format!("{}-{}", uid, t),
                        ..Post::default()
                    },
                    attributes: Attributes::new(),
                    truncated: false,
                })
            })
            .collect(),
        observations: Vec::new(),
    }
}

fn times_of(events: &[Event]) -> Vec<i64> {
    events.iter().map(|event| event.created_time).collect()
}

fn quick() -> PollerConfig {
    PollerConfig {
        sub_batch_pause: Duration::ZERO,
        ..PollerConfig::default()
    }
}

#[tokio::test]
async fn new_items_come_out_oldest_first_and_raise_the_cursor() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(WatchRegistry::load(SourceType::Weibo, store).await.unwrap());
    registry
        .insert(MonitoredEntity::new(SourceType::Weibo, "1", 1000))
        .await
        .unwrap();
    let adapter = Arc::new(ScriptedFeed::new(SourceType::Weibo));
    adapter.push(batch("1", &[900, 1100, 1050]));

    let (tx, mut rx) = event_queue();
    let mut poller = SourcePoller::new(CadenceClass::Feed, adapter, registry.clone(), tx, quick());
    poller.poll_once().await.unwrap();

    let events: Vec<Event> = std::iter::from_fn(|| rx.try_pop()).collect();
    assert_eq!(times_of(&events), vec![1050, 1100]);
    assert_eq!(registry.get("1").unwrap().cursor, 1100);
}

#[tokio::test]
async fn restart_does_not_replay_delivered_items() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path()));

    {
        let registry = Arc::new(WatchRegistry::load(SourceType::BiliDyn, store.clone()).await.unwrap());
        registry
            .insert(MonitoredEntity::new(SourceType::BiliDyn, "7", 100))
            .await
            .unwrap();
        let adapter = Arc::new(ScriptedFeed::new(SourceType::BiliDyn));
        adapter.push(batch("7", &[300, 200]));
        let (tx, _rx) = event_queue();
        let mut poller = SourcePoller::new(CadenceClass::Feed, adapter, registry, tx, quick());
        assert_eq!(poller.poll_once().await.unwrap().events, 2);
    }

    let registry = Arc::new(WatchRegistry::load(SourceType::BiliDyn, store).await.unwrap());
    assert_eq!(registry.get("7").unwrap().cursor(CursorSlot::Primary), Some(300));

    let adapter = Arc::new(ScriptedFeed::new(SourceType::BiliDyn));
    adapter.push(batch("7", &[400, 300, 200]));
    let (tx, mut rx) = event_queue();
    let mut poller = SourcePoller::new(CadenceClass::Feed, adapter, registry, tx, quick());
    poller.poll_once().await.unwrap();

    let events: Vec<Event> = std::iter::from_fn(|| rx.try_pop()).collect();
    assert_eq!(times_of(&events), vec![400]);
}

#[test]
fn single_changed_attribute_yields_single_event() {
    let mut entity = MonitoredEntity::new(SourceType::BiliDyn, "1", 0);
    entity.snapshot = Attributes::from([
        ("name".to_string(), "a".to_string()),
        ("avatar".to_string(), "x".to_string()),
    ]);
    let observed = Attributes::from([
        ("name".to_string(), "a".to_string()),
        ("avatar".to_string(), "y".to_string()),
    ]);

    let events = SnapshotDiffer::diff(&mut entity, &observed, 42);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::AttributeChanged);
    match &events[0].payload {
        EventPayload::Change(delta) => {
            assert_eq!(delta.attribute, "avatar");
            assert_eq!(delta.previous, "x");
            assert_eq!(delta.now, "y");
        }
        other => panic!("expected a change, got {:?}", other),
    }
    assert_eq!(entity.snapshot, observed);

    // Same observation again: nothing changes.
    assert!(SnapshotDiffer::diff(&mut entity, &observed, 43).is_empty());
    assert_eq!(entity.snapshot, observed);
}

async fn control_for(source_type: SourceType) -> (ControlPlane, Arc<WatchRegistry>) {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(WatchRegistry::load(source_type, store.clone()).await.unwrap());
    let handle = SourceHandle {
        adapter: Arc::new(ScriptedFeed::new(source_type)),
        registry: registry.clone(),
        subtypes: BTreeSet::from(["comment".to_string()]),
    };
    let subscriptions = Arc::new(SubscriptionRegistry::load(store).await.unwrap());
    let control = ControlPlane::new(
        BTreeMap::from([(source_type, handle)]),
        subscriptions,
        Arc::default(),
    );
    (control, registry)
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

#[tokio::test]
async fn sole_comment_subscriber_leaving_keeps_the_base_watch() {
    let (control, registry) = control_for(SourceType::BiliDyn).await;
    control.register_subscriber("S1", "websocket").await.unwrap();
    control.subscribe(&request("bili_dyn", None, "1", "S1")).await.unwrap();
    control
        .subscribe(&request("bili_dyn", Some("comment"), "1", "S1"))
        .await
        .unwrap();
    assert!(registry.get("1").unwrap().comment.is_some());

    control
        .unsubscribe(&request("bili_dyn", Some("comment"), "1", "S1"))
        .await
        .unwrap();

    let subscriptions = control.subscriptions();
    assert!(!subscriptions.contains(&SubscriptionKey::new(
        SourceType::BiliDyn,
        Some("comment".to_string()),
        "1"
    )));
    assert!(subscriptions.contains(&SubscriptionKey::base(SourceType::BiliDyn, "1")));
    let entity = registry.get("1").unwrap();
    assert!(entity.comment.is_none());

    // A second removal is reported, not repeated.
    let err = control
        .unsubscribe(&request("bili_dyn", Some("comment"), "1", "S1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 7);
}

#[tokio::test]
async fn subtype_event_without_subtype_entry_reaches_base_subscribers() {
    let store = Arc::new(MemoryStore::new());
    let subscriptions = Arc::new(SubscriptionRegistry::load(store).await.unwrap());
    subscriptions.register_subscriber(Subscriber::persistent("base-sub"));
    subscriptions.add(SubscriptionKey::base(SourceType::Weibo, "1"), "base-sub");

    let inbox = Arc::new(Inbox::default());
    let (_tx, rx) = event_queue();
    let dispatcher = Dispatcher::new(rx, subscriptions, inbox.clone());

    let event = Event::new_comment(
        SourceType::Weibo,
        EntityRef::new("1", None),
        herald_core::event::Comment {
            id: "c1".to_string(),
            post_id: "p1".to_string(),
            author: EntityRef::new("2", None),
            text: "hello".to_string(),
        },
        10,
    );
    let report = dispatcher.dispatch(&event).await;

    assert_eq!(report.delivered, vec!["base-sub".to_string()]);
    assert_eq!(inbox.of("base-sub"), vec![event]);
}

#[tokio::test]
async fn runtime_delivers_new_posts_over_persistent_channels() {
    let mut config = HeraldConfig::default();
    config.bili_dyn.enable = true;
    config.bili_dyn.jitter = 0;

    let adapter = Arc::new(ScriptedFeed::new(SourceType::BiliDyn));
    let runtime = HeraldRuntime::builder()
        .config(config)
        .store(Arc::new(MemoryStore::new()))
        .adapter(adapter.clone())
        .build()
        .await
        .unwrap();
    let control = Arc::clone(runtime.control());

    let mut lease = control.open_channel("listener").await.unwrap();
    control
        .subscribe(&request("bili_dyn", None, "5", "listener"))
        .await
        .unwrap();

    let fresh = unix_now() + 60;
    adapter.push(batch("5", &[fresh + 1, fresh, 0]));
    let handles = runtime.start();

    let mut received = Vec::new();
    while received.len() < 2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), lease.frames.recv())
            .await
            .expect("frame within timeout")
            .expect("channel open");
        let event: Event = serde_json::from_str(&frame).unwrap();
        received.push(event.created_time);
    }
    handles.abort();

    assert_eq!(received, vec![fresh, fresh + 1]);
}
