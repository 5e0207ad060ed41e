#![cfg(test)]

pub mod source {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, VecDeque};

    use crate::data_source::{
        CadenceClass, Candidate, CommentItem, FeedBatch, FeedItem, FetchOutcome, Observation,
        SourceAdapter,
    };
    use crate::error::FetchError;
    use crate::event::{EntityRef, Post};
    use crate::id::SourceType;
    use crate::watch::CommentWatch;

    /// Adapter that replays scripted fetch outcomes in order.
    ///
    /// Once a script runs dry the adapter answers `Empty`.
    #[derive(Debug)]
    pub struct MockAdapter {
        source_type: SourceType,
        classes: BTreeSet<&'static str>,
        feed: Mutex<VecDeque<FetchOutcome<FeedBatch>>>,
        details: Mutex<VecDeque<FetchOutcome<Vec<Candidate<Observation>>>>>,
        comments: Mutex<VecDeque<FetchOutcome<Vec<Candidate<CommentItem>>>>>,
        long_text: Mutex<Option<String>>,
        refuse_watch: Mutex<bool>,
        /// Every `(entity_id, subtype)` handed to `establish_watch`
        pub watches: Mutex<Vec<(String, Option<String>)>>,
        /// Entity ids of every detail request, one entry per sub-batch
        pub detail_requests: Mutex<Vec<Vec<String>>>,
    }

    impl MockAdapter {
        pub fn new(source_type: SourceType) -> Self {
            Self {
                source_type,
                classes: BTreeSet::from(["feed"]),
                feed: Mutex::new(VecDeque::new()),
                details: Mutex::new(VecDeque::new()),
                comments: Mutex::new(VecDeque::new()),
                long_text: Mutex::new(None),
                refuse_watch: Mutex::new(false),
                watches: Mutex::new(Vec::new()),
                detail_requests: Mutex::new(Vec::new()),
            }
        }

        pub fn supporting(mut self, class: CadenceClass) -> Self {
            self.classes.insert(class.as_str());
            self
        }

        pub fn push_feed(&self, outcome: FetchOutcome<FeedBatch>) {
            self.feed.lock().push_back(outcome);
        }

        pub fn push_details(&self, outcome: FetchOutcome<Vec<Candidate<Observation>>>) {
            self.details.lock().push_back(outcome);
        }

        pub fn push_comments(&self, outcome: FetchOutcome<Vec<Candidate<CommentItem>>>) {
            self.comments.lock().push_back(outcome);
        }

        /// Text that `expand` puts on truncated items.
        pub fn expand_to(&self, text: &str) {
            *self.long_text.lock() = Some(text.to_string());
        }

        pub fn refuse_watches(&self) {
            *self.refuse_watch.lock() = true;
        }
    }

    #[async_trait]
    impl SourceAdapter for MockAdapter {
        fn source_type(&self) -> SourceType {
            self.source_type
        }

        fn supports(&self, class: CadenceClass) -> bool {
            self.classes.contains(class.as_str())
        }

        fn detail_batch_size(&self) -> usize {
            2
        }

        async fn fetch_feed(&self, _entity_ids: &[String]) -> FetchOutcome<FeedBatch> {
            self.feed.lock().pop_front().unwrap_or(FetchOutcome::Empty)
        }

        async fn expand(&self, item: &mut FeedItem) -> Result<(), FetchError> {
            match self.long_text.lock().clone() {
                Some(text) => {
                    item.post.text = text;
                    item.truncated = false;
                    Ok(())
                }
                None => Err(FetchError::unavailable(self.source_type, "no long text")),
            }
        }

        async fn fetch_details(&self, entity_ids: &[String]) -> FetchOutcome<Vec<Candidate<Observation>>> {
            self.detail_requests.lock().push(entity_ids.to_vec());
            self.details.lock().pop_front().unwrap_or(FetchOutcome::Empty)
        }

        async fn fetch_comments(
            &self,
            _entity_id: &str,
            _watch: &CommentWatch,
        ) -> FetchOutcome<Vec<Candidate<CommentItem>>> {
            self.comments.lock().pop_front().unwrap_or(FetchOutcome::Empty)
        }

        async fn establish_watch(&self, entity_id: &str, subtype: Option<&str>) -> Result<(), FetchError> {
            self.watches
                .lock()
                .push((entity_id.to_string(), subtype.map(str::to_string)));
            if *self.refuse_watch.lock() {
                return Err(FetchError::rejected(self.source_type, "follow refused"));
            }
            Ok(())
        }
    }

    pub fn feed_item(uid: &str, post_id: &str, created_time: i64) -> FeedItem {
        FeedItem {
            user: EntityRef::new(uid, None),
            created_time,
            post: Post {
                id: post_id.to_string(),
                text: format!("post {}", post_id),
                ..Post::default()
            },
            attributes: Default::default(),
            truncated: false,
        }
    }

    /// A feed batch from items given oldest first; upstream order is newest
    /// first, so they are reversed.
    pub fn feed_batch(items: Vec<FeedItem>) -> FeedBatch {
        FeedBatch {
            items: items.into_iter().rev().map(Ok).collect(),
            observations: Vec::new(),
        }
    }
}

pub mod transport {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet};

    use crate::error::DeliveryError;
    use crate::event::Event;
    use crate::subscription::Subscriber;
    use crate::transport::Transport;

    /// Transport that records every payload per subscriber name.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        delivered: Mutex<BTreeMap<String, Vec<String>>>,
        failing: Mutex<BTreeSet<String>>,
    }

    impl RecordingTransport {
        pub fn fail_for(&self, name: &str) {
            self.failing.lock().insert(name.to_string());
        }

        pub fn delivered_to(&self, name: &str) -> Vec<Event> {
            self.delivered
                .lock()
                .get(name)
                .map(|payloads| {
                    payloads
                        .iter()
                        .map(|payload| serde_json::from_str(payload).expect("recorded payload is an event"))
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver(&self, subscriber: &Subscriber, payload: &str) -> Result<(), DeliveryError> {
            if self.failing.lock().contains(&subscriber.name) {
                return Err(DeliveryError::ChannelClosed {
                    subscriber: subscriber.name.clone(),
                });
            }
            self.delivered
                .lock()
                .entry(subscriber.name.clone())
                .or_default()
                .push(payload.to_string());
            Ok(())
        }
    }
}

pub use source::{MockAdapter, feed_batch, feed_item};
pub use transport::RecordingTransport;
