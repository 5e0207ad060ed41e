//! # Data Sources - Upstream Platforms
//!
//! Each upstream platform is wrapped in a [`SourceAdapter`] that knows how to
//! fetch its feed, profile details and comments, and how to ask the platform
//! to start delivering an entity's content to our account. Adapters only
//! translate wire formats; all scheduling, novelty checks and diffing live in
//! [`SourcePoller`].
//!
//! ## Cadence classes
//!
//! A source runs one poller per cadence class it supports:
//!
//! - **Feed**: the main timeline. Yields new posts and, when the feed embeds
//!   profile fields, attribute observations.
//! - **Detail**: slow profile refresh in sub-batches, only for entities whose
//!   details are older than the refresh age.
//! - **Comment**: new comments on each comment-watched entity's latest post.
//!
//! ## Failure handling
//!
//! Adapters return a [`FetchOutcome`]. A failed fetch never moves a cursor;
//! the poller backs off and tries again. A single unparsable item inside an
//! otherwise good response is returned as a [`Candidate`] error and skipped.

pub mod bili_dynamic;
pub mod bili_live;
mod http;
mod poller;
pub mod weibo;


pub use bili_dynamic::BiliDynAdapter;
pub use bili_live::BiliLiveAdapter;
pub use http::herald_reqwest_client;
pub use poller::{PollReport, PollerConfig, PollerState, SourcePoller};
pub use weibo::WeiboAdapter;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::error::{FetchError, MalformedItem};
use crate::event::{Comment, EntityRef, Post};
use crate::id::SourceType;
use crate::watch::{Attributes, CommentWatch};

/// Scheduling class of a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CadenceClass {
    Feed,
    Detail,
    Comment,
}

impl CadenceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CadenceClass::Feed => "feed",
            CadenceClass::Detail => "detail",
            CadenceClass::Comment => "comment",
        }
    }
}

/// One parsed item, or the reason it could not be parsed.
pub type Candidate<T> = Result<T, MalformedItem>;

/// A post from a watched entity's feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub user: EntityRef,
    pub created_time: i64,
    pub post: Post,
    /// Profile fields embedded in the feed entry, if the platform sends any
    pub attributes: Attributes,
    /// The feed only carried a shortened text; see [`SourceAdapter::expand`]
    pub truncated: bool,
}

/// Current values of an entity's tracked attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub entity_id: String,
    pub attributes: Attributes,
    /// Carried on every change event derived from this observation
    pub context: BTreeMap<String, String>,
}

/// A comment left on a watched entity's post.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentItem {
    pub entity_id: String,
    pub created_time: i64,
    pub comment: Comment,
}

/// Result of one feed fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBatch {
    /// In upstream order, newest first
    pub items: Vec<Candidate<FeedItem>>,
    pub observations: Vec<Candidate<Observation>>,
}

impl FeedBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.observations.is_empty()
    }
}

/// Outcome of a single upstream fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Items(T),
    /// The upstream answered successfully with nothing to report
    Empty,
    Fail(FetchError),
}

impl<T> FetchOutcome<T> {
    pub fn from_option(items: Option<T>) -> Self {
        items.map_or(FetchOutcome::Empty, FetchOutcome::Items)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        match self {
            FetchOutcome::Items(items) => FetchOutcome::Items(f(items)),
            FetchOutcome::Empty => FetchOutcome::Empty,
            FetchOutcome::Fail(e) => FetchOutcome::Fail(e),
        }
    }
}

impl<T> From<Result<Option<T>, FetchError>> for FetchOutcome<T> {
    fn from(result: Result<Option<T>, FetchError>) -> Self {
        match result {
            Ok(Some(items)) => FetchOutcome::Items(items),
            Ok(None) => FetchOutcome::Empty,
            Err(e) => FetchOutcome::Fail(e),
        }
    }
}

/// Translation layer for one upstream platform.
#[async_trait]
pub trait SourceAdapter: Send + Sync + Debug {
    fn source_type(&self) -> SourceType;

    /// Whether this platform has anything to poll for the cadence class.
    fn supports(&self, class: CadenceClass) -> bool {
        class == CadenceClass::Feed
    }

    /// How many entities one detail request may cover.
    fn detail_batch_size(&self) -> usize {
        1
    }

    /// Fetches the feed covering `entity_ids`.
    async fn fetch_feed(&self, entity_ids: &[String]) -> FetchOutcome<FeedBatch>;

    /// Completes a new feed item the feed only carried in shortened form.
    /// Only called for items that will become events.
    async fn expand(&self, _item: &mut FeedItem) -> Result<(), FetchError> {
        Ok(())
    }

    /// Fetches profile attributes for up to `detail_batch_size` entities.
    async fn fetch_details(&self, _entity_ids: &[String]) -> FetchOutcome<Vec<Candidate<Observation>>> {
        FetchOutcome::Empty
    }

    /// Fetches comments on the entity's latest post (and pinned post, if
    /// the watch asks for it).
    async fn fetch_comments(
        &self,
        _entity_id: &str,
        _watch: &CommentWatch,
    ) -> FetchOutcome<Vec<Candidate<CommentItem>>> {
        FetchOutcome::Empty
    }

    /// Asks the platform to deliver the entity's content to us, e.g. by
    /// following the account. Called before the first subscription to an
    /// entity or subtype is created.
    async fn establish_watch(&self, _entity_id: &str, _subtype: Option<&str>) -> Result<(), FetchError> {
        Ok(())
    }
}
