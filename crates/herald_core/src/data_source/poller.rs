use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CadenceClass, Candidate, CommentItem, FeedBatch, FetchOutcome, Observation, SourceAdapter};
use crate::error::FetchError;
use crate::event::Event;
use crate::id::SourceType;
use crate::queue::EventSender;
use crate::utils::unix_now;
use crate::watch::{CursorSlot, CursorTracker, MonitoredEntity, SnapshotDiffer, WatchRegistry};

/// Where a poller is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Fetching,
    Processing,
    Sleeping,
    ErrorBackoff,
}

/// Scheduling parameters for one poller
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Sleep between successful cycles
    pub interval: Duration,
    /// Upper bound of the uniform random delay added to every sleep
    pub jitter: Duration,
    /// A fetch that takes longer than this counts as failed
    pub fetch_timeout: Duration,
    /// After a failed cycle, sleep `interval * error_backoff_ratio` instead
    pub error_backoff_ratio: f64,
    /// Pause between consecutive sub-batches of one detail or comment cycle
    pub sub_batch_pause: Duration,
    /// Detail refresh only covers entities older than this
    pub detail_max_age: Duration,
    /// Diff profile fields that arrive embedded in feed items
    pub diff_feed_attributes: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            jitter: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(20),
            error_backoff_ratio: 0.5,
            sub_batch_pause: Duration::from_secs(5),
            detail_max_age: Duration::from_secs(600),
            diff_feed_attributes: false,
        }
    }
}

impl PollerConfig {
    pub fn sleep_duration(&self) -> Duration {
        self.interval + self.jitter.mul_f64(rand::random::<f64>())
    }

    pub fn backoff_duration(&self) -> Duration {
        self.interval.mul_f64(self.error_backoff_ratio.max(0.0))
    }
}

/// What one cycle produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub events: usize,
    pub skipped: usize,
}

/// Periodically fetches one cadence class of one source, turns new items
/// and attribute changes into events, and advances cursors.
///
/// Cursors for a cycle are read before the fetch starts. Events are pushed
/// to the queue before any cursor moves, so a crash in between can only
/// replay events, never lose them.
#[derive(Debug)]
pub struct SourcePoller {
    class: CadenceClass,
    adapter: Arc<dyn SourceAdapter>,
    registry: Arc<WatchRegistry>,
    queue: EventSender,
    config: PollerConfig,
    state: PollerState,
}

impl SourcePoller {
    pub fn new(
        class: CadenceClass,
        adapter: Arc<dyn SourceAdapter>,
        registry: Arc<WatchRegistry>,
        queue: EventSender,
        config: PollerConfig,
    ) -> Self {
        Self {
            class,
            adapter,
            registry,
            queue,
            config,
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn class(&self) -> CadenceClass {
        self.class
    }

    pub fn source_type(&self) -> SourceType {
        self.adapter.source_type()
    }

    /// Start polling in the background, returning a join handle
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        let source = self.adapter.source_type();
        info!("{} {} poller started", source, self.class.as_str());

        loop {
            let delay = match self.poll_once().await {
                Ok(report) => {
                    self.state = PollerState::Sleeping;
                    if report.events > 0 || report.skipped > 0 {
                        debug!(
                            "{} {} cycle: {} events, {} skipped",
                            source,
                            self.class.as_str(),
                            report.events,
                            report.skipped
                        );
                    }
                    self.config.sleep_duration()
                }
                Err(e) => {
                    self.state = PollerState::ErrorBackoff;
                    let delay = self.config.backoff_duration();
                    if e.is_auth_expired() {
                        error!(
                            "{} {} poller: {}; update the configured cookie. Retrying in {:?}",
                            source,
                            self.class.as_str(),
                            e,
                            delay
                        );
                    } else {
                        warn!(
                            "{} {} poller: {}, retrying in {:?}",
                            source,
                            self.class.as_str(),
                            e,
                            delay
                        );
                    }
                    delay
                }
            };

            if self.queue.is_closed() {
                info!("{} {} poller stopping, event queue closed", source, self.class.as_str());
                break;
            }

            tokio::time::sleep(delay).await;
            self.state = PollerState::Idle;
        }
    }

    /// Runs one full cycle of this poller's cadence class.
    pub async fn poll_once(&mut self) -> Result<PollReport, FetchError> {
        let report = match self.class {
            CadenceClass::Feed => self.poll_feed().await,
            CadenceClass::Detail => self.poll_details().await,
            CadenceClass::Comment => self.poll_comments().await,
        };
        self.state = PollerState::Idle;
        report
    }

    async fn fetch<T>(&mut self, request: impl Future<Output = FetchOutcome<T>>) -> Result<Option<T>, FetchError> {
        self.state = PollerState::Fetching;
        match tokio::time::timeout(self.config.fetch_timeout, request).await {
            Err(_) => Err(FetchError::timed_out(
                self.adapter.source_type(),
                self.config.fetch_timeout,
            )),
            Ok(FetchOutcome::Items(items)) => Ok(Some(items)),
            Ok(FetchOutcome::Empty) => Ok(None),
            Ok(FetchOutcome::Fail(e)) => Err(e),
        }
    }

    async fn poll_feed(&mut self) -> Result<PollReport, FetchError> {
        let watched = self.registry.entity_ids();
        if watched.is_empty() {
            return Ok(PollReport::default());
        }

        let cursors = self.registry.cursors(CursorSlot::Primary);
        let adapter = Arc::clone(&self.adapter);
        let Some(batch) = self.fetch(adapter.fetch_feed(&watched)).await? else {
            return Ok(PollReport::default());
        };

        self.state = PollerState::Processing;
        let now = unix_now();
        let FeedBatch { mut items, observations } = batch;
        let mut report = PollReport::default();

        let mut changes = Vec::new();
        for observation in observations {
            match observation {
                Ok(observation) => changes.extend(self.observe(&observation, now)),
                Err(e) => {
                    warn!("{}", e);
                    report.skipped += 1;
                }
            }
        }

        // Upstream lists newest first.
        items.reverse();
        let mut new_items = Vec::new();
        let mut maxima: BTreeMap<String, i64> = BTreeMap::new();
        for candidate in items {
            let mut item = match candidate {
                Ok(item) => item,
                Err(e) => {
                    warn!("{}", e);
                    report.skipped += 1;
                    continue;
                }
            };
            let Some(&cursor) = cursors.get(&item.user.uid) else {
                continue;
            };

            if self.config.diff_feed_attributes && !item.attributes.is_empty() {
                let created_time = item.created_time;
                changes.extend(self.registry.update(&item.user.uid, |entity| {
                    entity.last_detail_refresh = now;
                    SnapshotDiffer::diff(entity, &item.attributes, created_time)
                }).unwrap_or_default());
            }

            if !CursorTracker::is_new(cursor, item.created_time) {
                continue;
            }
            let max = maxima.entry(item.user.uid.clone()).or_insert(item.created_time);
            *max = (*max).max(item.created_time);

            if item.truncated {
                match tokio::time::timeout(self.config.fetch_timeout, adapter.expand(&mut item)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("keeping shortened text of {}: {}", item.post.id, e),
                    Err(_) => warn!("keeping shortened text of {}: expansion timed out", item.post.id),
                }
            }
            new_items.push(Event::new_post(
                self.adapter.source_type(),
                item.user,
                item.post,
                item.created_time,
            ));
        }
        // Changes first so that a change and a post at the same instant keep
        // that order after the stable sort.
        changes.append(&mut new_items);
        changes.sort_by_key(|event| event.created_time);

        if !self.emit(changes, &mut report) {
            warn!("{} feed: cursors left in place, batch will be fetched again", self.adapter.source_type());
            return Ok(report);
        }

        let tracker = CursorTracker::new(Arc::clone(&self.registry), CursorSlot::Primary);
        if let Err(e) = tracker.advance_batch(&maxima).await {
            error!(
                "{} feed: failed to persist cursors, events may be replayed after restart: {:?}",
                self.adapter.source_type(),
                e
            );
        }
        Ok(report)
    }

    async fn poll_details(&mut self) -> Result<PollReport, FetchError> {
        let due = self
            .registry
            .detail_due(unix_now(), self.config.detail_max_age);
        if due.is_empty() {
            return Ok(PollReport::default());
        }

        let adapter = Arc::clone(&self.adapter);
        let batch_size = adapter.detail_batch_size().max(1);
        let mut report = PollReport::default();
        let mut last_error = None;
        let mut answered = false;

        for (index, chunk) in due.chunks(batch_size).enumerate() {
            if index > 0 {
                self.pause_between_sub_batches().await;
            }

            let observations = match self.fetch(adapter.fetch_details(chunk)).await {
                Ok(Some(observations)) => {
                    answered = true;
                    observations
                }
                Ok(None) => {
                    answered = true;
                    continue;
                }
                Err(e) => {
                    warn!("{} detail refresh of {:?} failed: {}", adapter.source_type(), chunk, e);
                    last_error = Some(e);
                    continue;
                }
            };

            self.state = PollerState::Processing;
            let now = unix_now();
            let mut changes = Vec::new();
            for observation in observations {
                match observation {
                    Ok(observation) => {
                        if !chunk.contains(&observation.entity_id) {
                            debug!("{} detail for unrequested uid {}", adapter.source_type(), observation.entity_id);
                        }
                        changes.extend(self.observe(&observation, now));
                        self.registry.update(&observation.entity_id, |entity| {
                            entity.last_detail_refresh = now;
                        });
                    }
                    Err(e) => {
                        warn!("{}", e);
                        report.skipped += 1;
                    }
                }
            }
            if !self.emit(changes, &mut report) {
                break;
            }

            if let Err(e) = self.registry.flush().await {
                error!("{} detail: failed to persist snapshots: {:?}", adapter.source_type(), e);
            }
        }

        // Back off only when no sub-batch got through.
        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(report),
        }
    }

    async fn poll_comments(&mut self) -> Result<PollReport, FetchError> {
        let targets = self.registry.comment_targets();
        if targets.is_empty() {
            return Ok(PollReport::default());
        }

        let adapter = Arc::clone(&self.adapter);
        let tracker = CursorTracker::new(Arc::clone(&self.registry), CursorSlot::Comment);
        let mut report = PollReport::default();
        let mut last_error = None;
        let mut answered = false;

        for (index, entity) in targets.iter().enumerate() {
            if index > 0 {
                self.pause_between_sub_batches().await;
            }
            let Some(watch) = entity.comment.as_ref() else {
                continue;
            };

            let comments = match self
                .fetch(adapter.fetch_comments(&entity.entity_id, watch))
                .await
            {
                Ok(Some(comments)) => {
                    answered = true;
                    comments
                }
                Ok(None) => {
                    answered = true;
                    continue;
                }
                Err(e) => {
                    warn!("{} comment scan of {} failed: {}", adapter.source_type(), entity.entity_id, e);
                    last_error = Some(e);
                    continue;
                }
            };

            self.state = PollerState::Processing;
            let (events, skipped, max) = self.new_comments(entity, watch.cursor, comments);
            report.skipped += skipped;
            if !self.emit(events, &mut report) {
                warn!("{} comment cursor of {} left in place", adapter.source_type(), entity.entity_id);
                break;
            }

            if let Some(max) = max {
                if let Err(e) = tracker.advance(&entity.entity_id, max).await {
                    error!(
                        "{} comment cursor of {} not persisted: {:?}",
                        adapter.source_type(),
                        entity.entity_id,
                        e
                    );
                }
            }
        }

        // Back off only when no sub-batch got through.
        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(report),
        }
    }

    fn new_comments(
        &self,
        entity: &MonitoredEntity,
        cursor: i64,
        comments: Vec<Candidate<CommentItem>>,
    ) -> (Vec<Event>, usize, Option<i64>) {
        let mut skipped = 0;
        let mut fresh: Vec<CommentItem> = comments
            .into_iter()
            .filter_map(|candidate| match candidate {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!("{}", e);
                    skipped += 1;
                    None
                }
            })
            .filter(|item| CursorTracker::is_new(cursor, item.created_time))
            .collect();
        fresh.sort_by_key(|item| item.created_time);

        let max = fresh.iter().map(|item| item.created_time).max();
        let user = entity.entity_ref();
        let events = fresh
            .into_iter()
            .map(|item| {
                Event::new_comment(
                    self.adapter.source_type(),
                    user.clone(),
                    item.comment,
                    item.created_time,
                )
            })
            .collect();
        (events, skipped, max)
    }

    fn observe(&self, observation: &Observation, now: i64) -> Vec<Event> {
        self.registry
            .update(&observation.entity_id, |entity| {
                SnapshotDiffer::diff_with_context(entity, &observation.attributes, &observation.context, now)
            })
            .unwrap_or_default()
    }

    /// Pushes events in order. Returns false if the queue refused one, in
    /// which case the caller must not move any cursor.
    fn emit(&self, events: Vec<Event>, report: &mut PollReport) -> bool {
        for event in events {
            if let Err(e) = self.queue.push(event) {
                error!("{} poller could not enqueue event: {:?}", self.adapter.source_type(), e);
                return false;
            }
            report.events += 1;
        }
        true
    }

    async fn pause_between_sub_batches(&mut self) {
        self.state = PollerState::Sleeping;
        tokio::time::sleep(self.config.sub_batch_pause).await;
    }
}
