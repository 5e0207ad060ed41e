//! Herald Core - change detection and fan-out delivery
//!
//! This crate watches upstream content sources (Weibo, Bilibili dynamics
//! and Bilibili live rooms), decides what is new or changed per watched
//! entity, and delivers each resulting event to exactly the subscribers
//! that asked for it.
//!
//! Pollers push events into a single queue; one dispatcher drains it and
//! fans out over persistent channels or fire-and-forget HTTP. Cursors and
//! snapshots survive restarts through whole-document JSON snapshots.

pub mod config;
pub mod control;
pub mod data_source;
pub mod error;
pub mod event;
pub mod id;
pub mod queue;
pub mod runtime;
pub mod subscription;
pub mod transport;
pub mod utils;
pub mod watch;

#[cfg(test)]
pub mod test_helpers;

pub use config::HeraldConfig;
pub use control::{ControlPlane, ControlResponse, SourceHandle, SubscribeRequest};
pub use data_source::{CadenceClass, FetchOutcome, SourceAdapter, SourcePoller};
pub use error::{ConfigError, ControlError, CoreError, DeliveryError, FetchError, Result};
pub use event::{Event, EventKind, EventPayload};
pub use id::{COMMENT_SUBTYPE, SourceType};
pub use queue::{Dispatcher, event_queue};
pub use runtime::{HeraldRuntime, RuntimeBuilder, RuntimeHandles};
pub use subscription::{Subscriber, SubscriptionKey, SubscriptionRegistry, TransportKind};
pub use transport::{PersistentChannels, Transport, TransportHub};
pub use watch::{MonitoredEntity, WatchRegistry};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        CadenceClass, ControlError, CoreError, Event, EventPayload, HeraldConfig, Result,
        SourceAdapter, SourceType, SubscriptionKey,
    };
}
