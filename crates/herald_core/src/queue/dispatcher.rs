//! Drains the event queue and fans each event out to its subscribers.

use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::EventReceiver;
use crate::error::DeliveryError;
use crate::event::Event;
use crate::subscription::SubscriptionRegistry;
use crate::transport::Transport;

/// Per-event delivery outcome.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, DeliveryError)>,
}

/// Single consumer of the event queue.
///
/// Events are handled strictly in queue order. Deliveries of one event to
/// its subscribers run concurrently and fail independently; a failure is
/// logged and never retried.
pub struct Dispatcher {
    queue: EventReceiver,
    subscriptions: Arc<SubscriptionRegistry>,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(
        queue: EventReceiver,
        subscriptions: Arc<SubscriptionRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            queue,
            subscriptions,
            transport,
        }
    }

    /// Start dispatching in the background, returning a join handle
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        info!("dispatcher started");
        while let Some(event) = self.queue.pop().await {
            self.dispatch(&event).await;
        }
        info!("event queue closed, dispatcher stopping");
    }

    /// Delivers one event to everyone subscribed to its address.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let mut report = DispatchReport::default();
        let names = self.subscriptions.subscribers_for(
            event.source_type,
            event.subtype.as_deref(),
            event.entity_id(),
        );
        if names.is_empty() {
            debug!(
                "no subscribers for {} {:?} {}, dropping event",
                event.source_type,
                event.subtype,
                event.entity_id()
            );
            return report;
        }

        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to serialize event for {}: {:?}", event.entity_id(), e);
                return report;
            }
        };

        let deliveries = names.into_iter().map(|name| {
            let payload = payload.as_str();
            async move {
                let result = match self.subscriptions.subscriber(&name) {
                    Some(subscriber) => self.transport.deliver(&subscriber, payload).await,
                    None => Err(DeliveryError::UnknownSubscriber(name.clone())),
                };
                (name, result)
            }
        });

        for (name, result) in join_all(deliveries).await {
            match result {
                Ok(()) => {
                    debug!("delivered {} event for {} to {}", event.source_type, event.entity_id(), name);
                    report.delivered.push(name);
                }
                Err(e) => {
                    warn!(
                        "delivery of {} event for {} to {} failed: {}",
                        event.source_type,
                        event.entity_id(),
                        name,
                        e
                    );
                    report.failed.push((name, e));
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.queue.len())
            .field("transport", &self.transport)
            .finish()
    }
}
