//! Delivery of serialized events to subscribers.

mod channels;

pub use channels::{ChannelLease, PersistentChannels};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::DeliveryError;
use crate::subscription::{Subscriber, TransportKind};

/// Pushes one serialized event to one subscriber.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn deliver(&self, subscriber: &Subscriber, payload: &str) -> Result<(), DeliveryError>;
}

/// Routes each delivery by the subscriber's transport kind: open persistent
/// channels, or a single HTTP POST for fire-and-forget subscribers.
///
/// A persistent subscriber without an open channel is a failed delivery;
/// there is no fallback to HTTP.
#[derive(Debug, Clone)]
pub struct TransportHub {
    channels: Arc<PersistentChannels>,
    client: reqwest::Client,
}

impl TransportHub {
    pub fn new(channels: Arc<PersistentChannels>, client: reqwest::Client) -> Self {
        Self { channels, client }
    }

    pub fn channels(&self) -> &Arc<PersistentChannels> {
        &self.channels
    }

    async fn post(&self, subscriber: &Subscriber, address: &str, payload: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(address)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|cause| DeliveryError::Http {
                subscriber: subscriber.name.clone(),
                address: address.to_string(),
                cause,
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::HttpStatus {
                subscriber: subscriber.name.clone(),
                address: address.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl Transport for TransportHub {
    async fn deliver(&self, subscriber: &Subscriber, payload: &str) -> Result<(), DeliveryError> {
        match &subscriber.transport {
            TransportKind::Persistent => self.channels.send(&subscriber.name, payload),
            TransportKind::FireAndForget { address } => self.post(subscriber, address, payload).await,
        }
    }
}
