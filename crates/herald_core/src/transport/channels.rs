use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::DeliveryError;

/// Handle to one open persistent channel, given to the connection task
/// that owns it.
#[derive(Debug)]
pub struct ChannelLease {
    pub id: u64,
    pub frames: mpsc::UnboundedReceiver<String>,
}

#[derive(Debug)]
struct OpenChannel {
    id: u64,
    sender: mpsc::UnboundedSender<String>,
}

/// Named persistent channels. A name holds at most one open channel.
#[derive(Debug, Default)]
pub struct PersistentChannels {
    channels: DashMap<String, OpenChannel>,
    next_id: AtomicU64,
}

impl PersistentChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a channel for `name`. Returns `None` while another live
    /// channel holds the name.
    pub fn open(&self, name: &str) -> Option<ChannelLease> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, frames) = mpsc::unbounded_channel();
        match self.channels.entry(name.to_string()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().sender.is_closed() {
                    return None;
                }
                existing.insert(OpenChannel { id, sender });
            }
            Entry::Vacant(slot) => {
                slot.insert(OpenChannel { id, sender });
            }
        }
        debug!("persistent channel {} opened for {}", id, name);
        Some(ChannelLease { id, frames })
    }

    /// Closes `name`'s channel if it is still the one identified by `id`.
    pub fn close(&self, name: &str, id: u64) -> bool {
        let removed = self
            .channels
            .remove_if(name, |_, channel| channel.id == id)
            .is_some();
        if removed {
            debug!("persistent channel {} closed for {}", id, name);
        }
        removed
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.channels
            .get(name)
            .is_some_and(|channel| !channel.sender.is_closed())
    }

    pub fn send(&self, name: &str, frame: &str) -> Result<(), DeliveryError> {
        let closed = || DeliveryError::ChannelClosed {
            subscriber: name.to_string(),
        };
        let channel = self.channels.get(name).ok_or_else(closed)?;
        channel.sender.send(frame.to_string()).map_err(|_| closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_live_channel_per_name() {
        let channels = PersistentChannels::new();
        let mut lease = channels.open("bot").unwrap();
        assert!(channels.open("bot").is_none());

        channels.send("bot", "hello").unwrap();
        assert_eq!(lease.frames.recv().await.as_deref(), Some("hello"));

        drop(lease);
        let second = channels.open("bot").unwrap();
        assert!(channels.is_open("bot"));

        // A stale lease id does not close the newer channel.
        assert!(!channels.close("bot", second.id.wrapping_add(100)));
        assert!(channels.close("bot", second.id));
        assert!(!channels.is_open("bot"));
    }

    #[test]
    fn sending_without_a_channel_fails() {
        let channels = PersistentChannels::new();
        assert!(matches!(
            channels.send("nobody", "x"),
            Err(DeliveryError::ChannelClosed { .. })
        ));
    }
}
