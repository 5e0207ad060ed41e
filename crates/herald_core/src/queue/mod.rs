//! In-process FIFO between the pollers and the dispatcher.

mod dispatcher;

pub use dispatcher::{DispatchReport, Dispatcher};

use tokio::sync::mpsc;

use crate::error::{CoreError, Result};
use crate::event::Event;

/// Creates a connected queue. Senders may be cloned freely; there is one
/// receiver.
pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

/// Producer half. Pushing never blocks.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn push(&self, event: Event) -> Result<()> {
        self.tx.send(event).map_err(|_| CoreError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half. Events come out in push order.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Waits for the next event. Returns `None` once every sender is gone.
    pub async fn pop(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_pop(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EntityRef, Post};
    use crate::id::SourceType;

    fn post(id: &str, t: i64) -> Event {
        Event::new_post(
            SourceType::Weibo,
            EntityRef::new("1", None),
            Post {
                id: id.into(),
                ..Post::default()
            },
            t,
        )
    }

    #[tokio::test]
    async fn fifo_order() {
        let (tx, mut rx) = event_queue();
        let other = tx.clone();
        tx.push(post("a", 1)).unwrap();
        other.push(post("b", 2)).unwrap();
        tx.push(post("c", 3)).unwrap();

        let order: Vec<i64> = vec![
            rx.pop().await.unwrap().created_time,
            rx.pop().await.unwrap().created_time,
            rx.pop().await.unwrap().created_time,
        ];
        assert_eq!(order, vec![1, 2, 3]);
        assert!(rx.try_pop().is_none());
    }

    #[test]
    fn pop_waits_for_a_push() {
        use tokio_test::{assert_pending, assert_ready, task};

        let (tx, mut rx) = event_queue();
        let mut pop = task::spawn(rx.pop());
        assert_pending!(pop.poll());

        tx.push(post("a", 7)).unwrap();
        assert!(pop.is_woken());
        let event = assert_ready!(pop.poll()).unwrap();
        assert_eq!(event.created_time, 7);
    }

    #[test]
    fn pop_ends_once_every_sender_is_gone() {
        let (tx, mut rx) = event_queue();
        tx.push(post("a", 1)).unwrap();
        drop(tx);
        assert_eq!(tokio_test::block_on(rx.pop()).map(|event| event.created_time), Some(1));
        assert!(tokio_test::block_on(rx.pop()).is_none());
    }

    #[tokio::test]
    async fn push_after_receiver_dropped_fails() {
        let (tx, rx) = event_queue();
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(tx.push(post("a", 1)), Err(CoreError::QueueClosed)));
    }
}
