//! Buffer-then-live delivery to a single subscriber.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Delivers published items to one subscriber, buffering until it exists.
///
/// Items published before anyone subscribes are kept in order and handed to
/// the first subscriber before any live item. Buffer drain and subscriber
/// installation happen under the same lock as `publish`, so a concurrent
/// publish can never overtake buffered items.
///
/// Only one subscriber is served at a time. Subscribing again replaces the
/// previous subscriber; if the current subscriber's receiver is dropped,
/// publishing falls back to buffering.
pub struct BufferedPublisher<T> {
    inner: Mutex<PublisherInner<T>>,
}

struct PublisherInner<T> {
    buffer: VecDeque<T>,
    subscriber: Option<UnboundedSender<T>>,
}

impl<T> BufferedPublisher<T> {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PublisherInner {
                buffer: VecDeque::new(),
                subscriber: None,
            }),
        }
    }

    /// Publishes an item.
    pub fn publish(&self, item: T) {
        let mut inner = self.inner.lock();
        let item = match &inner.subscriber {
            Some(tx) => match tx.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };
        inner.subscriber = None;
        inner.buffer.push_back(item);
    }

    /// Subscribes, receiving buffered items first and then live ones.
    pub fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        while let Some(item) = inner.buffer.pop_front() {
            // The receiver is alive for the duration of this call.
            if let Err(mpsc::error::SendError(item)) = tx.send(item) {
                inner.buffer.push_front(item);
                break;
            }
        }
        inner.subscriber = Some(tx);
        rx
    }

    /// Returns the number of buffered items.
    pub fn buffered_len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Returns true if a live subscriber is installed.
    pub fn has_subscriber(&self) -> bool {
        self.inner
            .lock()
            .subscriber
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl<T> Default for BufferedPublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn buffers_until_subscribed() {
        let publisher = BufferedPublisher::new();
        publisher.publish(1);
        publisher.publish(2);
        assert_eq!(publisher.buffered_len(), 2);
        assert!(!publisher.has_subscriber());

        let mut rx = publisher.subscribe();
        publisher.publish(3);

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert_eq!(publisher.buffered_len(), 0);
    }

    #[test]
    fn falls_back_to_buffering_when_subscriber_leaves() {
        let publisher = BufferedPublisher::new();
        let rx = publisher.subscribe();
        assert!(publisher.has_subscriber());
        drop(rx);

        publisher.publish("a");
        assert_eq!(publisher.buffered_len(), 1);

        let mut rx = publisher.subscribe();
        assert_eq!(rx.try_recv().unwrap(), "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_lose_nothing() {
        let publisher = Arc::new(BufferedPublisher::new());
        for i in 0..10 {
            publisher.publish(i);
        }

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let publisher = Arc::clone(&publisher);
                tokio::spawn(async move {
                    for i in 0..50 {
                        publisher.publish(100 + w * 50 + i);
                    }
                })
            })
            .collect();

        let mut rx = publisher.subscribe();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut received = Vec::new();
        while let Ok(item) = rx.try_recv() {
            received.push(item);
        }

        assert_eq!(received.len(), 210);
        // Items published before subscribing come first and in order.
        assert_eq!(&received[..10], &(0..10).collect::<Vec<_>>()[..]);
        let mut sorted = received.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 210);
    }
}
