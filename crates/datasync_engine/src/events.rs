//! Lifecycle events published by the engine.
//!
//! Every component reports through one [`SyncEventHub`]. Subscribers get an
//! unbounded receiver; events are cloned to each live subscriber and
//! subscribers whose receiver was dropped are pruned on the next emit.

use crate::error::SyncError;
use datasync_protocol::{MutationEvent, MutationSync};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Why a model's subscription went away.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// The caller is not authorized for the model.
    Unauthorized,
    /// Subscriptions are disabled for the model.
    OperationDisabled,
    /// Any other failure.
    Failed(String),
    /// The subscription stream ended.
    Closed,
}

impl DisconnectReason {
    /// Returns true if the model will not connect again in this session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Unauthorized | DisconnectReason::OperationDisabled
        )
    }
}

/// An engine lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The engine stopped.
    Idle,
    /// The engine started.
    Started,
    /// Every model finished connecting or was rejected.
    Initialized,
    /// A model's subscription is connected.
    ModelConnected {
        /// Model name.
        model_name: String,
    },
    /// A model's subscription went away.
    ModelDisconnected {
        /// Model name.
        model_name: String,
        /// Why.
        reason: DisconnectReason,
    },
    /// A model finished its initial sync.
    ModelSynced {
        /// Model name.
        model_name: String,
        /// Number of records fetched.
        count: usize,
    },
    /// Whether the outbox holds undelivered mutations.
    OutboxStatus {
        /// True when nothing is waiting for delivery.
        is_empty: bool,
    },
    /// A mutation was handed to the delivery lane.
    OutboxMutationEnqueued(MutationEvent),
    /// A mutation was acknowledged by the service.
    OutboxMutationProcessed {
        /// The delivered mutation.
        event: MutationEvent,
        /// The record as acknowledged.
        mutation_sync: MutationSync,
    },
    /// A mutation could not be delivered and stays in the outbox.
    MutationFailed {
        /// The failed mutation.
        event: MutationEvent,
        /// The final error.
        error: SyncError,
    },
    /// The service rejected a mutation's condition.
    ConditionalSaveFailed(MutationEvent),
    /// A remote change was applied locally.
    SyncReceived(MutationEvent),
    /// A remote change was discarded.
    MutationEventDropped {
        /// Model name.
        model_name: String,
        /// The error, if the drop was caused by one.
        error: Option<SyncError>,
    },
    /// A remote change conflicted with a pending local change.
    ConflictDetected {
        /// Model name.
        model_name: String,
        /// Primary key.
        model_id: String,
    },
    /// A background failure.
    Error(SyncError),
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
pub struct SyncEventHub {
    subscribers: RwLock<Vec<UnboundedSender<SyncEvent>>>,
}

impl SyncEventHub {
    /// Creates a hub with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends an event to every live subscriber.
    pub fn emit(&self, event: SyncEvent) {
        tracing::trace!(?event, "sync event");
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for SyncEventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncEventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEventHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_every_subscriber() {
        let hub = SyncEventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.emit(SyncEvent::Started);
        hub.emit(SyncEvent::OutboxStatus { is_empty: true });

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap(), SyncEvent::Started);
            assert_eq!(
                rx.try_recv().unwrap(),
                SyncEvent::OutboxStatus { is_empty: true }
            );
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = SyncEventHub::new();
        let rx = hub.subscribe();
        let _kept = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(rx);
        hub.emit(SyncEvent::Idle);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn terminal_disconnects() {
        assert!(DisconnectReason::Unauthorized.is_terminal());
        assert!(DisconnectReason::OperationDisabled.is_terminal());
        assert!(!DisconnectReason::Failed("socket closed".into()).is_terminal());
        assert!(!DisconnectReason::Closed.is_terminal());
    }
}
