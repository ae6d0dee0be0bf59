//! Outbox state machine.
//!
//! [`resolve`] is a pure function of the current state and an action. The
//! queue actor applies it and performs the side effects of each state it
//! enters exactly once.

use crate::api::GraphQLApi;
use crate::error::SyncError;
use crate::ingester::MutationEventSource;
use datasync_protocol::MutationEvent;
use std::fmt;
use std::mem;
use std::sync::Arc;

/// The state of the outgoing mutation queue.
#[derive(Clone)]
pub enum OutboxState {
    /// Created, not yet initialized.
    NotInitialized,
    /// Initialized and waiting for `start`.
    NotStarted,
    /// Attaching the API and the event source.
    Starting {
        /// API used for delivery.
        api: Arc<dyn GraphQLApi>,
        /// Source of mutation events.
        source: Arc<dyn MutationEventSource>,
    },
    /// Waiting for the event source subscription.
    WaitingForSubscription,
    /// Asking the source for the next event.
    RequestingEvent,
    /// Waiting for the source to produce an event.
    WaitingForEvent,
    /// Handing an event to the delivery lane.
    EnqueuingEvent(MutationEvent),
    /// Stopped. Terminal.
    Finished,
    /// Failed. Terminal.
    InError(SyncError),
}

impl OutboxState {
    /// Returns the state's name.
    pub fn name(&self) -> &'static str {
        match self {
            OutboxState::NotInitialized => "notInitialized",
            OutboxState::NotStarted => "notStarted",
            OutboxState::Starting { .. } => "starting",
            OutboxState::WaitingForSubscription => "waitingForSubscription",
            OutboxState::RequestingEvent => "requestingEvent",
            OutboxState::WaitingForEvent => "waitingForEvent",
            OutboxState::EnqueuingEvent(_) => "enqueuingEvent",
            OutboxState::Finished => "finished",
            OutboxState::InError(_) => "inError",
        }
    }

    /// Returns true for states that only a cancel can leave, if anything.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxState::Finished | OutboxState::InError(_))
    }

    /// Returns true if `other` is the same kind of state.
    pub fn same_kind(&self, other: &OutboxState) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl fmt::Debug for OutboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxState::EnqueuingEvent(event) => f
                .debug_tuple("EnqueuingEvent")
                .field(&event.id)
                .finish(),
            OutboxState::InError(error) => f.debug_tuple("InError").field(error).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Inputs to the outbox state machine.
#[derive(Clone)]
pub enum OutboxAction {
    /// The queue finished construction.
    Initialized,
    /// The engine asked the queue to start.
    ReceivedStart {
        /// API used for delivery.
        api: Arc<dyn GraphQLApi>,
        /// Source of mutation events.
        source: Arc<dyn MutationEventSource>,
    },
    /// The API is attached.
    Started,
    /// The event source subscription is in place.
    ReceivedSubscription,
    /// One event was requested from the source.
    RequestedEvent,
    /// The source produced an event.
    ReceivedEvent(MutationEvent),
    /// The event was handed to the delivery lane.
    EnqueuedEvent,
    /// Delivery of the event finished, successfully or not.
    ProcessedEvent,
    /// An unrecoverable failure.
    Errored(SyncError),
    /// The engine cancelled the queue.
    ReceivedCancel,
}

impl OutboxAction {
    /// Returns the action's name.
    pub fn name(&self) -> &'static str {
        match self {
            OutboxAction::Initialized => "initialized",
            OutboxAction::ReceivedStart { .. } => "receivedStart",
            OutboxAction::Started => "started",
            OutboxAction::ReceivedSubscription => "receivedSubscription",
            OutboxAction::RequestedEvent => "requestedEvent",
            OutboxAction::ReceivedEvent(_) => "receivedEvent",
            OutboxAction::EnqueuedEvent => "enqueuedEvent",
            OutboxAction::ProcessedEvent => "processedEvent",
            OutboxAction::Errored(_) => "errored",
            OutboxAction::ReceivedCancel => "receivedCancel",
        }
    }
}

impl fmt::Debug for OutboxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxAction::ReceivedEvent(event) => {
                f.debug_tuple("ReceivedEvent").field(&event.id).finish()
            }
            OutboxAction::Errored(error) => f.debug_tuple("Errored").field(error).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Computes the state after `action`.
///
/// Unrecognized pairs are logged and leave the state unchanged. `Finished`
/// ignores everything; `InError` only accepts a cancel.
pub fn resolve(state: &OutboxState, action: OutboxAction) -> OutboxState {
    use OutboxAction as A;
    use OutboxState as S;

    match (state, action) {
        (S::Finished, _) => state.clone(),
        (S::InError(_), A::ReceivedCancel) => S::Finished,
        (S::InError(_), _) => state.clone(),
        (_, A::ReceivedCancel) => S::Finished,
        (_, A::Errored(error)) => S::InError(error),

        (S::NotInitialized, A::Initialized) => S::NotStarted,
        (S::NotStarted, A::ReceivedStart { api, source }) => S::Starting { api, source },
        (S::Starting { .. }, A::Started) => S::WaitingForSubscription,
        (S::WaitingForSubscription, A::ReceivedSubscription) => S::RequestingEvent,
        (S::RequestingEvent, A::RequestedEvent) => S::WaitingForEvent,
        (S::RequestingEvent | S::WaitingForEvent, A::ReceivedEvent(event)) => {
            S::EnqueuingEvent(event)
        }
        (S::EnqueuingEvent(_), A::EnqueuedEvent) => S::WaitingForEvent,
        (S::WaitingForEvent, A::ProcessedEvent) => S::RequestingEvent,

        (state, action) => {
            tracing::warn!(
                state = state.name(),
                action = action.name(),
                "ignoring unexpected outbox action"
            );
            state.clone()
        }
    }
}
