//! Outgoing mutation queue.
//!
//! The queue pulls one event at a time from its [`MutationEventSource`],
//! hands it to a serial delivery lane and asks for the next event only after
//! the previous delivery finished. At most one delivery is in flight.
//!
//! ## Key Invariants
//!
//! - Events are delivered in the order the source produced them
//! - An event is reloaded from storage before delivery and skipped if gone
//! - A delivered event is removed from storage before it is reported
//! - An acknowledgement is never turned into a failure by local storage
//! - The lane starts suspended; `resume` releases it

mod delivery;
mod error_processor;
mod state;

pub use delivery::{build_request, Acknowledgement, DeliveryOperation};
pub use state::{resolve, OutboxAction, OutboxState};

use crate::api::GraphQLApi;
use crate::config::SyncConfig;
use crate::detach::Detachable;
use crate::error::{ApiError, SyncError};
use crate::events::{SyncEvent, SyncEventHub};
use crate::ingester::MutationEventSource;
use crate::lane::WorkLane;
use datasync_protocol::{MutationEvent, MutationSync};
use datasync_storage::{MutationEventPredicate, SortOrder, StorageAdapter, StorageError};
use error_processor::MutationErrorProcessor;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Delivers local mutation events to the service, one at a time.
pub struct OutgoingMutationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    actions: mpsc::UnboundedSender<OutboxAction>,
    state: watch::Sender<OutboxState>,
    lane: WorkLane,
    storage: Arc<dyn StorageAdapter>,
    config: Arc<SyncConfig>,
    hub: Arc<SyncEventHub>,
    api: Detachable<dyn GraphQLApi>,
    events: Mutex<Option<mpsc::UnboundedReceiver<MutationEvent>>>,
    processor: MutationErrorProcessor,
    cancel: CancellationToken,
}

impl OutgoingMutationQueue {
    /// Creates the queue and initializes its state machine.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        config: Arc<SyncConfig>,
        hub: Arc<SyncEventHub>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (actions, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(OutboxState::NotInitialized);

        let inner = Arc::new(QueueInner {
            actions,
            state,
            lane: WorkLane::new("outbox", true, cancel.child_token()),
            processor: MutationErrorProcessor::new(
                Arc::clone(&config),
                Arc::clone(&storage),
                Arc::clone(&hub),
                cancel.child_token(),
            ),
            storage,
            config,
            hub,
            api: Detachable::empty("GraphQL API"),
            events: Mutex::new(None),
            cancel,
        });

        tokio::spawn(run_state_machine(Arc::clone(&inner), rx));
        inner.notify(OutboxAction::Initialized);
        Self { inner }
    }

    /// Starts pulling events from `source` and delivering them through `api`.
    ///
    /// Delivery only begins once the queue is resumed.
    pub fn start(&self, api: Arc<dyn GraphQLApi>, source: Arc<dyn MutationEventSource>) {
        self.inner
            .notify(OutboxAction::ReceivedStart { api, source });
    }

    /// Stops starting deliveries. An in-flight delivery completes.
    pub fn pause(&self) {
        debug!("pausing outbox");
        self.inner.lane.suspend();
    }

    /// Releases the delivery lane.
    pub fn resume(&self) {
        debug!("resuming outbox");
        self.inner.lane.resume();
    }

    /// Returns true if deliveries are paused.
    pub fn is_paused(&self) -> bool {
        self.inner.lane.is_suspended()
    }

    /// Cancels in-flight and queued deliveries and finishes the queue.
    pub fn cancel(&self) {
        self.inner.shutdown();
    }

    /// Returns the current state.
    pub fn state(&self) -> OutboxState {
        self.inner.state.borrow().clone()
    }

    /// Watches state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<OutboxState> {
        self.inner.state.subscribe()
    }
}

impl Drop for OutgoingMutationQueue {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for OutgoingMutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMutationQueue")
            .field("state", &self.state())
            .field("paused", &self.is_paused())
            .finish()
    }
}

async fn run_state_machine(
    inner: Arc<QueueInner>,
    mut actions: mpsc::UnboundedReceiver<OutboxAction>,
) {
    let mut current = OutboxState::NotInitialized;
    while let Some(action) = actions.recv().await {
        trace!(state = current.name(), action = action.name(), "outbox action");
        let next = resolve(&current, action);
        if next.same_kind(&current) {
            continue;
        }
        current = next;
        debug!(state = current.name(), "outbox state changed");
        inner.state.send_replace(current.clone());
        inner.respond(&current);
        if matches!(current, OutboxState::Finished) {
            break;
        }
    }
}

impl QueueInner {
    fn notify(&self, action: OutboxAction) {
        if self.actions.send(action).is_err() {
            trace!("outbox state machine stopped");
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        self.notify(OutboxAction::ReceivedCancel);
    }

    /// Side effects of entering `state`.
    fn respond(self: &Arc<Self>, state: &OutboxState) {
        match state {
            OutboxState::NotInitialized
            | OutboxState::NotStarted
            | OutboxState::WaitingForSubscription
            | OutboxState::WaitingForEvent => {}
            OutboxState::Starting { api, source } => {
                let inner = Arc::clone(self);
                let api = Arc::clone(api);
                let source = Arc::clone(source);
                tokio::spawn(async move {
                    inner.api.attach(api);
                    inner.publish_status().await;
                    inner.notify(OutboxAction::Started);
                    *inner.events.lock() = Some(source.subscribe());
                    inner.notify(OutboxAction::ReceivedSubscription);
                });
            }
            OutboxState::RequestingEvent => {
                tokio::spawn(Arc::clone(self).request_event());
            }
            OutboxState::EnqueuingEvent(event) => {
                tokio::spawn(Arc::clone(self).enqueue(event.clone()));
            }
            OutboxState::Finished => {
                self.cancel.cancel();
                self.api.detach();
                info!("outbox finished");
            }
            OutboxState::InError(err) => {
                error!(error = %err, "outbox stopped");
                self.hub.emit(SyncEvent::Error(err.clone()));
                self.config.report(err);
            }
        }
    }

    async fn request_event(self: Arc<Self>) {
        let Some(mut rx) = self.events.lock().take() else {
            self.notify(OutboxAction::Errored(SyncError::configuration(
                "outbox has no mutation event subscription",
            )));
            return;
        };
        self.notify(OutboxAction::RequestedEvent);

        let next = tokio::select! {
            _ = self.cancel.cancelled() => return,
            next = rx.recv() => next,
        };
        *self.events.lock() = Some(rx);

        match next {
            Some(event) => self.notify(OutboxAction::ReceivedEvent(event)),
            None => self.notify(OutboxAction::Errored(SyncError::configuration(
                "mutation event source closed",
            ))),
        }
    }

    async fn enqueue(self: Arc<Self>, event: MutationEvent) {
        let api = match self.api.get() {
            Ok(api) => api,
            Err(err) => return self.notify(OutboxAction::Errored(err)),
        };

        let mut current = match self.storage.mutation_event(event.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!(event_id = %event.id, "mutation event no longer stored, skipping");
                self.notify(OutboxAction::EnqueuedEvent);
                self.notify(OutboxAction::ProcessedEvent);
                return;
            }
            Err(err) => return self.enqueue_failed(event, err.into()),
        };

        current.in_process = true;
        let current = match self.storage.save_mutation_event(current).await {
            Ok(saved) => saved,
            Err(err) => return self.enqueue_failed(event, err.into()),
        };

        self.hub
            .emit(SyncEvent::OutboxMutationEnqueued(current.clone()));
        self.hub.emit(SyncEvent::OutboxStatus { is_empty: false });
        // Must precede any ProcessedEvent the delivery job sends.
        self.notify(OutboxAction::EnqueuedEvent);
        self.dispatch(current, api, 1, Duration::ZERO);
    }

    fn enqueue_failed(&self, event: MutationEvent, err: SyncError) {
        if err.is_configuration() {
            self.notify(OutboxAction::Errored(err));
            return;
        }
        warn!(event_id = %event.id, error = %err, "failed to enqueue mutation event");
        self.config.report(&err);
        self.hub.emit(SyncEvent::MutationFailed { event, error: err });
        self.notify(OutboxAction::EnqueuedEvent);
        self.notify(OutboxAction::ProcessedEvent);
    }

    fn dispatch(
        self: &Arc<Self>,
        event: MutationEvent,
        api: Arc<dyn GraphQLApi>,
        attempt: u32,
        delay: Duration,
    ) {
        let inner = Arc::clone(self);
        let operation = DeliveryOperation::new(
            event.clone(),
            Arc::clone(&api),
            Arc::clone(&self.storage),
            self.cancel.child_token(),
        );
        let job = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = operation.run().await;
            inner.complete(event, api, attempt, result).await;
        }
        .boxed();

        if !self.lane.submit(job) {
            debug!("outbox lane stopped, delivery dropped");
        }
    }

    async fn complete(
        self: Arc<Self>,
        event: MutationEvent,
        api: Arc<dyn GraphQLApi>,
        attempt: u32,
        result: Result<Acknowledgement, SyncError>,
    ) {
        match result {
            Ok(Acknowledgement {
                mutation_sync,
                removal_error,
            }) => {
                let removal = match removal_error {
                    Some(err) => self.remove_acknowledged(&event, err).await,
                    None => Ok(()),
                };
                self.acknowledged(&event, mutation_sync).await;
                if let Err(err) = removal {
                    self.notify(OutboxAction::Errored(err));
                    return;
                }
            }
            Err(SyncError::Cancelled) => {
                debug!(event_id = %event.id, "delivery cancelled");
                return;
            }
            Err(SyncError::Api(ApiError::GraphQL(errors))) => {
                match self.processor.process(api.as_ref(), &event, errors).await {
                    Ok(Some(acknowledged)) => self.acknowledged(&event, acknowledged).await,
                    Ok(None) => {}
                    Err(err) => {
                        self.config.report(&err);
                        self.hub.emit(SyncEvent::MutationFailed {
                            event: event.clone(),
                            error: err,
                        });
                    }
                }
                // The service answered, so the event is settled either way.
                if let Err(err) = self.storage.delete_mutation_event(event.id).await {
                    warn!(event_id = %event.id, error = %err, "failed to remove rejected mutation event");
                }
            }
            Err(err) if err.is_retryable() && attempt < self.config.retry.max_attempts => {
                let delay = self.config.retry.delay_for_attempt(attempt);
                warn!(event_id = %event.id, attempt, ?delay, error = %err, "delivery failed, retrying");
                self.dispatch(event, api, attempt + 1, delay);
                return;
            }
            Err(err) if err.is_configuration() => {
                self.notify(OutboxAction::Errored(err));
                return;
            }
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "delivery failed");
                let mut failed = event.clone();
                failed.in_process = false;
                if let Err(save_err) = self.storage.save_mutation_event(failed).await {
                    warn!(event_id = %event.id, error = %save_err, "failed to release mutation event");
                }
                self.config.report(&err);
                self.hub.emit(SyncEvent::MutationFailed { event, error: err });
            }
        }

        self.publish_status().await;
        self.notify(OutboxAction::ProcessedEvent);
    }

    /// Retries removing an event the service already accepted.
    ///
    /// Only unreachable storage is returned; other failures are reported and
    /// leave the event stored.
    async fn remove_acknowledged(
        &self,
        event: &MutationEvent,
        first: StorageError,
    ) -> Result<(), SyncError> {
        if first.is_unreachable() {
            return Err(first.into());
        }
        match self.storage.delete_mutation_event(event.id).await {
            Ok(_) => {
                debug!(event_id = %event.id, "acknowledged event removed on retry");
                Ok(())
            }
            Err(err) if err.is_unreachable() => Err(err.into()),
            Err(err) => {
                error!(event_id = %event.id, error = %err, "acknowledged event could not be removed");
                self.config.report(&SyncError::Storage(err));
                Ok(())
            }
        }
    }

    async fn acknowledged(&self, event: &MutationEvent, acknowledged: MutationSync) {
        self.propagate_version(event, &acknowledged).await;
        self.hub.emit(SyncEvent::OutboxMutationProcessed {
            event: event.clone(),
            mutation_sync: acknowledged,
        });
    }

    /// Rebases queued events of the same record onto the acknowledged version.
    async fn propagate_version(&self, event: &MutationEvent, acknowledged: &MutationSync) {
        let version = acknowledged.sync_metadata.version;
        let pending = match self
            .storage
            .pending_mutation_events(std::slice::from_ref(&event.model_id))
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "failed to load pending mutation events");
                return;
            }
        };

        for mut next in pending {
            if next.id == event.id
                || next.model_name != event.model_name
                || next.in_process
                || next.version == Some(version)
            {
                continue;
            }
            next.version = Some(version);
            if let Err(err) = self.storage.save_mutation_event(next).await {
                warn!(error = %err, "failed to update pending mutation event version");
            }
        }
    }

    async fn publish_status(&self) {
        let predicate = MutationEventPredicate::all().not_in_process();
        match self
            .storage
            .query_mutation_events(&predicate, SortOrder::CreatedAtAscending)
            .await
        {
            Ok(events) => self.hub.emit(SyncEvent::OutboxStatus {
                is_empty: events.is_empty(),
            }),
            Err(err) => warn!(error = %err, "failed to query outbox"),
        }
    }
}
