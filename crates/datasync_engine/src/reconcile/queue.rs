//! Per-model reconciliation queue.

use super::apply::{reconcile_and_save, ReconcileOutcome};
use super::reconciler::DropReason;
use crate::api::{ConnectionState, GraphQLApi, SubscriptionEvent};
use crate::config::SyncConfig;
use crate::error::{ApiError, SyncError};
use crate::events::DisconnectReason;
use crate::lane::WorkLane;
use crate::publisher::BufferedPublisher;
use datasync_protocol::{MutationEvent, MutationSync, SubscriptionRequest};
use datasync_storage::StorageAdapter;
use futures::{FutureExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Reports from a model queue to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueueReport {
    Connected,
    Disconnected(DisconnectReason),
    Applied(MutationEvent),
    Dropped(Option<SyncError>),
    Conflict(String),
}

pub(crate) type ReportSender = mpsc::UnboundedSender<(String, QueueReport)>;

/// Reconciles remote changes of one model, one at a time.
///
/// Live subscription changes are buffered until [`start`](Self::start).
/// Changes passed to [`enqueue`](Self::enqueue) go straight to the serial
/// reconcile lane, so initial sync results can be applied before the
/// buffered live changes.
pub struct ModelReconciliationQueue {
    model_name: String,
    incoming: BufferedPublisher<MutationSync>,
    lane: WorkLane,
    storage: Arc<dyn StorageAdapter>,
    config: Arc<SyncConfig>,
    reports: ReportSender,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl ModelReconciliationQueue {
    /// Creates the queue and opens the model's subscription.
    pub(crate) fn new(
        model_name: impl Into<String>,
        api: Arc<dyn GraphQLApi>,
        storage: Arc<dyn StorageAdapter>,
        config: Arc<SyncConfig>,
        reports: ReportSender,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let model_name = model_name.into();
        let queue = Arc::new(Self {
            lane: WorkLane::new(format!("reconcile:{model_name}"), false, cancel.child_token()),
            model_name,
            incoming: BufferedPublisher::new(),
            storage,
            config,
            reports,
            cancel,
            started: AtomicBool::new(false),
        });
        tokio::spawn(Arc::clone(&queue).receive_remote(api));
        queue
    }

    /// Returns the model this queue reconciles.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Starts reconciling buffered and future live changes.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx = self.incoming.subscribe();
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let remote = tokio::select! {
                    _ = queue.cancel.cancelled() => break,
                    remote = rx.recv() => match remote {
                        Some(remote) => remote,
                        None => break,
                    },
                };
                queue.enqueue(remote);
            }
        });
        info!(model = %self.model_name, "reconciliation queue started");
    }

    /// Returns true once [`start`](Self::start) was called.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Schedules `remote` for reconciliation.
    ///
    /// Returns false if the change belongs to another model, is outside the
    /// configured sync expression, or the queue was cancelled.
    pub fn enqueue(self: &Arc<Self>, remote: MutationSync) -> bool {
        if remote.model.model_name != self.model_name {
            warn!(
                expected = %self.model_name,
                actual = %remote.model.model_name,
                "remote change routed to the wrong model queue"
            );
            return false;
        }
        if !self.config.in_scope(&remote.model) {
            trace!(model = %self.model_name, model_id = %remote.model.id, "remote change out of scope");
            return false;
        }

        let queue = Arc::clone(self);
        self.lane.submit(
            async move {
                let handler = Arc::clone(&queue.config.conflict_handler);
                let result =
                    reconcile_and_save(queue.storage.as_ref(), handler.as_ref(), &remote).await;
                queue.report_outcome(&remote, result);
            }
            .boxed(),
        )
    }

    /// Returns the number of live changes waiting for [`start`](Self::start).
    pub fn buffered_len(&self) -> usize {
        self.incoming.buffered_len()
    }

    /// Stops the subscription and drops queued work.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.lane.cancel();
    }

    fn report(&self, report: QueueReport) {
        if self.reports.send((self.model_name.clone(), report)).is_err() {
            trace!(model = %self.model_name, "reconciliation scheduler stopped");
        }
    }

    fn report_outcome(&self, remote: &MutationSync, result: Result<ReconcileOutcome, SyncError>) {
        match result {
            Ok(ReconcileOutcome::Applied(event)) => self.report(QueueReport::Applied(event)),
            Ok(ReconcileOutcome::Dropped(DropReason::ConflictKeptLocal)) => {
                self.report(QueueReport::Conflict(remote.model.id.clone()));
                self.report(QueueReport::Dropped(None));
            }
            Ok(ReconcileOutcome::Dropped(_)) => self.report(QueueReport::Dropped(None)),
            Ok(ReconcileOutcome::ConflictApplied(event)) => {
                self.report(QueueReport::Conflict(remote.model.id.clone()));
                self.report(QueueReport::Applied(event));
            }
            Err(err) => {
                warn!(model = %self.model_name, model_id = %remote.model.id, error = %err, "reconciliation failed");
                self.config.report(&err);
                self.report(QueueReport::Dropped(Some(err)));
            }
        }
    }

    async fn receive_remote(self: Arc<Self>, api: Arc<dyn GraphQLApi>) {
        let request = SubscriptionRequest::new(self.model_name.clone());
        let subscribed = tokio::select! {
            _ = self.cancel.cancelled() => return,
            subscribed = api.subscribe(request) => subscribed,
        };
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(err) => {
                warn!(model = %self.model_name, error = %err, "subscription failed");
                return self.report(QueueReport::Disconnected(disconnect_reason(&err)));
            }
        };

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                Some(SubscriptionEvent::Connection(ConnectionState::Connected)) => {
                    debug!(model = %self.model_name, "subscription connected");
                    self.report(QueueReport::Connected);
                }
                Some(SubscriptionEvent::Connection(state)) => {
                    trace!(model = %self.model_name, ?state, "subscription state");
                }
                Some(SubscriptionEvent::Data(remote)) => self.incoming.publish(remote),
                Some(SubscriptionEvent::Failed(err)) => {
                    warn!(model = %self.model_name, error = %err, "subscription failed");
                    return self.report(QueueReport::Disconnected(disconnect_reason(&err)));
                }
                None => {
                    debug!(model = %self.model_name, "subscription closed");
                    return self.report(QueueReport::Disconnected(DisconnectReason::Closed));
                }
            }
        }
    }
}

impl std::fmt::Debug for ModelReconciliationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelReconciliationQueue")
            .field("model_name", &self.model_name)
            .field("started", &self.is_started())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

fn disconnect_reason(err: &ApiError) -> DisconnectReason {
    if err.is_unauthorized() {
        DisconnectReason::Unauthorized
    } else if err.is_operation_disabled() {
        DisconnectReason::OperationDisabled
    } else {
        DisconnectReason::Failed(err.to_string())
    }
}
