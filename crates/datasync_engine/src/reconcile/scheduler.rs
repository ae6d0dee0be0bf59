//! Routing of remote changes to per-model queues.

use super::initial_sync::run_initial_sync;
use super::queue::{ModelReconciliationQueue, QueueReport};
use crate::api::GraphQLApi;
use crate::config::SyncConfig;
use crate::events::{DisconnectReason, SyncEvent, SyncEventHub};
use datasync_protocol::MutationSync;
use datasync_storage::StorageAdapter;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subscription status of a model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStatus {
    /// Waiting for the subscription.
    Connecting,
    /// The subscription is live.
    Connected,
    /// The subscription went away.
    Disconnected(DisconnectReason),
}

impl ModelStatus {
    fn is_settled(&self) -> bool {
        match self {
            ModelStatus::Connecting => false,
            ModelStatus::Connected => true,
            ModelStatus::Disconnected(reason) => reason.is_terminal(),
        }
    }
}

/// Owns one reconciliation queue per model.
///
/// Models reconcile independently: a slow or rejected model never delays
/// another. `Initialized` is published once every model is connected or was
/// rejected for good.
pub struct ReconciliationScheduler {
    queues: HashMap<String, Arc<ModelReconciliationQueue>>,
    api: Arc<dyn GraphQLApi>,
    storage: Arc<dyn StorageAdapter>,
    config: Arc<SyncConfig>,
    hub: Arc<SyncEventHub>,
    status: Arc<Mutex<HashMap<String, ModelStatus>>>,
    initialized: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ReconciliationScheduler {
    /// Creates a queue for every configured model and opens their subscriptions.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        api: Arc<dyn GraphQLApi>,
        storage: Arc<dyn StorageAdapter>,
        config: Arc<SyncConfig>,
        hub: Arc<SyncEventHub>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (reports, rx) = mpsc::unbounded_channel();

        let status: HashMap<_, _> = config
            .models
            .iter()
            .map(|model| (model.clone(), ModelStatus::Connecting))
            .collect();
        let status = Arc::new(Mutex::new(status));
        let initialized = Arc::new(AtomicBool::new(false));

        tokio::spawn(forward_reports(
            rx,
            Arc::clone(&hub),
            Arc::clone(&status),
            Arc::clone(&initialized),
            cancel.clone(),
        ));

        let queues = config
            .models
            .iter()
            .map(|model| {
                let queue = ModelReconciliationQueue::new(
                    model.clone(),
                    Arc::clone(&api),
                    Arc::clone(&storage),
                    Arc::clone(&config),
                    reports.clone(),
                    cancel.child_token(),
                );
                (model.clone(), queue)
            })
            .collect();

        Self {
            queues,
            api,
            storage,
            config,
            hub,
            status,
            initialized,
            cancel,
        }
    }

    /// Runs the initial sync of every model concurrently.
    ///
    /// Failures are reported per model and do not affect the others. Returns
    /// the number of records fetched.
    pub async fn sync_all(&self) -> usize {
        let runs = self.queues.values().map(|queue| async move {
            let result = run_initial_sync(
                self.api.as_ref(),
                self.storage.as_ref(),
                &self.config,
                queue,
            )
            .await;
            (queue.model_name().to_string(), result)
        });

        let mut total = 0;
        for (model_name, result) in join_all(runs).await {
            match result {
                Ok(count) => {
                    total += count;
                    self.hub.emit(SyncEvent::ModelSynced { model_name, count });
                }
                Err(err) => {
                    warn!(model = %model_name, error = %err, "initial sync failed");
                    self.config.report(&err);
                    self.hub.emit(SyncEvent::Error(err));
                }
            }
        }
        total
    }

    /// Starts reconciling live changes for every model.
    pub fn start(&self) {
        for queue in self.queues.values() {
            queue.start();
        }
        info!(models = self.queues.len(), "reconciliation started");
    }

    /// Routes a remote change to its model's queue.
    pub fn enqueue(&self, remote: MutationSync) -> bool {
        match self.queues.get(&remote.model.model_name) {
            Some(queue) => queue.enqueue(remote),
            None => {
                debug!(model = %remote.model.model_name, "remote change for an unsynced model");
                false
            }
        }
    }

    /// Returns the queue of a model.
    pub fn queue(&self, model_name: &str) -> Option<&Arc<ModelReconciliationQueue>> {
        self.queues.get(model_name)
    }

    /// Returns the subscription status of a model.
    pub fn status(&self, model_name: &str) -> Option<ModelStatus> {
        self.status.lock().get(model_name).cloned()
    }

    /// Returns true once `Initialized` was published.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Cancels one model's queue.
    pub fn cancel_model(&self, model_name: &str) {
        if let Some(queue) = self.queues.get(model_name) {
            queue.cancel();
        }
    }

    /// Cancels every queue.
    pub fn cancel(&self) {
        self.cancel.cancel();
        for queue in self.queues.values() {
            queue.cancel();
        }
    }
}

impl Drop for ReconciliationScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("models", &self.queues.keys())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

async fn forward_reports(
    mut rx: mpsc::UnboundedReceiver<(String, QueueReport)>,
    hub: Arc<SyncEventHub>,
    status: Arc<Mutex<HashMap<String, ModelStatus>>>,
    initialized: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let (model_name, report) = tokio::select! {
            _ = cancel.cancelled() => break,
            report = rx.recv() => match report {
                Some(report) => report,
                None => break,
            },
        };

        match report {
            QueueReport::Connected => {
                status.lock().insert(model_name.clone(), ModelStatus::Connected);
                hub.emit(SyncEvent::ModelConnected { model_name });
            }
            QueueReport::Disconnected(reason) => {
                status
                    .lock()
                    .insert(model_name.clone(), ModelStatus::Disconnected(reason.clone()));
                hub.emit(SyncEvent::ModelDisconnected { model_name, reason });
            }
            QueueReport::Applied(event) => hub.emit(SyncEvent::SyncReceived(event)),
            QueueReport::Dropped(error) => {
                hub.emit(SyncEvent::MutationEventDropped { model_name, error })
            }
            QueueReport::Conflict(model_id) => {
                hub.emit(SyncEvent::ConflictDetected {
                    model_name,
                    model_id,
                })
            }
        }

        if !initialized.load(Ordering::SeqCst) {
            let settled = status.lock().values().all(ModelStatus::is_settled);
            if settled && !initialized.swap(true, Ordering::SeqCst) {
                info!("all models settled");
                hub.emit(SyncEvent::Initialized);
            }
        }
    }
}
