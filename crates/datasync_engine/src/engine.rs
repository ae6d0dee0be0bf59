//! The sync engine facade.

use crate::api::GraphQLApi;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncEventHub};
use crate::ingester::MutationEventIngester;
use crate::outbox::{OutboxState, OutgoingMutationQueue};
use crate::reconcile::ReconciliationScheduler;
use datasync_protocol::{AnyModel, MutationEvent, MutationType};
use datasync_storage::StorageAdapter;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wires the ingester, the outbox and reconciliation together.
///
/// Local writes go through [`save`](Self::save), [`delete`](Self::delete) or
/// [`submit`](Self::submit); remote changes arrive through the API's
/// subscriptions and initial sync. Every acknowledged local write is also
/// reconciled, so local sync metadata follows the service.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    storage: Arc<dyn StorageAdapter>,
    api: Arc<dyn GraphQLApi>,
    hub: Arc<SyncEventHub>,
    ingester: Arc<MutationEventIngester>,
    outbox: OutgoingMutationQueue,
    scheduler: RwLock<Option<Arc<ReconciliationScheduler>>>,
    started: AtomicBool,
    paused: AtomicBool,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Creates an engine. Must be called within a tokio runtime.
    pub fn new(
        config: SyncConfig,
        storage: Arc<dyn StorageAdapter>,
        api: Arc<dyn GraphQLApi>,
    ) -> Self {
        let config = Arc::new(config);
        let hub = Arc::new(SyncEventHub::new());
        let ingester = Arc::new(MutationEventIngester::new(Arc::clone(&storage)));
        let outbox =
            OutgoingMutationQueue::new(Arc::clone(&storage), Arc::clone(&config), Arc::clone(&hub));

        Self {
            config,
            storage,
            api,
            hub,
            ingester,
            outbox,
            scheduler: RwLock::new(None),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts syncing.
    ///
    /// Restores undelivered mutations, starts the outbox, runs the initial
    /// sync of every model and then starts live reconciliation. Fails with a
    /// configuration error if storage is unreachable.
    pub async fn start(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::configuration("sync engine was cancelled"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("sync engine already started");
            return Ok(());
        }

        let restored = match self.ingester.start().await {
            Ok(restored) => restored,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.hub.emit(SyncEvent::Started);

        let scheduler = Arc::new(ReconciliationScheduler::new(
            Arc::clone(&self.api),
            Arc::clone(&self.storage),
            Arc::clone(&self.config),
            Arc::clone(&self.hub),
        ));
        *self.scheduler.write() = Some(Arc::clone(&scheduler));
        self.forward_acknowledgements(Arc::clone(&scheduler));

        self.outbox
            .start(Arc::clone(&self.api), Arc::clone(&self.ingester) as _);
        if !self.paused.load(Ordering::SeqCst) {
            self.outbox.resume();
        }

        let fetched = scheduler.sync_all().await;
        scheduler.start();
        info!(restored, fetched, "sync engine started");
        Ok(())
    }

    /// Persists a mutation event and queues it for delivery.
    pub async fn submit(&self, event: MutationEvent) -> SyncResult<MutationEvent> {
        self.check_model(&event.model_name)?;
        event.decode_model()?;
        self.ingester.submit(event).await
    }

    /// Saves a model locally and queues the write for delivery.
    pub async fn save(&self, model: AnyModel) -> SyncResult<MutationEvent> {
        self.check_model(&model.model_name)?;
        let metadata = self
            .storage
            .sync_metadata(&model.model_name, std::slice::from_ref(&model.id))
            .await?
            .into_iter()
            .next();
        let existing = self.storage.model(&model.model_name, &model.id).await?;

        let exists_remotely = metadata.as_ref().is_some_and(|m| !m.deleted);
        let mutation_type = if existing.is_some() || exists_remotely {
            MutationType::Update
        } else {
            MutationType::Create
        };
        let event = MutationEvent::from_model(
            &model,
            mutation_type,
            metadata.map(|m| m.version),
        )?;

        self.storage.save_model(model).await?;
        self.ingester.submit(event).await
    }

    /// Deletes a model locally and queues the deletion for delivery.
    pub async fn delete(&self, model_name: &str, id: &str) -> SyncResult<MutationEvent> {
        self.check_model(model_name)?;
        let model = self
            .storage
            .model(model_name, id)
            .await?
            .ok_or_else(|| SyncError::InvalidMutation(format!("{model_name} {id} does not exist")))?;
        let version = self
            .storage
            .sync_metadata(model_name, &[id.to_string()])
            .await?
            .into_iter()
            .next()
            .map(|m| m.version);
        let event = MutationEvent::from_model(&model, MutationType::Delete, version)?;

        self.storage.delete_model(model_name, id).await?;
        self.ingester.submit(event).await
    }

    /// Pauses delivery. Local writes are still captured.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.outbox.pause();
    }

    /// Resumes delivery.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        if self.started.load(Ordering::SeqCst) {
            self.outbox.resume();
        }
    }

    /// Stops all sync activity. The engine cannot be started again.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.outbox.cancel();
        if let Some(scheduler) = self.scheduler.read().as_ref() {
            scheduler.cancel();
        }
        self.hub.emit(SyncEvent::Idle);
        info!("sync engine stopped");
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> UnboundedReceiver<SyncEvent> {
        self.hub.subscribe()
    }

    /// Returns the outbox state.
    pub fn outbox_state(&self) -> OutboxState {
        self.outbox.state()
    }

    /// Returns the outbox.
    pub fn outbox(&self) -> &OutgoingMutationQueue {
        &self.outbox
    }

    /// Returns the reconciliation scheduler once the engine has started.
    pub fn scheduler(&self) -> Option<Arc<ReconciliationScheduler>> {
        self.scheduler.read().clone()
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn check_model(&self, model_name: &str) -> SyncResult<()> {
        if self.config.models.iter().any(|m| m == model_name) {
            Ok(())
        } else {
            Err(SyncError::InvalidMutation(format!(
                "model {model_name} is not synced"
            )))
        }
    }

    /// Reconciles every acknowledged local write.
    fn forward_acknowledgements(&self, scheduler: Arc<ReconciliationScheduler>) {
        let mut events = self.hub.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let SyncEvent::OutboxMutationProcessed { mutation_sync, .. } = event {
                    debug!(model = %mutation_sync.model.model_name, model_id = %mutation_sync.model.id, "reconciling acknowledged mutation");
                    scheduler.enqueue(mutation_sync);
                }
            }
        });
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("outbox", &self.outbox)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
