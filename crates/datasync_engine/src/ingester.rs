//! Local write capture.
//!
//! The ingester persists every local write as a [`MutationEvent`] and then
//! publishes it to the outbox. Nothing is published before it is durable.

use crate::detach::Detachable;
use crate::error::SyncResult;
use crate::publisher::BufferedPublisher;
use chrono::{DateTime, Duration, Utc};
use datasync_protocol::MutationEvent;
use datasync_storage::{MutationEventPredicate, SortOrder, StorageAdapter};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A source of mutation events for the outbox.
pub trait MutationEventSource: Send + Sync {
    /// Subscribes to events: first everything published so far, then live ones.
    fn subscribe(&self) -> UnboundedReceiver<MutationEvent>;
}

#[derive(Debug, Default)]
struct IngestState {
    started: bool,
    last_created_at: Option<DateTime<Utc>>,
}

impl IngestState {
    /// Returns a timestamp strictly after every one handed out so far.
    fn next_created_at(&mut self, requested: DateTime<Utc>) -> DateTime<Utc> {
        let created_at = match self.last_created_at {
            Some(last) if requested <= last => last + Duration::microseconds(1),
            _ => requested,
        };
        self.last_created_at = Some(created_at);
        created_at
    }

    fn observe(&mut self, created_at: DateTime<Utc>) {
        if self.last_created_at.map_or(true, |last| created_at > last) {
            self.last_created_at = Some(created_at);
        }
    }
}

/// Persists local writes and publishes them in creation order.
pub struct MutationEventIngester {
    storage: Detachable<dyn StorageAdapter>,
    publisher: BufferedPublisher<MutationEvent>,
    state: Mutex<IngestState>,
}

impl MutationEventIngester {
    /// Creates an ingester writing to `storage`.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage: Detachable::new("storage adapter", storage),
            publisher: BufferedPublisher::new(),
            state: Mutex::new(IngestState::default()),
        }
    }

    /// Republishes the events left over from a previous session.
    ///
    /// Interrupted deliveries are reset first, then every persisted event is
    /// published oldest first. Writes submitted before `start` are only
    /// persisted and are picked up here, so the published order always
    /// matches `created_at`. Calling `start` again does nothing.
    ///
    /// Returns the number of events published.
    pub async fn start(&self) -> SyncResult<usize> {
        let mut state = self.state.lock().await;
        if state.started {
            warn!("mutation event ingester already started");
            return Ok(0);
        }

        let storage = self.storage.get()?;
        let events = storage
            .query_mutation_events(&MutationEventPredicate::all(), SortOrder::CreatedAtAscending)
            .await?;

        let count = events.len();
        for mut event in events {
            if event.in_process {
                event.in_process = false;
                event = storage.save_mutation_event(event).await?;
            }
            state.observe(event.created_at);
            self.publisher.publish(event);
        }
        state.started = true;

        info!(count, "restored persisted mutation events");
        Ok(count)
    }

    /// Persists a local write and publishes it.
    ///
    /// Submissions are serialized: each event gets a `created_at` strictly
    /// after the previous one and is published in that order. The stored
    /// event is returned.
    pub async fn submit(&self, mut event: MutationEvent) -> SyncResult<MutationEvent> {
        let mut state = self.state.lock().await;
        let storage = self.storage.get()?;

        event.created_at = state.next_created_at(event.created_at);
        event.in_process = false;
        let saved = storage.save_mutation_event(event).await?;

        if state.started {
            self.publisher.publish(saved.clone());
        }
        debug!(
            event_id = %saved.id,
            model = %saved.model_name,
            model_id = %saved.model_id,
            mutation_type = %saved.mutation_type,
            "mutation event saved"
        );
        Ok(saved)
    }

    /// Releases the storage adapter. Later calls fail with a configuration error.
    pub fn detach(&self) {
        self.storage.detach();
    }

    /// Returns the number of published events no subscriber has taken yet.
    pub fn buffered_len(&self) -> usize {
        self.publisher.buffered_len()
    }
}

impl MutationEventSource for MutationEventIngester {
    fn subscribe(&self) -> UnboundedReceiver<MutationEvent> {
        self.publisher.subscribe()
    }
}

impl std::fmt::Debug for MutationEventIngester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationEventIngester")
            .field("storage", &self.storage)
            .field("buffered", &self.buffered_len())
            .finish()
    }
}
