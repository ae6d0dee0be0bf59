//! In-memory storage for tests and ephemeral stores.

use crate::adapter::{MutationEventPredicate, SortOrder, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use datasync_protocol::{AnyModel, ModelSyncMetadata, MutationEvent, SyncMetadata};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;
use uuid::Uuid;

type RecordKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    /// Mutation events in insertion order.
    events: Vec<MutationEvent>,
    models: HashMap<RecordKey, AnyModel>,
    metadata: HashMap<RecordKey, SyncMetadata>,
    checkpoints: HashMap<String, ModelSyncMetadata>,
}

/// An in-memory [`StorageAdapter`].
///
/// This store keeps everything in memory and is suitable for:
/// - Unit and integration tests
/// - Simulating restarts (share one instance between engine instances)
/// - Ephemeral stores that don't need persistence
///
/// # Thread Safety
///
/// The store is thread-safe and can be shared across tasks behind an `Arc`.
///
/// # Example
///
/// ```rust
/// use datasync_protocol::{MutationEvent, MutationType};
/// use datasync_storage::{InMemoryStorage, MutationEventPredicate, SortOrder, StorageAdapter};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let storage = InMemoryStorage::new();
/// let event = MutationEvent::new("p1", "Post", r#"{"id":"p1"}"#, MutationType::Create, None);
/// storage.save_mutation_event(event).await.unwrap();
///
/// let pending = storage
///     .query_mutation_events(&MutationEventPredicate::all(), SortOrder::CreatedAtAscending)
///     .await
///     .unwrap();
/// assert_eq!(pending.len(), 1);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    closed: AtomicBool,
    injected_fault: Mutex<Option<StorageError>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the store; every later call fails with [`StorageError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns true if the store has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes the next storage call fail with `error`.
    pub fn fail_next(&self, error: StorageError) {
        *self.injected_fault.lock() = Some(error);
    }

    /// Returns the number of stored mutation events.
    pub fn mutation_event_count(&self) -> usize {
        self.tables.read().events.len()
    }

    /// Returns the number of stored models.
    pub fn model_count(&self) -> usize {
        self.tables.read().models.len()
    }

    fn check(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        match self.injected_fault.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn save_mutation_event(&self, event: MutationEvent) -> StorageResult<MutationEvent> {
        self.check()?;
        let mut tables = self.tables.write();
        match tables.events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event.clone(),
            None => tables.events.push(event.clone()),
        }
        trace!(event_id = %event.id, model_name = %event.model_name, "saved mutation event");
        Ok(event)
    }

    async fn mutation_event(&self, id: Uuid) -> StorageResult<Option<MutationEvent>> {
        self.check()?;
        Ok(self.tables.read().events.iter().find(|e| e.id == id).cloned())
    }

    async fn query_mutation_events(
        &self,
        predicate: &MutationEventPredicate,
        sort: SortOrder,
    ) -> StorageResult<Vec<MutationEvent>> {
        self.check()?;
        let mut events: Vec<MutationEvent> = self
            .tables
            .read()
            .events
            .iter()
            .filter(|e| predicate.matches(e))
            .cloned()
            .collect();

        // Stable sorts keep insertion order for equal timestamps.
        match sort {
            SortOrder::CreatedAtAscending => events.sort_by_key(|e| e.created_at),
            SortOrder::CreatedAtDescending => {
                events.reverse();
                events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
        }
        Ok(events)
    }

    async fn delete_mutation_event(&self, id: Uuid) -> StorageResult<bool> {
        self.check()?;
        let mut tables = self.tables.write();
        let before = tables.events.len();
        tables.events.retain(|e| e.id != id);
        Ok(tables.events.len() != before)
    }

    async fn save_model(&self, model: AnyModel) -> StorageResult<AnyModel> {
        self.check()?;
        let key = (model.model_name.clone(), model.id.clone());
        self.tables.write().models.insert(key, model.clone());
        Ok(model)
    }

    async fn model(&self, model_name: &str, id: &str) -> StorageResult<Option<AnyModel>> {
        self.check()?;
        let key = (model_name.to_string(), id.to_string());
        Ok(self.tables.read().models.get(&key).cloned())
    }

    async fn delete_model(&self, model_name: &str, id: &str) -> StorageResult<bool> {
        self.check()?;
        let key = (model_name.to_string(), id.to_string());
        Ok(self.tables.write().models.remove(&key).is_some())
    }

    async fn save_sync_metadata(&self, metadata: SyncMetadata) -> StorageResult<SyncMetadata> {
        self.check()?;
        let key = (metadata.model_name.clone(), metadata.id.clone());
        self.tables.write().metadata.insert(key, metadata.clone());
        Ok(metadata)
    }

    async fn sync_metadata(
        &self,
        model_name: &str,
        ids: &[String],
    ) -> StorageResult<Vec<SyncMetadata>> {
        self.check()?;
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                tables
                    .metadata
                    .get(&(model_name.to_string(), id.clone()))
                    .cloned()
            })
            .collect())
    }

    async fn save_model_sync_metadata(&self, metadata: ModelSyncMetadata) -> StorageResult<()> {
        self.check()?;
        self.tables
            .write()
            .checkpoints
            .insert(metadata.model_name.clone(), metadata);
        Ok(())
    }

    async fn model_sync_metadata(
        &self,
        model_name: &str,
    ) -> StorageResult<Option<ModelSyncMetadata>> {
        self.check()?;
        Ok(self.tables.read().checkpoints.get(model_name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use datasync_protocol::MutationType;
    use serde_json::json;

    fn event(model_id: &str, mutation_type: MutationType) -> MutationEvent {
        MutationEvent::new(
            model_id,
            "Post",
            format!(r#"{{"id":"{model_id}"}}"#),
            mutation_type,
            None,
        )
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let storage = InMemoryStorage::new();
        let mut e = event("p1", MutationType::Create);
        storage.save_mutation_event(e.clone()).await.unwrap();

        e.in_process = true;
        storage.save_mutation_event(e.clone()).await.unwrap();

        assert_eq!(storage.mutation_event_count(), 1);
        assert!(storage.mutation_event(e.id).await.unwrap().unwrap().in_process);
    }

    #[tokio::test]
    async fn query_filters_and_orders() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let newest = event("p1", MutationType::Update).with_created_at(now);
        let oldest = event("p1", MutationType::Create).with_created_at(now - Duration::seconds(2));
        let mut busy = event("p2", MutationType::Create).with_created_at(now - Duration::seconds(1));
        busy.in_process = true;

        for e in [&newest, &oldest, &busy] {
            storage.save_mutation_event(e.clone()).await.unwrap();
        }

        let all = storage
            .query_mutation_events(&MutationEventPredicate::all(), SortOrder::CreatedAtAscending)
            .await
            .unwrap();
        assert_eq!(
            all.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![oldest.id, busy.id, newest.id]
        );

        let idle = storage
            .query_mutation_events(
                &MutationEventPredicate::all().not_in_process(),
                SortOrder::CreatedAtDescending,
            )
            .await
            .unwrap();
        assert_eq!(
            idle.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![newest.id, oldest.id]
        );

        let for_p2 = storage.pending_mutation_events(&["p2".to_string()]).await.unwrap();
        assert_eq!(for_p2.len(), 1);
        assert_eq!(for_p2[0].id, busy.id);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_insertion_order() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let ids: Vec<_> = (0..5)
            .map(|i| event(&format!("p{i}"), MutationType::Create).with_created_at(now))
            .collect();
        for e in &ids {
            storage.save_mutation_event(e.clone()).await.unwrap();
        }

        let ascending = storage
            .query_mutation_events(&MutationEventPredicate::all(), SortOrder::CreatedAtAscending)
            .await
            .unwrap();
        let descending = storage
            .query_mutation_events(&MutationEventPredicate::all(), SortOrder::CreatedAtDescending)
            .await
            .unwrap();

        let expected: Vec<_> = ids.iter().map(|e| e.id).collect();
        assert_eq!(ascending.iter().map(|e| e.id).collect::<Vec<_>>(), expected);
        let mut reversed = expected.clone();
        reversed.reverse();
        assert_eq!(descending.iter().map(|e| e.id).collect::<Vec<_>>(), reversed);
    }

    #[tokio::test]
    async fn deleting_missing_records_is_not_an_error() {
        let storage = InMemoryStorage::new();
        assert!(!storage.delete_mutation_event(Uuid::new_v4()).await.unwrap());
        assert!(!storage.delete_model("Post", "missing").await.unwrap());
    }

    #[tokio::test]
    async fn models_and_metadata() {
        let storage = InMemoryStorage::new();
        let model = AnyModel::new("Post", "p1", json!({ "id": "p1" }));
        storage.save_model(model.clone()).await.unwrap();
        storage
            .save_sync_metadata(SyncMetadata::new("Post", "p1", 2))
            .await
            .unwrap();

        assert_eq!(storage.model("Post", "p1").await.unwrap(), Some(model));
        let metadata = storage
            .sync_metadata("Post", &["p1".into(), "p2".into()])
            .await
            .unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].version, 2);

        assert!(storage.delete_model("Post", "p1").await.unwrap());
        assert_eq!(storage.model_count(), 0);
    }

    #[tokio::test]
    async fn closed_store_fails_explicitly() {
        let storage = InMemoryStorage::new();
        storage.close();
        let err = storage
            .save_mutation_event(event("p1", MutationType::Create))
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::Closed);
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn injected_fault_affects_one_call() {
        let storage = InMemoryStorage::new();
        storage.fail_next(StorageError::Backend("disk full".into()));

        assert!(storage.model("Post", "p1").await.is_err());
        assert!(storage.model("Post", "p1").await.is_ok());
    }
}
