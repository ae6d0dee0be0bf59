//! Storage adapter trait definition.

use crate::error::StorageResult;
use async_trait::async_trait;
use datasync_protocol::{AnyModel, ModelSyncMetadata, MutationEvent, SyncMetadata};
use uuid::Uuid;

/// Ordering applied to mutation event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    CreatedAtAscending,
    /// Newest first.
    CreatedAtDescending,
}

/// Filter for mutation event queries.
///
/// Every populated field must match; an empty predicate matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationEventPredicate {
    /// Match on the `in_process` flag.
    pub in_process: Option<bool>,
    /// Match events for any of these model ids.
    pub model_ids: Option<Vec<String>>,
    /// Match events for this model name.
    pub model_name: Option<String>,
}

impl MutationEventPredicate {
    /// Matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to events that are not being delivered.
    pub fn not_in_process(mut self) -> Self {
        self.in_process = Some(false);
        self
    }

    /// Restricts to events for the given model ids.
    pub fn for_model_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.model_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts to events of one model type.
    pub fn for_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    /// Returns true if `event` satisfies the predicate.
    pub fn matches(&self, event: &MutationEvent) -> bool {
        if let Some(in_process) = self.in_process {
            if event.in_process != in_process {
                return false;
            }
        }
        if let Some(ids) = &self.model_ids {
            if !ids.iter().any(|id| *id == event.model_id) {
                return false;
            }
        }
        if let Some(name) = &self.model_name {
            if *name != event.model_name {
                return false;
            }
        }
        true
    }
}

/// The local storage capability used by the sync core.
///
/// Implementations are shared between the outbound path (mutation event
/// deletes) and the reconciliation path (model upserts). Each path writes
/// through a single logical queue, so implementations only need to be safe
/// for concurrent readers plus serialized writers per record kind.
///
/// # Invariants
///
/// - `save_*` is an upsert keyed by the record's identity
/// - `query_mutation_events` honours both the predicate and the ordering
/// - `delete_*` of a missing record returns `Ok(false)`
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Persists a mutation event, replacing any event with the same id.
    async fn save_mutation_event(&self, event: MutationEvent) -> StorageResult<MutationEvent>;

    /// Loads one mutation event by id.
    async fn mutation_event(&self, id: Uuid) -> StorageResult<Option<MutationEvent>>;

    /// Queries mutation events.
    async fn query_mutation_events(
        &self,
        predicate: &MutationEventPredicate,
        sort: SortOrder,
    ) -> StorageResult<Vec<MutationEvent>>;

    /// Deletes a mutation event. Returns whether it existed.
    async fn delete_mutation_event(&self, id: Uuid) -> StorageResult<bool>;

    /// Upserts a model.
    async fn save_model(&self, model: AnyModel) -> StorageResult<AnyModel>;

    /// Loads a model by name and id.
    async fn model(&self, model_name: &str, id: &str) -> StorageResult<Option<AnyModel>>;

    /// Deletes a model. Returns whether it existed.
    async fn delete_model(&self, model_name: &str, id: &str) -> StorageResult<bool>;

    /// Upserts sync metadata for one record.
    async fn save_sync_metadata(&self, metadata: SyncMetadata) -> StorageResult<SyncMetadata>;

    /// Loads sync metadata for the given records of one model.
    async fn sync_metadata(
        &self,
        model_name: &str,
        ids: &[String],
    ) -> StorageResult<Vec<SyncMetadata>>;

    /// Stores the historical sync checkpoint of a model.
    async fn save_model_sync_metadata(&self, metadata: ModelSyncMetadata) -> StorageResult<()>;

    /// Loads the historical sync checkpoint of a model.
    async fn model_sync_metadata(&self, model_name: &str)
        -> StorageResult<Option<ModelSyncMetadata>>;

    /// Returns the not-yet-acknowledged events for the given model ids,
    /// oldest first.
    async fn pending_mutation_events(&self, model_ids: &[String]) -> StorageResult<Vec<MutationEvent>> {
        if model_ids.is_empty() {
            return Ok(Vec::new());
        }
        let predicate = MutationEventPredicate::all().for_model_ids(model_ids.iter().cloned());
        self.query_mutation_events(&predicate, SortOrder::CreatedAtAscending)
            .await
    }
}
