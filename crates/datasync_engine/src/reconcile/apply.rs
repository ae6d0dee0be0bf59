//! Writing remote changes to local storage.

use super::reconciler::{reconcile, Disposition, DropReason};
use crate::config::{ConflictData, ConflictHandler, ConflictOrigin, ConflictResolution};
use crate::error::SyncResult;
use datasync_protocol::{MutationEvent, MutationSync};
use datasync_storage::StorageAdapter;
use tracing::debug;

/// What happened to a remote change.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The change was written locally.
    Applied(MutationEvent),
    /// The change was discarded.
    Dropped(DropReason),
    /// The change conflicted with a pending local change and was written
    /// locally anyway.
    ConflictApplied(MutationEvent),
}

/// Writes `remote` to storage unconditionally.
///
/// Deleting a record that does not exist locally is not an error. Returns
/// the change as a mutation event for observers.
pub(crate) async fn apply_remote(
    storage: &dyn StorageAdapter,
    remote: &MutationSync,
) -> SyncResult<MutationEvent> {
    let model = &remote.model;
    if remote.sync_metadata.deleted {
        if !storage.delete_model(&model.model_name, &model.id).await? {
            debug!(model = %model.model_name, model_id = %model.id, "remote deletion of unknown record");
        }
    } else {
        storage.save_model(model.clone()).await?;
    }
    storage
        .save_sync_metadata(remote.sync_metadata.clone())
        .await?;

    Ok(MutationEvent::from_model(
        model,
        remote.mutation_type(),
        Some(remote.sync_metadata.version),
    )?)
}

/// Reconciles one remote change against local state and applies it if it wins.
pub(crate) async fn reconcile_and_save(
    storage: &dyn StorageAdapter,
    conflict_handler: &dyn ConflictHandler,
    remote: &MutationSync,
) -> SyncResult<ReconcileOutcome> {
    let model = &remote.model;
    let pending: Vec<_> = storage
        .pending_mutation_events(std::slice::from_ref(&model.id))
        .await?
        .into_iter()
        .filter(|event| event.model_name == model.model_name)
        .collect();
    let local = storage
        .sync_metadata(&model.model_name, std::slice::from_ref(&model.id))
        .await?
        .into_iter()
        .next();

    match reconcile(remote, local.as_ref(), &pending) {
        Disposition::Apply => Ok(ReconcileOutcome::Applied(apply_remote(storage, remote).await?)),
        Disposition::Drop(reason) => {
            debug!(model = %model.model_name, model_id = %model.id, ?reason, "remote change dropped");
            Ok(ReconcileOutcome::Dropped(reason))
        }
        Disposition::Conflict => {
            // The newest pending change is what the user sees locally.
            let Some(latest) = pending.last() else {
                return Ok(ReconcileOutcome::Dropped(DropReason::PendingLocalChange));
            };
            let resolution = conflict_handler.resolve(&ConflictData {
                origin: ConflictOrigin::Incoming,
                local: latest.decode_model()?,
                remote: remote.clone(),
            });
            debug!(model = %model.model_name, model_id = %model.id, ?resolution, "resolved incoming conflict");
            match resolution {
                ConflictResolution::ApplyRemote => Ok(ReconcileOutcome::ConflictApplied(
                    apply_remote(storage, remote).await?,
                )),
                ConflictResolution::RetryLocal | ConflictResolution::Retry(_) => {
                    Ok(ReconcileOutcome::Dropped(DropReason::ConflictKeptLocal))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConflictHandler;
    use datasync_protocol::{AnyModel, MutationType, SyncMetadata};
    use datasync_storage::InMemoryStorage;
    use serde_json::json;

    fn remote(version: u32, deleted: bool) -> MutationSync {
        MutationSync::new(
            AnyModel::new("Post", "1", json!({ "id": "1", "title": "remote" })),
            SyncMetadata::new("Post", "1", version).with_deleted(deleted),
        )
    }

    async fn pending_update(storage: &InMemoryStorage, version: Option<u32>) {
        let event = MutationEvent::new(
            "1",
            "Post",
            r#"{"id":"1","title":"local"}"#,
            MutationType::Update,
            version,
        );
        storage.save_mutation_event(event).await.unwrap();
    }

    #[tokio::test]
    async fn applies_new_records_and_metadata() {
        let storage = InMemoryStorage::new();
        let outcome = reconcile_and_save(&storage, &DefaultConflictHandler, &remote(1, false))
            .await
            .unwrap();

        let ReconcileOutcome::Applied(event) = outcome else {
            panic!("expected the change to be applied");
        };
        assert_eq!(event.mutation_type, MutationType::Create);
        assert_eq!(event.version, Some(1));
        assert!(storage.model("Post", "1").await.unwrap().is_some());
        let metadata = storage.sync_metadata("Post", &["1".into()]).await.unwrap();
        assert_eq!(metadata, vec![SyncMetadata::new("Post", "1", 1)]);
    }

    #[tokio::test]
    async fn deleting_an_unknown_record_is_a_noop() {
        let storage = InMemoryStorage::new();
        let outcome = reconcile_and_save(&storage, &DefaultConflictHandler, &remote(2, true))
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Applied(ref e) if e.mutation_type == MutationType::Delete));
        assert_eq!(storage.model_count(), 0);
        let metadata = storage.sync_metadata("Post", &["1".into()]).await.unwrap();
        assert!(metadata[0].deleted);
    }

    #[tokio::test]
    async fn stale_changes_leave_storage_untouched() {
        let storage = InMemoryStorage::new();
        apply_remote(&storage, &remote(3, false)).await.unwrap();

        let outcome = reconcile_and_save(&storage, &DefaultConflictHandler, &remote(3, true))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Dropped(DropReason::AlreadyApplied));
        assert!(storage.model("Post", "1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_changes_keep_the_local_record_by_default() {
        let storage = InMemoryStorage::new();
        apply_remote(&storage, &remote(1, false)).await.unwrap();
        pending_update(&storage, Some(1)).await;

        let outcome = reconcile_and_save(&storage, &DefaultConflictHandler, &remote(2, false))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Dropped(DropReason::ConflictKeptLocal));
        let metadata = storage.sync_metadata("Post", &["1".into()]).await.unwrap();
        assert_eq!(metadata[0].version, 1);
    }

    #[tokio::test]
    async fn conflict_handler_can_take_the_remote_record() {
        let storage = InMemoryStorage::new();
        apply_remote(&storage, &remote(1, false)).await.unwrap();
        pending_update(&storage, Some(1)).await;

        let handler = |conflict: &ConflictData| {
            assert_eq!(conflict.local.field("title"), Some(&json!("local")));
            ConflictResolution::ApplyRemote
        };
        let outcome = reconcile_and_save(&storage, &handler, &remote(2, false))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::ConflictApplied(_)));
        let metadata = storage.sync_metadata("Post", &["1".into()]).await.unwrap();
        assert_eq!(metadata[0].version, 2);
    }
}
