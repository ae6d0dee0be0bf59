//! Handling of mutations the service rejected.

use crate::api::GraphQLApi;
use crate::config::{ConflictData, ConflictOrigin, ConflictResolution, SyncConfig};
use crate::error::{ApiError, SyncError, SyncResult};
use crate::events::{SyncEvent, SyncEventHub};
use crate::outbox::delivery::validate;
use crate::reconcile::apply_remote;
use datasync_protocol::{
    AnyModel, GraphQLError, GraphQLRequest, MutationEvent, MutationSync, MutationType,
    ServiceErrorType,
};
use datasync_storage::StorageAdapter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Resolves GraphQL errors returned for an outgoing mutation.
///
/// | error              | mutation | outcome                                            |
/// |--------------------|----------|----------------------------------------------------|
/// | conditional check  | any      | `ConditionalSaveFailed` is published               |
/// | unhandled conflict | create   | reported                                           |
/// | unhandled conflict | delete   | remote record restored unless it is deleted too    |
/// | unhandled conflict | update   | remote deletion applied, else the handler decides  |
/// | anything else      | any      | reported                                           |
pub(crate) struct MutationErrorProcessor {
    config: Arc<SyncConfig>,
    storage: Arc<dyn StorageAdapter>,
    hub: Arc<SyncEventHub>,
    cancel: CancellationToken,
}

impl MutationErrorProcessor {
    pub(crate) fn new(
        config: Arc<SyncConfig>,
        storage: Arc<dyn StorageAdapter>,
        hub: Arc<SyncEventHub>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            storage,
            hub,
            cancel,
        }
    }

    /// Processes the errors for `event`.
    ///
    /// Returns the acknowledged record when the mutation was retried and
    /// accepted. Errors are returned for conflicts that could not be
    /// resolved; the caller reports them.
    pub(crate) async fn process(
        &self,
        api: &dyn GraphQLApi,
        event: &MutationEvent,
        errors: Vec<GraphQLError>,
    ) -> SyncResult<Option<MutationSync>> {
        let error_type = errors.first().and_then(GraphQLError::error_type);
        match error_type {
            Some(ServiceErrorType::ConditionalCheck) => {
                debug!(event_id = %event.id, "conditional save failed");
                self.hub.emit(SyncEvent::ConditionalSaveFailed(event.clone()));
                self.config
                    .report(&SyncError::Api(ApiError::GraphQL(errors)));
                Ok(None)
            }
            Some(ServiceErrorType::ConflictUnhandled) => {
                let remote = match errors.first().and_then(GraphQLError::remote_model) {
                    Some(remote) => remote?,
                    None => return Err(conflict(event)),
                };
                self.process_conflict(api, event, remote).await
            }
            _ => {
                warn!(event_id = %event.id, ?error_type, "mutation rejected");
                Err(SyncError::Api(ApiError::GraphQL(errors)))
            }
        }
    }

    async fn process_conflict(
        &self,
        api: &dyn GraphQLApi,
        event: &MutationEvent,
        remote: MutationSync,
    ) -> SyncResult<Option<MutationSync>> {
        match event.mutation_type {
            MutationType::Create => Err(conflict(event)),
            MutationType::Delete => {
                if !remote.sync_metadata.deleted {
                    self.apply(&remote).await?;
                }
                Ok(None)
            }
            MutationType::Update if remote.sync_metadata.deleted => {
                self.apply(&remote).await?;
                Ok(None)
            }
            MutationType::Update => {
                let local = event.decode_model()?;
                let version = remote.sync_metadata.version;
                let resolution = self.config.conflict_handler.resolve(&ConflictData {
                    origin: ConflictOrigin::Outgoing,
                    local: local.clone(),
                    remote: remote.clone(),
                });
                debug!(event_id = %event.id, ?resolution, "resolved outgoing conflict");
                match resolution {
                    ConflictResolution::ApplyRemote => {
                        self.apply(&remote).await?;
                        Ok(None)
                    }
                    ConflictResolution::RetryLocal => self.retry(api, local, version).await.map(Some),
                    ConflictResolution::Retry(model) => self.retry(api, model, version).await.map(Some),
                }
            }
        }
    }

    async fn apply(&self, remote: &MutationSync) -> SyncResult<()> {
        let applied = apply_remote(self.storage.as_ref(), remote).await?;
        self.hub.emit(SyncEvent::SyncReceived(applied));
        Ok(())
    }

    async fn retry(
        &self,
        api: &dyn GraphQLApi,
        model: AnyModel,
        version: u32,
    ) -> SyncResult<MutationSync> {
        let request = GraphQLRequest::update_mutation(&model, Some(version));
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            response = api.mutate(request) => response?,
        };
        validate(response)
    }
}

fn conflict(event: &MutationEvent) -> SyncError {
    SyncError::Conflict {
        model_name: event.model_name.clone(),
        model_id: event.model_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiResponse, MockApi};
    use datasync_protocol::SyncMetadata;
    use datasync_storage::InMemoryStorage;
    use serde_json::json;

    struct Fixture {
        api: Arc<MockApi>,
        storage: Arc<InMemoryStorage>,
        hub: Arc<SyncEventHub>,
        processor: MutationErrorProcessor,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let api = Arc::new(MockApi::new());
        let storage = Arc::new(InMemoryStorage::new());
        let hub = Arc::new(SyncEventHub::new());
        let processor = MutationErrorProcessor::new(
            Arc::new(config),
            storage.clone(),
            hub.clone(),
            CancellationToken::new(),
        );
        Fixture {
            api,
            storage,
            hub,
            processor,
        }
    }

    fn post(title: &str) -> AnyModel {
        AnyModel::new("Post", "1", json!({ "id": "1", "title": title }))
    }

    fn local_event(mutation_type: MutationType) -> MutationEvent {
        MutationEvent::from_model(&post("local"), mutation_type, Some(1)).unwrap()
    }

    fn conflict_error(remote: &MutationSync) -> Vec<GraphQLError> {
        vec![GraphQLError::with_error_type("conflict", "ConflictUnhandled")
            .with_data(remote.to_graphql_object())]
    }

    fn remote(version: u32, deleted: bool) -> MutationSync {
        MutationSync::new(
            post("remote"),
            SyncMetadata::new("Post", "1", version).with_deleted(deleted),
        )
    }

    #[tokio::test]
    async fn conditional_check_is_published() {
        let f = fixture(SyncConfig::new(["Post"]));
        let mut events = f.hub.subscribe();
        let event = local_event(MutationType::Update);
        let errors = vec![GraphQLError::with_error_type("no", "ConditionalCheck")];

        let outcome = f.processor.process(f.api.as_ref(), &event, errors).await;
        assert_eq!(outcome, Ok(None));
        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::ConditionalSaveFailed(event)
        );
    }

    #[tokio::test]
    async fn create_conflicts_are_errors() {
        let f = fixture(SyncConfig::new(["Post"]));
        let event = local_event(MutationType::Create);
        let outcome = f
            .processor
            .process(f.api.as_ref(), &event, conflict_error(&remote(2, false)))
            .await;
        assert!(matches!(outcome, Err(SyncError::Conflict { .. })));
    }

    #[tokio::test]
    async fn rejected_delete_restores_the_remote_record() {
        let f = fixture(SyncConfig::new(["Post"]));
        let event = local_event(MutationType::Delete);
        f.processor
            .process(f.api.as_ref(), &event, conflict_error(&remote(4, false)))
            .await
            .unwrap();

        let restored = f.storage.model("Post", "1").await.unwrap().unwrap();
        assert_eq!(restored.field("title"), Some(&json!("remote")));
        let metadata = f.storage.sync_metadata("Post", &["1".into()]).await.unwrap();
        assert_eq!(metadata[0].version, 4);
    }

    #[tokio::test]
    async fn rejected_delete_of_a_deleted_record_is_a_noop() {
        let f = fixture(SyncConfig::new(["Post"]));
        let event = local_event(MutationType::Delete);
        f.processor
            .process(f.api.as_ref(), &event, conflict_error(&remote(4, true)))
            .await
            .unwrap();
        assert_eq!(f.storage.model_count(), 0);
    }

    #[tokio::test]
    async fn update_against_a_remote_deletion_deletes_locally() {
        let f = fixture(SyncConfig::new(["Post"]));
        f.storage.save_model(post("local")).await.unwrap();
        let event = local_event(MutationType::Update);

        f.processor
            .process(f.api.as_ref(), &event, conflict_error(&remote(5, true)))
            .await
            .unwrap();
        assert!(f.storage.model("Post", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_conflict_apply_remote_by_default() {
        let f = fixture(SyncConfig::new(["Post"]));
        let mut events = f.hub.subscribe();
        let event = local_event(MutationType::Update);

        let outcome = f
            .processor
            .process(f.api.as_ref(), &event, conflict_error(&remote(3, false)))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(f.api.request_count(), 0);
        assert!(matches!(events.try_recv().unwrap(), SyncEvent::SyncReceived(_)));
    }

    #[tokio::test]
    async fn update_conflict_retry_sends_against_the_remote_version() {
        let config = SyncConfig::new(["Post"]).with_conflict_handler(|conflict: &ConflictData| {
            let mut merged = conflict.local.clone();
            merged.instance["title"] = json!("merged");
            ConflictResolution::Retry(merged)
        });
        let f = fixture(config);
        let event = local_event(MutationType::Update);

        let acknowledged = f
            .processor
            .process(f.api.as_ref(), &event, conflict_error(&remote(3, false)))
            .await
            .unwrap()
            .unwrap();

        let requests = f.api.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].version(), Some(3));
        assert_eq!(acknowledged.model.field("title"), Some(&json!("merged")));
    }

    #[tokio::test]
    async fn failed_retry_is_returned() {
        let config = SyncConfig::new(["Post"])
            .with_conflict_handler(|_: &ConflictData| ConflictResolution::RetryLocal);
        let f = fixture(config);
        f.api.push_response(Ok(ApiResponse::errors(vec![GraphQLError::new("nope")])));
        let event = local_event(MutationType::Update);

        let outcome = f
            .processor
            .process(f.api.as_ref(), &event, conflict_error(&remote(3, false)))
            .await;
        assert!(matches!(outcome, Err(SyncError::Api(ApiError::GraphQL(_)))));
    }

    #[tokio::test]
    async fn other_errors_are_returned() {
        let f = fixture(SyncConfig::new(["Post"]));
        let event = local_event(MutationType::Update);
        let outcome = f
            .processor
            .process(f.api.as_ref(), &event, vec![GraphQLError::new("boom")])
            .await;
        assert!(matches!(outcome, Err(SyncError::Api(_))));
    }
}
