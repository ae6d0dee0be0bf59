//! Delivery of one mutation event.

use crate::api::{ApiResponse, GraphQLApi};
use crate::error::{ApiError, SyncError, SyncResult};
use datasync_protocol::{GraphQLRequest, MutationEvent, MutationSync, MutationType};
use datasync_storage::{StorageAdapter, StorageError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// A mutation the service accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    /// The record as stored by the service.
    pub mutation_sync: MutationSync,
    /// Set when the event could not be removed from local storage.
    pub removal_error: Option<StorageError>,
}

/// Sends one mutation event to the service.
///
/// On success the event has been removed from local storage before the
/// acknowledged record is returned. Once the service accepted the mutation
/// the result is always an [`Acknowledgement`]; a failed removal is carried
/// inside it rather than turning the delivery into a failure.
///
/// Cancellation is observed before any work, right before sending, and
/// while the request is in flight. A cancelled operation never reports
/// success.
pub struct DeliveryOperation {
    event: MutationEvent,
    api: Arc<dyn GraphQLApi>,
    storage: Arc<dyn StorageAdapter>,
    cancel: CancellationToken,
}

impl DeliveryOperation {
    /// Creates an operation for `event`.
    pub fn new(
        event: MutationEvent,
        api: Arc<dyn GraphQLApi>,
        storage: Arc<dyn StorageAdapter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            event,
            api,
            storage,
            cancel,
        }
    }

    /// Returns the event being delivered.
    pub fn event(&self) -> &MutationEvent {
        &self.event
    }

    /// Runs the operation to completion.
    #[instrument(
        name = "deliver_mutation",
        skip(self),
        fields(event_id = %self.event.id, model = %self.event.model_name)
    )]
    pub async fn run(&self) -> SyncResult<Acknowledgement> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let request = build_request(&self.event)?;

        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        debug!(operation = %request.operation_name, "sending mutation");
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            response = self.api.mutate(request) => response?,
        };
        let mutation_sync = validate(response)?;

        let removal_error = match self.storage.delete_mutation_event(self.event.id).await {
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "mutation acknowledged but the event was not removed");
                Some(err)
            }
        };
        debug!(version = mutation_sync.sync_metadata.version, "mutation acknowledged");
        Ok(Acknowledgement {
            mutation_sync,
            removal_error,
        })
    }
}

/// Builds the mutation request for an event.
pub fn build_request(event: &MutationEvent) -> SyncResult<GraphQLRequest> {
    let model = event.decode_model()?;
    Ok(match event.mutation_type {
        MutationType::Create => GraphQLRequest::create_mutation(&model),
        MutationType::Update => GraphQLRequest::update_mutation(&model, event.version),
        MutationType::Delete => GraphQLRequest::delete_mutation(&model, event.version),
    })
}

pub(crate) fn validate(response: ApiResponse) -> SyncResult<MutationSync> {
    if !(200..300).contains(&response.status) {
        return Err(ApiError::from_status(response.status, "mutation rejected").into());
    }
    response
        .body
        .map_err(|errors| SyncError::Api(ApiError::GraphQL(errors)))
}
