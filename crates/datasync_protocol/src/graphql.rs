//! GraphQL request and response types exchanged with the remote API.
//!
//! Only the shape the sync core relies on is modelled here: which operation
//! runs against which model, the input variables (including the optimistic
//! concurrency version), and the service errors the core has to classify.
//! Document text is produced by the API layer.

use crate::error::ProtocolResult;
use crate::model::{AnyModel, MutationSync};
use crate::mutation::MutationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of a GraphQL operation: data, or the errors returned by the service.
pub type GraphQLResponse<T = MutationSync> = Result<T, Vec<GraphQLError>>;

/// Operation carried by a [`GraphQLRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphQLOperation {
    /// A create, update or delete mutation.
    Mutation(MutationType),
    /// A paginated historical sync query.
    Sync,
    /// A live subscription to remote changes.
    Subscription,
}

/// A request against the remote GraphQL API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLRequest {
    /// Operation kind.
    pub operation: GraphQLOperation,
    /// Target model.
    pub model_name: String,
    /// Operation name, for example `updatePost`.
    pub operation_name: String,
    /// Request variables. Mutations carry their fields under `input`.
    pub variables: Value,
}

impl GraphQLRequest {
    /// Builds a create mutation for `model`.
    pub fn create_mutation(model: &AnyModel) -> Self {
        Self::mutation(MutationType::Create, model, model.instance.clone(), None)
    }

    /// Builds an update mutation for `model` based on `version`.
    pub fn update_mutation(model: &AnyModel, version: Option<u32>) -> Self {
        Self::mutation(MutationType::Update, model, model.instance.clone(), version)
    }

    /// Builds a delete mutation for `model` based on `version`.
    ///
    /// Only the primary key is sent.
    pub fn delete_mutation(model: &AnyModel, version: Option<u32>) -> Self {
        let mut input = Map::new();
        input.insert("id".into(), Value::String(model.id.clone()));
        Self::mutation(MutationType::Delete, model, Value::Object(input), version)
    }

    fn mutation(
        mutation_type: MutationType,
        model: &AnyModel,
        fields: Value,
        version: Option<u32>,
    ) -> Self {
        let mut input = fields.as_object().cloned().unwrap_or_default();
        input.insert("id".into(), Value::String(model.id.clone()));
        if let Some(version) = version {
            input.insert("_version".into(), Value::from(version));
        }
        let mut variables = Map::new();
        variables.insert("input".into(), Value::Object(input));

        Self {
            operation: GraphQLOperation::Mutation(mutation_type),
            model_name: model.model_name.clone(),
            operation_name: format!("{}{}", mutation_type.as_str(), model.model_name),
            variables: Value::Object(variables),
        }
    }

    /// Returns the mutation input object, if this is a mutation.
    pub fn input(&self) -> Option<&Value> {
        self.variables.get("input")
    }

    /// Returns the optimistic concurrency version sent with the request.
    pub fn version(&self) -> Option<u32> {
        self.input()
            .and_then(|input| input.get("_version"))
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    /// Returns the mutation type, if this is a mutation.
    pub fn mutation_type(&self) -> Option<MutationType> {
        match self.operation {
            GraphQLOperation::Mutation(mutation_type) => Some(mutation_type),
            _ => None,
        }
    }

    /// Returns the primary key of the mutated model, if present.
    pub fn model_id(&self) -> Option<&str> {
        self.input().and_then(|input| input.get("id")).and_then(Value::as_str)
    }
}

/// Error category reported by the service in `extensions.errorType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceErrorType {
    /// A conditional write was rejected.
    ConditionalCheck,
    /// The service detected a version conflict it could not auto-merge.
    ConflictUnhandled,
    /// The caller is not authorized for the operation.
    Unauthorized,
    /// The operation is disabled for this model.
    OperationDisabled,
    /// Any other service error type.
    Unknown(String),
}

impl From<&str> for ServiceErrorType {
    fn from(value: &str) -> Self {
        match value {
            "ConditionalCheckFailedException" => ServiceErrorType::ConditionalCheck,
            "ConflictUnhandled" => ServiceErrorType::ConflictUnhandled,
            "Unauthorized" | "UnauthorizedException" => ServiceErrorType::Unauthorized,
            "OperationDisabled" => ServiceErrorType::OperationDisabled,
            other => ServiceErrorType::Unknown(other.to_string()),
        }
    }
}

/// A single error returned by the GraphQL service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// Human readable message.
    pub message: String,
    /// Service specific extensions (`errorType`, `data`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    /// Creates an error without extensions.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extensions: None,
        }
    }

    /// Creates an error tagged with a service error type.
    pub fn with_error_type(message: impl Into<String>, error_type: &str) -> Self {
        let mut extensions = Map::new();
        extensions.insert("errorType".into(), Value::String(error_type.to_string()));
        Self {
            message: message.into(),
            extensions: Some(extensions),
        }
    }

    /// Attaches the remote record carried by conflict errors.
    pub fn with_data(mut self, data: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert("data".into(), data);
        self
    }

    /// Returns the classified error type, if the service reported one.
    pub fn error_type(&self) -> Option<ServiceErrorType> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("errorType"))
            .and_then(Value::as_str)
            .map(ServiceErrorType::from)
    }

    /// Returns the `data` extension.
    pub fn data(&self) -> Option<&Value> {
        self.extensions.as_ref().and_then(|ext| ext.get("data"))
    }

    /// Decodes the remote record carried by a conflict error.
    pub fn remote_model(&self) -> Option<ProtocolResult<MutationSync>> {
        self.data().map(MutationSync::from_graphql_object)
    }
}

/// A historical sync query for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueryRequest {
    /// Model to sync.
    pub model_name: String,
    /// Page size.
    pub limit: u32,
    /// Continuation token from the previous page.
    pub next_token: Option<String>,
    /// Only return changes since this time (delta sync).
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncQueryRequest {
    /// Creates a first-page request.
    pub fn new(model_name: impl Into<String>, limit: u32, last_sync: Option<DateTime<Utc>>) -> Self {
        Self {
            model_name: model_name.into(),
            limit,
            next_token: None,
            last_sync,
        }
    }

    /// Returns the request for the page after `next_token`.
    pub fn next_page(&self, next_token: String) -> Self {
        Self {
            next_token: Some(next_token),
            ..self.clone()
        }
    }
}

/// One page of a historical sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedList<T = MutationSync> {
    /// Records in this page.
    pub items: Vec<T>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
    /// Server time at which the sync started.
    pub started_at: Option<DateTime<Utc>>,
}

/// A live subscription to remote changes of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Model to observe.
    pub model_name: String,
}

impl SubscriptionRequest {
    /// Creates a subscription request.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post() -> AnyModel {
        AnyModel::new("Post", "p1", json!({ "id": "p1", "title": "hello" }))
    }

    #[test]
    fn create_mutation_has_no_version() {
        let request = GraphQLRequest::create_mutation(&post());
        assert_eq!(request.operation, GraphQLOperation::Mutation(MutationType::Create));
        assert_eq!(request.operation_name, "createPost");
        assert_eq!(request.version(), None);
        assert_eq!(request.input().unwrap()["title"], json!("hello"));
    }

    #[test]
    fn update_and_delete_carry_version() {
        let update = GraphQLRequest::update_mutation(&post(), Some(3));
        assert_eq!(update.version(), Some(3));
        assert_eq!(update.model_id(), Some("p1"));

        let delete = GraphQLRequest::delete_mutation(&post(), Some(4));
        assert_eq!(delete.mutation_type(), Some(MutationType::Delete));
        assert_eq!(delete.version(), Some(4));
        assert!(delete.input().unwrap().get("title").is_none());
    }

    #[test]
    fn error_type_classification() {
        let unauthorized = GraphQLError::with_error_type("nope", "Unauthorized");
        assert_eq!(unauthorized.error_type(), Some(ServiceErrorType::Unauthorized));

        let conditional =
            GraphQLError::with_error_type("failed", "ConditionalCheckFailedException");
        assert_eq!(conditional.error_type(), Some(ServiceErrorType::ConditionalCheck));

        let other = GraphQLError::with_error_type("?", "Throttled");
        assert_eq!(
            other.error_type(),
            Some(ServiceErrorType::Unknown("Throttled".into()))
        );

        assert_eq!(GraphQLError::new("plain").error_type(), None);
    }

    #[test]
    fn conflict_error_carries_remote_model() {
        let error = GraphQLError::with_error_type("conflict", "ConflictUnhandled").with_data(json!({
            "id": "p1",
            "__typename": "Post",
            "title": "remote",
            "_version": 5,
        }));

        let remote = error.remote_model().unwrap().unwrap();
        assert_eq!(remote.sync_metadata.version, 5);
        assert_eq!(remote.model.field("title"), Some(&json!("remote")));
    }

    #[test]
    fn sync_query_next_page_keeps_filters() {
        let first = SyncQueryRequest::new("Post", 100, None);
        let second = first.next_page("token".into());
        assert_eq!(second.limit, 100);
        assert_eq!(second.next_token.as_deref(), Some("token"));
    }
}
