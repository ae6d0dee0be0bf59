//! Error types for the sync engine.

use datasync_protocol::{GraphQLError, ProtocolError, ServiceErrorType};
use datasync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for remote API calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors reported by the remote API seam.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Network or transport failure.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the request can be retried.
        retryable: bool,
    },

    /// The service answered with a non-2xx status.
    #[error("HTTP status {status}: {message}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Status text or body excerpt.
        message: String,
    },

    /// The service processed the request and returned GraphQL errors.
    #[error("GraphQL request failed: {}", first_message(.0))]
    GraphQL(Vec<GraphQLError>),

    /// The caller is not authorized.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The operation is disabled for the model.
    #[error("operation disabled: {0}")]
    OperationDisabled(String),

    /// The request was cancelled before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// Anything else.
    #[error("unknown API error: {0}")]
    Unknown(String),
}

fn first_message(errors: &[GraphQLError]) -> &str {
    errors.first().map(|e| e.message.as_str()).unwrap_or("no error details")
}

impl ApiError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Maps a non-2xx HTTP status to a typed error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(message.into()),
            _ => Self::HttpStatus {
                status,
                message: message.into(),
            },
        }
    }

    /// Returns true if the same request may succeed when sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network { retryable, .. } => *retryable,
            ApiError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Returns the service error type of the first GraphQL error.
    pub fn service_error_type(&self) -> Option<ServiceErrorType> {
        match self {
            ApiError::GraphQL(errors) => errors.first().and_then(GraphQLError::error_type),
            _ => None,
        }
    }

    /// Returns true for authorization failures, however they were reported.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
            || self.service_error_type() == Some(ServiceErrorType::Unauthorized)
    }

    /// Returns true for disabled operations, however they were reported.
    pub fn is_operation_disabled(&self) -> bool {
        matches!(self, ApiError::OperationDisabled(_))
            || self.service_error_type() == Some(ServiceErrorType::OperationDisabled)
    }
}

/// Errors that can occur in the sync engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// A required collaborator is missing or has been torn down.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The remote API failed.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// A persisted event or remote payload could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(#[from] ProtocolError),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A conflict could not be resolved.
    #[error("unresolved conflict for {model_name} {model_id}")]
    Conflict {
        /// Model name.
        model_name: String,
        /// Primary key.
        model_id: String,
    },

    /// A local write was rejected.
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),
}

impl From<StorageError> for SyncError {
    fn from(error: StorageError) -> Self {
        if error.is_unreachable() {
            SyncError::Configuration(format!("storage is unreachable: {error}"))
        } else {
            SyncError::Storage(error)
        }
    }
}

impl SyncError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Api(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for errors that make the affected queue unusable.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SyncError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ApiError::network_retryable("connection lost").is_retryable());
        assert!(!ApiError::network_fatal("invalid certificate").is_retryable());
        assert!(ApiError::from_status(503, "unavailable").is_retryable());
        assert!(ApiError::from_status(429, "slow down").is_retryable());
        assert!(!ApiError::from_status(400, "bad request").is_retryable());
        assert!(!ApiError::Cancelled.is_retryable());
        assert!(SyncError::from(ApiError::network_retryable("x")).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert!(ApiError::from_status(401, "expired").is_unauthorized());
        assert!(ApiError::from_status(403, "denied").is_unauthorized());
        assert_eq!(
            ApiError::from_status(500, "boom"),
            ApiError::HttpStatus {
                status: 500,
                message: "boom".into()
            }
        );
    }

    #[test]
    fn graphql_classification() {
        let unauthorized =
            ApiError::GraphQL(vec![GraphQLError::with_error_type("no", "Unauthorized")]);
        assert!(unauthorized.is_unauthorized());
        assert!(!unauthorized.is_operation_disabled());

        let disabled =
            ApiError::GraphQL(vec![GraphQLError::with_error_type("off", "OperationDisabled")]);
        assert!(disabled.is_operation_disabled());
        assert_eq!(
            disabled.to_string(),
            "GraphQL request failed: off"
        );
    }

    #[test]
    fn closed_storage_is_a_configuration_error() {
        assert!(SyncError::from(StorageError::Closed).is_configuration());
        assert_eq!(
            SyncError::from(StorageError::Backend("io".into())),
            SyncError::Storage(StorageError::Backend("io".into()))
        );
    }
}
