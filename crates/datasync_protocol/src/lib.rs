//! # datasync protocol
//!
//! Data model shared by the datasync storage and engine crates.
//!
//! This crate provides:
//! - `MutationEvent` for durably queued local writes
//! - `AnyModel`, `SyncMetadata` and `MutationSync` for the reconciliation path
//! - GraphQL request, response and error types consumed by the remote API seam
//! - Service error classification (`ServiceErrorType`)
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod graphql;
mod model;
mod mutation;

pub use error::{ProtocolError, ProtocolResult};
pub use graphql::{
    GraphQLError, GraphQLOperation, GraphQLRequest, GraphQLResponse, PaginatedList,
    ServiceErrorType, SubscriptionRequest, SyncQueryRequest,
};
pub use model::{AnyModel, ModelSyncMetadata, MutationSync, SyncMetadata};
pub use mutation::{MutationEvent, MutationType};
