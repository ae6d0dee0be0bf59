//! # Datasync Engine
//!
//! Offline-first mutation sync for datasync.
//!
//! This crate provides:
//! - Mutation event ingestion with buffer-then-live delivery
//! - An outgoing mutation queue (the outbox) driven by a state machine
//! - Per-model reconciliation of remote changes
//! - Conflict and error handling for rejected mutations
//! - Lifecycle events for observers
//!
//! ## Architecture
//!
//! Local writes are persisted as mutation events by the
//! [`MutationEventIngester`] and published to the [`OutgoingMutationQueue`],
//! which delivers them one at a time through a [`GraphQLApi`]. Remote
//! changes arrive per model through subscriptions and the initial sync, and
//! are reconciled against pending local changes by the
//! [`ReconciliationScheduler`]. [`SyncEngine`] wires the pieces together.
//!
//! ## Key Invariants
//!
//! - A local write is durable before it is published
//! - At most one mutation is in flight, and mutations leave in creation order
//! - A delivered mutation is removed from storage before it is reported
//! - Pending local changes are never silently overwritten by remote ones
//! - One model's failure never blocks another model

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api;
mod config;
mod detach;
mod engine;
mod error;
mod events;
mod ingester;
mod lane;
mod outbox;
mod publisher;
mod reconcile;

pub use api::{
    ApiResponse, ConnectionState, GraphQLApi, MockApi, SubscriptionEvent, SubscriptionStream,
};
pub use config::{
    ConflictData, ConflictHandler, ConflictOrigin, ConflictResolution, DefaultConflictHandler,
    ErrorHandler, RetryConfig, SyncConfig, SyncExpression,
};
pub use detach::Detachable;
pub use engine::SyncEngine;
pub use error::{ApiError, ApiResult, SyncError, SyncResult};
pub use events::{DisconnectReason, SyncEvent, SyncEventHub};
pub use ingester::{MutationEventIngester, MutationEventSource};
pub use outbox::{
    build_request, resolve, DeliveryOperation, OutboxAction, OutboxState, OutgoingMutationQueue,
};
pub use publisher::BufferedPublisher;
pub use reconcile::{
    reconcile, Disposition, DropReason, ModelReconciliationQueue, ModelStatus, ReconcileOutcome,
    ReconciliationScheduler,
};
