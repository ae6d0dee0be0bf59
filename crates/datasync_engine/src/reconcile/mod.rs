//! Reconciliation of remote changes with local state.
//!
//! ## Key Invariants
//!
//! - Changes of one model are reconciled one at a time, in arrival order
//! - Different models reconcile independently
//! - A remote change never overwrites a record with pending local changes
//!   unless the conflict handler says so
//! - Live changes received before `start` are buffered, not lost

mod apply;
mod initial_sync;
mod queue;
mod reconciler;
mod scheduler;

pub use apply::ReconcileOutcome;
pub use queue::ModelReconciliationQueue;
pub use reconciler::{reconcile, Disposition, DropReason};
pub use scheduler::{ModelStatus, ReconciliationScheduler};

pub(crate) use apply::apply_remote;
