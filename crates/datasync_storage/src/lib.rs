//! # datasync storage
//!
//! The local-storage capability consumed by the datasync engine.
//!
//! The relational storage engine itself lives elsewhere; this crate defines
//! the narrow async interface the sync core needs (save, query with a
//! predicate and an ordering, delete) and ships an in-memory implementation
//! used by tests and ephemeral stores.
//!
//! ## Key Invariants
//!
//! - Mutation events can be filtered on their `in_process` flag
//! - Mutation events can be ordered by `created_at`; equal timestamps keep
//!   insertion order
//! - Deleting a record that does not exist is not an error
//! - A closed store fails every call with [`StorageError::Closed`]

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod error;
mod memory;

pub use adapter::{MutationEventPredicate, SortOrder, StorageAdapter};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorage;
