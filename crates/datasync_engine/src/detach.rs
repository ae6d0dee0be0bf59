//! Handles to collaborators that may be torn down while work is in flight.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A shared reference that can be detached.
///
/// Background work holds a `Detachable` instead of an `Arc` so that teardown
/// can release the collaborator. Work that runs after teardown gets a
/// configuration error from [`get`](Self::get) instead of a dangling value.
pub struct Detachable<T: ?Sized> {
    name: &'static str,
    inner: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Detachable<T> {
    /// Creates an attached handle.
    pub fn new(name: &'static str, value: Arc<T>) -> Self {
        Self {
            name,
            inner: RwLock::new(Some(value)),
        }
    }

    /// Creates a handle with nothing attached yet.
    pub fn empty(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(None),
        }
    }

    /// Attaches a value, replacing any previous one.
    pub fn attach(&self, value: Arc<T>) {
        *self.inner.write() = Some(value);
    }

    /// Returns the attached value.
    pub fn get(&self) -> SyncResult<Arc<T>> {
        self.inner
            .read()
            .clone()
            .ok_or_else(|| SyncError::configuration(format!("{} is not available", self.name)))
    }

    /// Releases the attached value.
    pub fn detach(&self) {
        self.inner.write().take();
    }

    /// Returns true if a value is attached.
    pub fn is_attached(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl<T: ?Sized> std::fmt::Debug for Detachable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detachable")
            .field("name", &self.name)
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handles_fail_with_configuration_errors() {
        let handle: Detachable<str> = Detachable::new("storage adapter", Arc::from("db"));
        assert_eq!(&*handle.get().unwrap(), "db");

        handle.detach();
        let err = handle.get().unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "configuration error: storage adapter is not available"
        );
    }

    #[test]
    fn attach_later() {
        let handle: Detachable<u32> = Detachable::empty("api");
        assert!(!handle.is_attached());
        handle.attach(Arc::new(7));
        assert_eq!(*handle.get().unwrap(), 7);
    }
}
