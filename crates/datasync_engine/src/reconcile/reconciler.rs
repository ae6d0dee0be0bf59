//! The reconciliation decision.

use datasync_protocol::{MutationEvent, MutationSync, SyncMetadata};

/// Why a remote change is not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A local change to the record has not been acknowledged yet.
    PendingLocalChange,
    /// The local copy is already at this version or newer.
    AlreadyApplied,
    /// A conflict was resolved in favour of the local change.
    ConflictKeptLocal,
}

/// What to do with a remote change.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Write the remote record locally.
    Apply,
    /// Discard the remote record.
    Drop(DropReason),
    /// A newer remote record arrived while a local change is pending.
    Conflict,
}

/// Decides what to do with `remote` given the local sync metadata of the
/// same record and the record's pending local mutation events.
///
/// - pending local changes win: the change is dropped, or reported as a
///   conflict when it is newer than both the local copy and the versions
///   the pending changes are based on
/// - without local metadata the change is applied
/// - otherwise it is applied only if its version is strictly newer
pub fn reconcile(
    remote: &MutationSync,
    local: Option<&SyncMetadata>,
    pending: &[MutationEvent],
) -> Disposition {
    let model = &remote.model;
    let mut has_pending = false;
    let mut base_version = local.map(|metadata| metadata.version);
    for event in pending
        .iter()
        .filter(|event| event.model_id == model.id && event.model_name == model.model_name)
    {
        has_pending = true;
        base_version = base_version.max(event.version);
    }

    if has_pending {
        return match base_version {
            Some(base) if remote.sync_metadata.version > base => Disposition::Conflict,
            _ => Disposition::Drop(DropReason::PendingLocalChange),
        };
    }
    match local.map(|metadata| metadata.version) {
        None => Disposition::Apply,
        Some(version) if remote.sync_metadata.version > version => Disposition::Apply,
        Some(_) => Disposition::Drop(DropReason::AlreadyApplied),
    }
}
