//! Conflict resolution policies.

use docsync_codec::Value;

use crate::change_event::ChangeEvent;
use crate::error::ProtocolResult;

/// Decides the outcome when a local pending write and a remote change
/// collide on the same document.
///
/// The returned document becomes the agreed state on both sides; `None`
/// means the document is deleted.
pub trait ConflictHandler<T>: Send + Sync {
    /// Resolves a conflict on `document_id`.
    fn resolve_conflict(
        &self,
        document_id: &Value,
        local_event: &ChangeEvent<T>,
        remote_event: &ChangeEvent<T>,
    ) -> ProtocolResult<Option<T>>;
}

impl<T, F> ConflictHandler<T> for F
where
    F: Fn(&Value, &ChangeEvent<T>, &ChangeEvent<T>) -> ProtocolResult<Option<T>> + Send + Sync,
{
    fn resolve_conflict(
        &self,
        document_id: &Value,
        local_event: &ChangeEvent<T>,
        remote_event: &ChangeEvent<T>,
    ) -> ProtocolResult<Option<T>> {
        self(document_id, local_event, remote_event)
    }
}

/// Always adopts the remote state, discarding the local write.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl<T: Clone + Send + Sync> ConflictHandler<T> for RemoteWins {
    fn resolve_conflict(
        &self,
        _document_id: &Value,
        _local_event: &ChangeEvent<T>,
        remote_event: &ChangeEvent<T>,
    ) -> ProtocolResult<Option<T>> {
        Ok(remote_event.full_document.clone())
    }
}

/// Always keeps the local state, overwriting the remote one.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl<T: Clone + Send + Sync> ConflictHandler<T> for LocalWins {
    fn resolve_conflict(
        &self,
        _document_id: &Value,
        local_event: &ChangeEvent<T>,
        _remote_event: &ChangeEvent<T>,
    ) -> ProtocolResult<Option<T>> {
        Ok(local_event.full_document.clone())
    }
}
