//! Sync decisions and the reasons behind them.

use std::fmt;

use docsync_codec::Value;
use docsync_protocol::{MongoNamespace, OperationType};
use tracing::debug;

/// Name of the remote-to-local phase in decision logs.
pub(crate) const R2L: &str = "sync_remote_to_local";
/// Name of the local-to-remote phase in decision logs.
pub(crate) const L2R: &str = "sync_local_to_remote";

/// What the engine does with one event for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    /// Adopt the remote document and its version.
    ApplyFromRemote,
    /// Adopt the remote document and stamp it with a fresh version.
    ApplyAndVersionFromRemote,
    /// Hand both sides to the conflict handler.
    Conflict,
    /// Apply a remote delete.
    DeleteLocal,
    /// Delete the local copy and stop synchronizing it.
    DeleteLocalAndDesync,
    /// Ignore the event.
    DropEvent,
    /// Ignore the event and stop synchronizing the document.
    DropEventAndDesync,
    /// Ignore the event and pause the document.
    DropEventAndPause,
    /// Fetch the latest remote document and decide again.
    RemoteFind,
    /// Retry on the next pass.
    Wait,
}

impl SyncAction {
    /// Snake-case name used as a log field.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::ApplyFromRemote => "apply_from_remote",
            SyncAction::ApplyAndVersionFromRemote => "apply_and_version_from_remote",
            SyncAction::Conflict => "conflict",
            SyncAction::DeleteLocal => "delete_local",
            SyncAction::DeleteLocalAndDesync => "delete_local_and_desync",
            SyncAction::DropEvent => "drop_event",
            SyncAction::DropEventAndDesync => "drop_event_and_desync",
            SyncAction::DropEventAndPause => "drop_event_and_pause",
            SyncAction::RemoteFind => "remote_find",
            SyncAction::Wait => "wait",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SyncAction::ApplyFromRemote | SyncAction::ApplyAndVersionFromRemote => {
                "applying changes from the remote document"
            }
            SyncAction::Conflict => "raising conflict",
            SyncAction::DeleteLocal => "applying the remote delete",
            SyncAction::DeleteLocalAndDesync => "deleting and desyncing the document",
            SyncAction::DropEvent => "dropping the event",
            SyncAction::DropEventAndDesync => "dropping the event and desyncing the document",
            SyncAction::DropEventAndPause => "dropping the event and pausing the document",
            SyncAction::RemoteFind => "re-checking against remote collection",
            SyncAction::Wait => "waiting until next pass",
        };
        f.write_str(text)
    }
}

/// Why a [`SyncAction`] was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// No local write is pending, so the remote document wins.
    ApplyFromRemote,
    /// The remote version field is malformed.
    CannotParseRemoteVersion,
    /// Remote delete with nothing pending locally.
    DeleteFromRemote,
    /// The pending delete reached the remote.
    DocumentDeleted,
    /// The remote rejected a pending insert with `E11000`.
    DuplicateKeyException,
    /// One side has no version.
    EmptyVersion,
    /// A pending update changes nothing.
    EmptyUpdateDescription,
    /// A pending delete failed remotely.
    ExceptionOnDelete(String),
    /// A pending insert failed remotely.
    ExceptionOnInsert(String),
    /// A pending replace failed remotely.
    ExceptionOnReplace(String),
    /// A pending update failed remotely.
    ExceptionOnUpdate(String),
    /// A pending write refers to a local document that is gone.
    ExpectedLocalDocumentToExist,
    /// The remote version comes from another document instance.
    InstanceIdMismatch,
    /// Remote delete while a write is pending.
    PendingWriteDelete,
    /// One side has no version while a write is pending.
    PendingWriteEmptyVersion,
    /// The remote event echoes a write made by this engine.
    ProbablyGeneratedByUs,
    /// The remote lookup found no document.
    RemoteFindDeletedDoc,
    /// The remote lookup failed.
    RemoteFindFailed,
    /// The remote lookup found a different document.
    RemoteFindReplacedDoc,
    /// The remote content changed without a version bump.
    RemoteUpdateWithoutVersion,
    /// The document was written at the current logical time.
    SimultaneousWrites,
    /// The remote counter is ahead of the pending write.
    StaleLocalWrite,
    /// The remote event is older than what is known locally.
    StaleEvent,
    /// The last seen version uses an unsupported protocol.
    StaleProtocolVersion(i64),
    /// The event has an operation type the engine cannot apply.
    UnknownOptype(OperationType),
    /// The remote version uses an unsupported protocol.
    UnknownRemoteProtocolVersion(i64),
    /// A versioned delete matched nothing but the document exists.
    VersionDifferentDeletedDoc,
    /// A versioned replace matched nothing.
    VersionDifferentReplacedDoc,
    /// A versioned update matched nothing.
    VersionDifferentUpdatedDoc,
}

impl fmt::Display for SyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMessage::ApplyFromRemote => {
                f.write_str("replacing local with remote document with new version as there are no local pending writes")
            }
            SyncMessage::CannotParseRemoteVersion => {
                f.write_str("got a remote document that could not have its version info parsed")
            }
            SyncMessage::DeleteFromRemote => f.write_str("deleting local as there are no local pending writes"),
            SyncMessage::DocumentDeleted => f.write_str("remote document successfully deleted"),
            SyncMessage::DuplicateKeyException => f.write_str("duplicate key exception on insert"),
            SyncMessage::EmptyVersion => f.write_str("remote or local have an empty version"),
            SyncMessage::EmptyUpdateDescription => {
                f.write_str("local change event update description is empty for UPDATE")
            }
            SyncMessage::ExceptionOnDelete(e) => write!(f, "exception on delete: {e}"),
            SyncMessage::ExceptionOnInsert(e) => write!(f, "exception on insert: {e}"),
            SyncMessage::ExceptionOnReplace(e) => write!(f, "exception on replace: {e}"),
            SyncMessage::ExceptionOnUpdate(e) => write!(f, "exception on update: {e}"),
            SyncMessage::ExpectedLocalDocumentToExist => {
                f.write_str("expected document to exist for local change event")
            }
            SyncMessage::InstanceIdMismatch => {
                f.write_str("remote event created by different device from last seen event")
            }
            SyncMessage::PendingWriteDelete => f.write_str("remote delete but a write is pending"),
            SyncMessage::PendingWriteEmptyVersion => {
                f.write_str("remote or local have an empty version but a write is pending")
            }
            SyncMessage::ProbablyGeneratedByUs => f.write_str("remote change event was generated by us"),
            SyncMessage::RemoteFindDeletedDoc => f.write_str(
                "remote event generated by a different client and latest document lookup indicates a remote delete occurred",
            ),
            SyncMessage::RemoteFindFailed => {
                f.write_str("failed to retrieve latest version of document from remote database")
            }
            SyncMessage::RemoteFindReplacedDoc => {
                f.write_str("latest document lookup indicates a remote replace occurred")
            }
            SyncMessage::RemoteUpdateWithoutVersion => {
                f.write_str("remote document changed but version was unmodified")
            }
            SyncMessage::SimultaneousWrites => f.write_str("has multiple events at same logical time"),
            SyncMessage::StaleLocalWrite => {
                f.write_str("remote event version has higher counter than local pending write")
            }
            SyncMessage::StaleEvent => f.write_str("remote change event is stale"),
            SyncMessage::StaleProtocolVersion(v) => write!(
                f,
                "last seen change event has an unsupported synchronization protocol version {v}"
            ),
            SyncMessage::UnknownOptype(op) => write!(f, "unknown operation type: {op}"),
            SyncMessage::UnknownRemoteProtocolVersion(v) => write!(
                f,
                "got a remote document with an unsupported synchronization protocol version {v}"
            ),
            SyncMessage::VersionDifferentDeletedDoc => f.write_str("version different on removed document"),
            SyncMessage::VersionDifferentReplacedDoc => {
                f.write_str("version different on replaced document or document was deleted")
            }
            SyncMessage::VersionDifferentUpdatedDoc => {
                f.write_str("version different on updated document or document was deleted")
            }
        }
    }
}

/// A decision for one document: the action and its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// What to do.
    pub action: SyncAction,
    /// Why.
    pub message: SyncMessage,
}

impl Decision {
    pub(crate) fn new(action: SyncAction, message: SyncMessage) -> Self {
        Self { action, message }
    }
}

/// Logs one decision at debug level.
pub(crate) fn log_decision(
    logical_time: i64,
    caller: &str,
    namespace: &MongoNamespace,
    document_id: &Value,
    decision: &Decision,
) {
    debug!(
        t = logical_time,
        caller,
        ns = %namespace,
        document_id = %document_id,
        action = decision.action.as_str(),
        "{}; {}",
        decision.message,
        decision.action
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions() {
        assert_eq!(SyncAction::Wait.to_string(), "waiting until next pass");
        assert_eq!(
            SyncAction::ApplyAndVersionFromRemote.to_string(),
            SyncAction::ApplyFromRemote.to_string()
        );
        assert_eq!(
            SyncMessage::UnknownOptype(OperationType::Unknown).to_string(),
            "unknown operation type: unknown"
        );
        assert_eq!(
            SyncMessage::ExceptionOnInsert("boom".into()).to_string(),
            "exception on insert: boom"
        );
        assert!(SyncMessage::StaleProtocolVersion(2).to_string().ends_with('2'));
    }

    #[test]
    fn action_names_are_distinct() {
        let all = [
            SyncAction::ApplyFromRemote,
            SyncAction::ApplyAndVersionFromRemote,
            SyncAction::Conflict,
            SyncAction::DeleteLocal,
            SyncAction::DeleteLocalAndDesync,
            SyncAction::DropEvent,
            SyncAction::DropEventAndDesync,
            SyncAction::DropEventAndPause,
            SyncAction::RemoteFind,
            SyncAction::Wait,
        ];
        let names: std::collections::HashSet<_> = all.iter().map(SyncAction::as_str).collect();
        assert_eq!(names.len(), all.len());
    }
}
