//! End-to-end conflict scenarios.
//!
//! Helpers that stage a local and a remote write against the same
//! document, plus the tests that drive them through full sync passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use docsync_codec::{doc, Document, Value};
use docsync_protocol::{ChangeEvent, ConflictHandler, ProtocolError, ProtocolResult};

use crate::fixtures::TestEngine;

/// Updates `id` locally with `$set: local_set`, then replaces it remotely
/// with `remote`, without running a pass in between.
pub fn stage_conflict(t: &TestEngine, id: impl Into<Value>, local_set: Document, remote: Document) {
    let id = id.into();
    let result = t
        .update_one(&t.namespace, &doc! { "_id" => id.clone() }, &doc! { "$set" => local_set }, false)
        .expect("Failed to update local document");
    assert_eq!(result.matched_count, 1, "Local document not found");
    t.remote_replace(id, remote);
}

/// A conflict handler that fails until it is switched on, then lets the
/// remote state win.
#[derive(Debug, Default)]
pub struct SwitchableHandler {
    enabled: AtomicBool,
}

impl SwitchableHandler {
    /// Creates a failing handler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lets later conflicts resolve.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }
}

impl ConflictHandler<Document> for SwitchableHandler {
    fn resolve_conflict(
        &self,
        _document_id: &Value,
        _local_event: &ChangeEvent<Document>,
        remote_event: &ChangeEvent<Document>,
    ) -> ProtocolResult<Option<Document>> {
        if self.enabled.load(Ordering::SeqCst) {
            Ok(remote_event.full_document.clone())
        } else {
            Err(ProtocolError::resolution("handler disabled"))
        }
    }
}
