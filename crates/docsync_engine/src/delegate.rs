//! Application callbacks for change events and errors.
//!
//! Callbacks run on the thread that produced the event, after the engine
//! has released its bookkeeping lock. A panicking callback is caught and
//! logged; it never unwinds into the engine.

use std::panic::{catch_unwind, AssertUnwindSafe};

use docsync_codec::Value;
use docsync_protocol::ChangeEvent;
use tracing::error;

use crate::error::SyncError;

/// Receives every change event that becomes observable in a namespace.
pub trait ChangeEventListener: Send + Sync {
    /// Called with the affected `_id` and the event.
    fn on_event(&self, document_id: &Value, event: &ChangeEvent);
}

impl<F> ChangeEventListener for F
where
    F: Fn(&Value, &ChangeEvent) + Send + Sync,
{
    fn on_event(&self, document_id: &Value, event: &ChangeEvent) {
        self(document_id, event);
    }
}

/// Receives errors raised while synchronizing.
///
/// `document_id` is `None` for engine-level failures.
pub trait ErrorListener: Send + Sync {
    /// Called with the error and the affected `_id`, if any.
    fn on_error(&self, error: &SyncError, document_id: Option<&Value>);
}

impl<F> ErrorListener for F
where
    F: Fn(&SyncError, Option<&Value>) + Send + Sync,
{
    fn on_error(&self, error: &SyncError, document_id: Option<&Value>) {
        self(error, document_id);
    }
}

/// Delivers `event` to `listener`, swallowing panics.
pub(crate) fn dispatch_event(listener: &dyn ChangeEventListener, event: &ChangeEvent) {
    let document_id = event.document_id().cloned().unwrap_or(Value::Null);
    let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(&document_id, event)));
    if outcome.is_err() {
        error!(ns = %event.namespace, document_id = %document_id, "change event listener panicked");
    }
}

/// Delivers `error` to `listener`, swallowing panics.
pub(crate) fn dispatch_error(listener: &dyn ErrorListener, sync_error: &SyncError, document_id: Option<&Value>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_error(sync_error, document_id)));
    if outcome.is_err() {
        error!(error = %sync_error, "error listener panicked");
    }
}
