//! Counters describing what the sync passes have done.

use std::time::Instant;

/// Statistics about sync passes.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that ran to completion.
    pub passes_completed: u64,
    /// Passes aborted by an engine-level failure.
    pub passes_failed: u64,
    /// Remote changes written to the local store.
    pub remote_changes_applied: u64,
    /// Local writes acknowledged by the remote.
    pub local_writes_pushed: u64,
    /// Conflicts handed to a conflict handler.
    pub conflicts_encountered: u64,
    /// Documents paused after a failure.
    pub documents_paused: u64,
    /// When the last pass finished, successfully or not.
    pub last_pass_time: Option<Instant>,
    /// Message of the last engine-level failure.
    pub last_error: Option<String>,
}

/// Per-pass tallies merged into [`SyncStats`] when the pass ends.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PassTally {
    pub(crate) remote_changes_applied: u64,
    pub(crate) local_writes_pushed: u64,
    pub(crate) conflicts_encountered: u64,
    pub(crate) documents_paused: u64,
}

impl SyncStats {
    pub(crate) fn record_pass(&mut self, tally: PassTally, error: Option<String>) {
        match error {
            None => self.passes_completed += 1,
            Some(message) => {
                self.passes_failed += 1;
                self.last_error = Some(message);
            }
        }
        self.remote_changes_applied += tally.remote_changes_applied;
        self.local_writes_pushed += tally.local_writes_pushed;
        self.conflicts_encountered += tally.conflicts_encountered;
        self.documents_paused += tally.documents_paused;
        self.last_pass_time = Some(Instant::now());
    }
}
