//! Background thread that runs sync passes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{SyncError, SyncResult};

#[derive(Default)]
struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Signal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

/// A worker thread repeating one step until stopped.
pub(crate) struct Worker {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a thread that calls `step` until it returns `None` or the
    /// worker is stopped, sleeping for the returned duration in between.
    pub(crate) fn spawn<F>(mut step: F) -> SyncResult<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let thread_signal = signal.clone();
        let handle = thread::Builder::new()
            .name("docsync-worker".to_string())
            .spawn(move || {
                loop {
                    if *thread_signal.stopped.lock() {
                        break;
                    }
                    let Some(sleep) = step() else {
                        break;
                    };
                    let mut stopped = thread_signal.stopped.lock();
                    if *stopped {
                        break;
                    }
                    thread_signal.wake.wait_for(&mut stopped, sleep);
                }
                debug!("sync worker exiting");
            })
            .map_err(|e| SyncError::fatal(format!("failed to spawn sync worker: {e}")))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals the thread and waits for it, unless called from it.
    pub(crate) fn stop(mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("sync worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.signal.stop();
    }
}
