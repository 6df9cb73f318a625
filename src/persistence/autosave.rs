//! Cancelable, trailing-edge debounce task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A single pending job that is pushed back by every `schedule` call.
///
/// Each `schedule` cancels whatever was pending and arms a new timer, so a burst
/// of calls inside the delay runs the job once, `delay` after the last call.
pub struct DebounceTask {
    runtime: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
    fired: Arc<AtomicUsize>,
}

impl DebounceTask {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            pending: Mutex::new(None),
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A task bound to the runtime of the caller, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let fired = self.fired.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fired.fetch_add(1, Ordering::SeqCst);
            job();
        });

        let previous = self
            .pending
            .lock()
            .expect("debounce lock poisoned")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancel the pending job. Returns whether one was still waiting.
    pub fn cancel(&self) -> bool {
        let pending = self.pending.lock().expect("debounce lock poisoned").take();
        match pending {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .expect("debounce lock poisoned")
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// How many times a job has fired.
    pub fn fire_count(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for DebounceTask {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(handle) = pending.take() {
                handle.abort();
            }
        }
    }
}
