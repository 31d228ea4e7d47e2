//! [`Dispatcher`] – single-writer hand-off from foreign threads.
//!
//! Session callbacks arrive on the session client's own thread.  They must
//! not touch device-visible state there; instead they [`Submitter::submit`]
//! a closure which the dispatcher's drain thread runs, one task at a time.
//!
//! # Guarantees
//!
//! | Property | Behaviour |
//! |---|---|
//! | Submission | Never blocks, never runs the task inline. |
//! | Ordering | FIFO per submitting thread; none across threads. |
//! | Failures | A task returning `Err` or panicking is logged and dropped; the loop keeps draining. |
//! | Shutdown | The in-flight task finishes; queued tasks are discarded. |
//!
//! # Example
//!
//! ```rust
//! use std::sync::mpsc;
//! use tangospec_middleware::Dispatcher;
//!
//! let dispatcher = Dispatcher::start("example").unwrap();
//! let (tx, rx) = mpsc::channel();
//! dispatcher.submit(move || {
//!     tx.send(42).ok();
//!     Ok(())
//! });
//! assert_eq!(rx.recv().unwrap(), 42);
//! dispatcher.shutdown();
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tangospec_types::BridgeError;
use tracing::{debug, warn};

/// How long the drain loop waits for work before re-checking the stop flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A unit of work run on the drain thread.
pub type Task = Box<dyn FnOnce() -> Result<(), BridgeError> + Send>;

// ─────────────────────────────────────────────────────────────────────────────
// Submitter
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap, cloneable handle for enqueueing tasks.
#[derive(Clone)]
pub struct Submitter {
    sender: mpsc::Sender<Task>,
    stop: Arc<AtomicBool>,
}

impl Submitter {
    /// Enqueue `task`.  Returns `false` once the dispatcher has stopped.
    pub fn submit(&self, task: impl FnOnce() -> Result<(), BridgeError> + Send + 'static) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return false;
        }
        self.sender.send(Box::new(task)).is_ok()
    }
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("stopped", &self.stop.load(Ordering::SeqCst))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the drain thread.  Each device instance owns one.
pub struct Dispatcher {
    name: String,
    submitter: Submitter,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
}

impl Dispatcher {
    /// Spawn the drain thread, named `dispatch-<name>`.
    pub fn start(name: &str) -> Result<Self, BridgeError> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = stop.clone();
        let loop_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("dispatch-{name}"))
            .spawn(move || drain(&loop_name, receiver, &loop_stop))
            .map_err(|e| BridgeError::Framework(format!("cannot start dispatcher {name}: {e}")))?;
        debug!(dispatcher = name, "dispatcher started");
        Ok(Self {
            name: name.to_string(),
            submitter: Submitter {
                sender,
                stop: stop.clone(),
            },
            stop,
            thread_id: Some(handle.thread().id()),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// See [`Submitter::submit`].
    pub fn submit(&self, task: impl FnOnce() -> Result<(), BridgeError> + Send + 'static) -> bool {
        self.submitter.submit(task)
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }

    /// Wait until every task submitted from this thread so far has run.
    ///
    /// Returns `false` on timeout or when the dispatcher has stopped.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (tx, rx) = mpsc::channel();
        let queued = self.submit(move || {
            let _ = tx.send(());
            Ok(())
        });
        queued && rx.recv_timeout(timeout).is_ok()
    }

    /// Stop the drain loop and join its thread.  Idempotent.
    ///
    /// Called from a task on the drain thread itself, the loop stops after
    /// that task without joining.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if Some(thread::current().id()) == self.thread_id {
            return;
        }
        if handle.join().is_err() {
            warn!(dispatcher = %self.name, "dispatcher thread panicked");
        }
        debug!(dispatcher = %self.name, "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(name: &str, receiver: mpsc::Receiver<Task>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(task) => run(name, task),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let discarded = receiver.try_iter().count();
    if discarded > 0 {
        debug!(dispatcher = name, discarded, "discarded queued tasks on shutdown");
    }
}

fn run(name: &str, task: Task) {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(dispatcher = name, error = %e, "dispatched task failed");
            debug!(dispatcher = name, error = ?e, "dispatched task failure details");
        }
        Err(_) => warn!(dispatcher = name, "dispatched task panicked"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_in_submission_order() {
        let dispatcher = Dispatcher::start("order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let s = seen.clone();
            dispatcher.submit(move || {
                s.lock().push(i);
                Ok(())
            });
        }
        assert!(dispatcher.flush(Duration::from_secs(2)));
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn submit_never_runs_inline() {
        let dispatcher = Dispatcher::start("inline").unwrap();
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        dispatcher.submit(move || {
            tx.send(thread::current().id()).ok();
            Ok(())
        });
        let ran_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn failing_and_panicking_tasks_do_not_stop_the_loop() {
        let dispatcher = Dispatcher::start("failures").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.submit(|| Err(BridgeError::Framework("boom".into())));
        dispatcher.submit(|| panic!("task panic"));
        let h = hits.clone();
        dispatcher.submit(move || {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(dispatcher.flush(Duration::from_secs(2)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let dispatcher = Dispatcher::start("stopped").unwrap();
        let submitter = dispatcher.submitter();
        dispatcher.shutdown();
        assert!(!dispatcher.is_running());
        assert!(!submitter.submit(|| Ok(())));
        dispatcher.shutdown();
    }

    #[test]
    fn shutdown_from_a_task_does_not_deadlock() {
        let dispatcher = Arc::new(Dispatcher::start("self-stop").unwrap());
        let (tx, rx) = mpsc::channel();
        let d = dispatcher.clone();
        dispatcher.submit(move || {
            d.shutdown();
            tx.send(()).ok();
            Ok(())
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!dispatcher.is_running());
    }
}
