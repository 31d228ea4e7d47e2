//! RAII handle for a registered callback.

use parking_lot::Mutex;

/// Keeps a callback registered with a session element.
///
/// Dropping the guard (or calling [`Subscription::cancel`]) removes the
/// callback; no further invocations start after that point.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A subscription with nothing to undo.
    pub fn noop() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.get_mut().take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.get_mut().take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drop_runs_cancel_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = Subscription::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_cancel_does_not_double_fire() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        Subscription::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriptions_can_be_shared_across_threads() {
        fn shared<T: Send + Sync>(_: &T) {}
        let sub = Subscription::new(|| {});
        shared(&sub);
        let link = Arc::new(sub);
        let held = link.clone();
        std::thread::spawn(move || drop(held)).join().unwrap();
        assert_eq!(Arc::strong_count(&link), 1);
    }
}
