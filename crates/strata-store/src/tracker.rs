// ABOUTME: Pending-write counter owned by one store adapter, with observer notification.
// ABOUTME: Writes hold a PendingWrite guard so the counter always drops back, even on failure.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;

/// Callback receiving the new pending-write count after every change.
pub type WriteObserver = Arc<dyn Fn(usize) + Send + Sync>;

/// Counts writes that have been issued but not yet settled. The count is
/// published on a watch channel so the barrier can wait for zero.
pub struct WriteTracker {
    count: watch::Sender<usize>,
    observers: RwLock<Vec<WriteObserver>>,
}

impl Default for WriteTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Current number of unsettled writes.
    pub fn pending(&self) -> usize {
        *self.count.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    pub fn register_observer(&self, observer: WriteObserver) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Record a newly issued write. The returned guard settles it on drop.
    pub fn begin(self: &Arc<Self>) -> PendingWrite {
        let mut now = 0;
        self.count.send_modify(|c| {
            *c += 1;
            now = *c;
        });
        self.notify(now);
        PendingWrite {
            tracker: Arc::clone(self),
        }
    }

    fn settle(&self) {
        let mut now = 0;
        self.count.send_modify(|c| {
            debug_assert!(*c > 0, "pending write counter underflow");
            *c = c.saturating_sub(1);
            now = *c;
        });
        self.notify(now);
    }

    fn notify(&self, value: usize) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(value);
        }
    }
}

/// An outstanding write. Dropping it decrements the counter.
pub struct PendingWrite {
    tracker: Arc<WriteTracker>,
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.tracker.settle();
    }
}
