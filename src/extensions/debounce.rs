//! Trailing-edge debouncing on the local task set.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Delivers only the last payload of a burst, once `interval` has passed
/// without a new call. A zero interval delivers immediately.
pub struct Debouncer<T> {
    interval: Duration,
    sink: Rc<dyn Fn(T)>,
    pending: RefCell<Option<JoinHandle<()>>>,
}

impl<T: 'static> Debouncer<T> {
    pub fn new<F>(interval: Duration, sink: F) -> Self
    where
        F: Fn(T) + 'static,
    {
        Self {
            interval,
            sink: Rc::new(sink),
            pending: RefCell::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Replace any pending payload and restart the quiet period.
    pub fn call(&self, payload: T) {
        self.cancel();

        if self.interval.is_zero() {
            (self.sink)(payload);
            return;
        }

        let sink = Rc::clone(&self.sink);
        let interval = self.interval;
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(interval).await;
            sink(payload);
        });
        *self.pending.borrow_mut() = Some(task);
    }

    /// Drop the pending payload, if any.
    pub fn cancel(&self) {
        if let Some(task) = self.pending.borrow_mut().take() {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .borrow()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(task) = self.pending.get_mut().take() {
            task.abort();
        }
    }
}
