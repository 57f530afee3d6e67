//! One-shot events and the two-phase shutdown latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A latching one-shot event: once fired it stays fired, and every past or
/// future waiter is released.
#[derive(Clone, Debug, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    fired: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event, releasing all waiters. Idempotent.
    pub fn fire(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Wait until the event has fired. Returns immediately if it already has.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before re-checking the flag, otherwise a
            // fire() between the check and the await would be missed.
            notified.as_mut().enable();
            if self.inner.fired.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Two-phase lifecycle latch: `start` marks that teardown has begun, `done`
/// marks that it has completed. Each phase is a one-shot [`Event`].
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    start: Event,
    done: Event,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.start.fire();
    }

    pub async fn wait_start(&self) {
        self.start.wait().await;
    }

    pub fn is_started(&self) -> bool {
        self.start.is_fired()
    }

    pub fn done(&self) {
        self.done.fire();
    }

    pub async fn wait_done(&self) {
        self.done.wait().await;
    }

    pub fn is_done(&self) -> bool {
        self.done.is_fired()
    }
}
