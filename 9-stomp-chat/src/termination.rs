use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// Shared "stop now" signal for every loop of a session.
///
/// Blocking loops poll [`Termination::is_set`]; async loops can also await
/// [`Termination::triggered`] to wake as soon as it flips. Once set it stays
/// set.
#[derive(Debug, Clone, Default)]
pub struct Termination {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn triggered(&self) {
        loop {
            // Register before checking so a trigger in between is not missed.
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}
