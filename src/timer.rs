//! One-shot timer service.
//!
//! Entities never hold timer tasks directly; they hold [`TimerToken`]s into
//! a shared [`TimerService`], which makes shutdown a plain token sweep.

use parking_lot::Mutex;
use slotmap::SlotMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

slotmap::new_key_type! {
    /// Handle to a scheduled timer.
    pub struct TimerToken;
}

#[derive(Clone, Default)]
pub struct TimerService {
    inner: Arc<Mutex<SlotMap<TimerToken, JoinHandle<()>>>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to run once after `delay`.
    ///
    /// The token stays valid until the task finishes, so cancelling also
    /// stops a long-running callback (the 2xx retransmission loop relies
    /// on this). Cancelling a finished timer is a no-op.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerToken
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = self.inner.clone();

        self.inner.lock().insert_with_key(move |token| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                task.await;
                inner.lock().remove(token);
            })
        })
    }

    pub fn cancel(&self, token: TimerToken) {
        if let Some(handle) = self.inner.lock().remove(token) {
            handle.abort();
        }
    }

    /// Cancel every outstanding timer.
    pub fn cancel_all(&self) {
        let handles: Vec<_> = {
            let mut map = self.inner.lock();
            map.drain().map(|(_, handle)| handle).collect()
        };

        for handle in handles {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn armed(&self) -> usize {
        self.inner.lock().len()
    }
}
