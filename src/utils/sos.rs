//! Signal-of-Stop: cooperative shutdown shared by every long-running loop.
//!
//! Ctrl+C cancels the root signal; the server accept loops, the station
//! reconnect loop and the receiver wait loop all race their work against it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Cloneable cancellation token. Cancelling any clone stops them all.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Resolve once cancelled. Returns immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent
        // cancel() cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race `fut` against cancellation. `None` if cancellation won.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }

    /// Sleep for `dur`; `false` if cancelled first.
    pub async fn sleep(&self, dur: Duration) -> bool {
        self.select(tokio::time::sleep(dur)).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_all_clones() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            tokio::spawn(async move { sos.wait().await })
        };
        tokio::task::yield_now().await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(sos.clone().cancelled());
    }

    #[tokio::test]
    async fn select_after_cancel_returns_none() {
        let sos = SignalOfStop::new();
        sos.cancel();
        assert_eq!(sos.select(std::future::pending::<u8>()).await, None);
        assert!(!sos.sleep(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn select_returns_value_when_not_cancelled() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.select(async { 7 }).await, Some(7));
        assert!(sos.sleep(Duration::from_millis(1)).await);
    }
}
