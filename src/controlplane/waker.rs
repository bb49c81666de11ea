//! Scanner wake primitive
//!
//! A coalescing signal with a single consumer: any number of `wake` calls
//! made while the scanner is busy collapse into one pending rescan.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Cloneable handle that requests a rescan
#[derive(Debug, Clone, Default)]
pub struct Waker {
    notify: Arc<Notify>,
}

impl Waker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a rescan; a no-op if one is already pending
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Request a rescan after `delay`, unless `cancel` fires first
    pub fn wake_after(&self, delay: Duration, cancel: CancellationToken) {
        let waker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => waker.wake(),
            }
        });
    }

    /// Wait for the next wake request
    pub async fn woken(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_wakes_coalesce() {
        let waker = Waker::new();
        waker.wake();
        waker.wake();
        waker.wake();

        // One stored permit
        let mut first = task::spawn(waker.woken());
        assert_ready!(first.poll());
        let mut second = task::spawn(waker.woken());
        assert_pending!(second.poll());
    }

    #[test]
    fn test_wake_releases_waiting_scanner() {
        let waker = Waker::new();
        let mut woken = task::spawn(waker.woken());
        assert_pending!(woken.poll());

        waker.clone().wake();
        assert!(woken.is_woken());
        assert_ready!(woken.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_after() {
        let waker = Waker::new();
        waker.wake_after(Duration::from_secs(10), CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(11), waker.woken())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_after_cancelled() {
        let waker = Waker::new();
        let cancel = CancellationToken::new();
        waker.wake_after(Duration::from_secs(10), cancel.clone());
        cancel.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(20), waker.woken())
            .await
            .is_err());
    }
}
