//! A counting coordination primitive that lets many holders `enter()`
//! concurrently, and lets one waiter `wait()` until every *currently
//! entered* holder has dropped its guard.
//!
//! It is not a mutex — many appends proceed in parallel; it only gives the
//! disposer a way to know writes have drained.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    count: AtomicI64,
    notify: Notify,
}

/// A duplex latch. Clone freely; all clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct DuplexLatch {
    inner: Arc<Inner>,
}

/// Guard returned by [`DuplexLatch::enter`]. Calls `exit()` on drop.
#[must_use = "dropping this guard immediately exits the latch"]
pub struct LatchGuard {
    inner: Arc<Inner>,
}

impl DuplexLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the latch. Non-blocking. The returned guard must be held for
    /// the duration of the critical section; dropping it exits.
    pub fn enter(&self) -> LatchGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        LatchGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Suspends until all currently-entered guards have been dropped.
    /// `enter()` calls made after `wait()` returns do not extend a wait
    /// already in progress, nor a subsequent one: `wait()` only ever looks
    /// at the count sampled after each notification.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();

            if self.inner.count.load(Ordering::SeqCst) == 0 {
                return;
            }

            notified.await;
        }
    }
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        let previous = self.inner.count.fetch_sub(1, Ordering::SeqCst);

        if previous == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_with_no_holders() {
        let latch = DuplexLatch::new();
        tokio::time::timeout(Duration::from_millis(50), latch.wait())
            .await
            .expect("wait() should not block");
    }

    #[tokio::test]
    async fn wait_blocks_until_all_guards_drop() {
        let latch = DuplexLatch::new();
        let guard_a = latch.enter();
        let guard_b = latch.enter();

        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move {
                latch.wait().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard_a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "one guard still held");

        drop(guard_b);
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("wait() should unblock once all guards drop")
            .unwrap();
    }

    #[tokio::test]
    async fn enter_after_wait_started_does_not_extend_it() {
        let latch = DuplexLatch::new();
        let guard = latch.enter();

        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move {
                latch.wait().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("wait() should unblock")
            .unwrap();

        // Entering now is independent of the wait that already returned.
        let _late_guard = latch.enter();
    }
}
