// SPDX-License-Identifier: MIT OR Apache-2.0
//! Counting of in-flight request workers for the shutdown drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Cloneable handle counting live request workers.
///
/// The supervisor waits on this during shutdown: workers that finish inside
/// the grace window complete their replies, survivors are abandoned (their
/// deliveries are already acked).
#[derive(Debug, Clone, Default)]
pub struct InflightTracker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

impl InflightTracker {
    /// New tracker with zero in-flight workers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one worker; the returned guard deregisters on drop, panics
    /// included.
    pub fn start(&self) -> InflightGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of workers currently running.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Wait until every worker has finished, or the grace window elapses.
    /// Returns whether the drain completed.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.inner.idle.notified();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

/// RAII registration of one in-flight worker.
#[derive(Debug)]
pub struct InflightGuard {
    inner: Arc<Inner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
