use crate::common::ConversionResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

struct Slot {
    pending: Option<ConversionResult>,
    closed: bool,
}

/// Single-slot, latest-wins relay between the capture path and the
/// analysis path.
///
/// `submit` never blocks: if an unconsumed result is pending, the newer
/// one overwrites it and the drop counter increments. `take` suspends
/// until a result arrives or the router closes. Freshness is traded for
/// completeness on purpose; the capture device is never made to wait on
/// a slow analyzer.
pub struct FrameRouter {
    slot: Mutex<Slot>,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameRouter {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // The critical section never panics; recover rather than poison-cascade.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capture-rate path. Never blocks; overwrites any unconsumed result.
    /// Submissions after `close` are discarded.
    pub fn submit(&self, result: ConversionResult) {
        {
            let mut slot = self.lock();
            if slot.closed {
                return;
            }
            if let Some(stale) = slot.pending.replace(result) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(sequence = stale.sequence(), "overwrote unconsumed frame");
            }
        }
        self.notify.notify_one();
    }

    /// Analysis-rate path. Suspends until a result is available; returns
    /// `None` once the router is closed and drained.
    pub async fn take(&self) -> Option<ConversionResult> {
        loop {
            let notified = self.notify.notified();
            {
                let mut slot = self.lock();
                if let Some(result) = slot.pending.take() {
                    return Some(result);
                }
                if slot.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Unblocks any suspended `take` promptly. A result already pending
    /// is still delivered before the end-of-stream signal.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        // notify_waiters stores no permit, cover a taker between its
        // slot check and its first poll of notified().
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Frames overwritten before anyone took them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::RgbImage;
    use std::sync::Arc;
    use std::time::Duration;

    fn result(sequence: u64) -> ConversionResult {
        ConversionResult::new(RgbImage::new(2, 2), sequence, sequence * 1_000, Utc::now())
    }

    #[tokio::test]
    async fn take_returns_the_single_submitted_result() {
        let router = FrameRouter::new();
        router.submit(result(1));
        let taken = router.take().await.unwrap();
        assert_eq!(taken.sequence(), 1);
        assert_eq!(router.dropped(), 0);
    }

    #[tokio::test]
    async fn latest_wins_under_repeated_submits() {
        let router = FrameRouter::new();
        for seq in 1..=5 {
            router.submit(result(seq));
        }
        let taken = router.take().await.unwrap();
        assert_eq!(taken.sequence(), 5);
        assert_eq!(router.dropped(), 4);
    }

    #[tokio::test]
    async fn close_unblocks_a_suspended_take() {
        let router = Arc::new(FrameRouter::new());
        let taker = {
            let router = router.clone();
            tokio::spawn(async move { router.take().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        router.close();
        let taken = tokio::time::timeout(Duration::from_millis(100), taker)
            .await
            .expect("take did not unblock after close")
            .unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn pending_result_is_delivered_before_end_of_stream() {
        let router = FrameRouter::new();
        router.submit(result(7));
        router.close();
        assert_eq!(router.take().await.unwrap().sequence(), 7);
        assert!(router.take().await.is_none());
    }

    #[tokio::test]
    async fn submit_after_close_is_discarded() {
        let router = FrameRouter::new();
        assert!(!router.is_closed());
        router.close();
        assert!(router.is_closed());
        router.submit(result(1));
        assert!(router.take().await.is_none());
        assert_eq!(router.dropped(), 0);
    }

    #[tokio::test]
    async fn producer_is_never_blocked_while_consumer_is_busy() {
        let router = Arc::new(FrameRouter::new());
        // No take at all; 100 submits must all complete immediately.
        for seq in 1..=100 {
            router.submit(result(seq));
        }
        assert_eq!(router.dropped(), 99);
        assert_eq!(router.take().await.unwrap().sequence(), 100);
    }
}
