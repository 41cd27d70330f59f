//! Scheduling: cron-driven and manual feed processing
//!
//! Both drivers share one [`FeedGate`]: a per-feed "is running" set so
//! overlapping runs of the same feed coalesce, plus a global semaphore
//! bounding how many feeds process concurrently.

pub mod manual;
pub mod scheduler;

pub use manual::{ManualFeedRunner, ManualSubmissionService, SubmissionOutcome};
pub use scheduler::FeedScheduler;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Concurrency control shared by the cron scheduler and the manual runner.
pub struct FeedGate {
    semaphore: Arc<Semaphore>,
    running: Mutex<HashSet<String>>,
}

/// Held while a feed is being processed; releasing it frees both the
/// per-feed flag and the global slot.
pub struct FeedSlot {
    feed_id: String,
    gate: Arc<FeedGate>,
    _permit: OwnedSemaphorePermit,
}

impl FeedGate {
    pub fn new(max_concurrent_feeds: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_feeds.max(1))),
            running: Mutex::new(HashSet::new()),
        })
    }

    /// Claim the per-feed flag, then wait for a global slot.
    ///
    /// Returns `None` when the feed is already being processed; the caller
    /// drops the tick rather than queueing unbounded duplicates. Waiting
    /// on the global slot does not drop anything: ticks beyond the cap
    /// simply wait.
    pub async fn acquire(self: &Arc<Self>, feed_id: &str) -> Option<FeedSlot> {
        {
            let mut running = self.running.lock().await;
            if !running.insert(feed_id.to_string()) {
                warn!(feed_id, "feed is already processing; dropping overlapping run");
                return None;
            }
        }

        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => Some(FeedSlot {
                feed_id: feed_id.to_string(),
                gate: Arc::clone(self),
                _permit: permit,
            }),
            Err(_) => {
                // semaphore closed during shutdown
                self.running.lock().await.remove(feed_id);
                None
            }
        }
    }

    /// Whether a feed currently holds (or waits for) a slot.
    pub async fn is_running(&self, feed_id: &str) -> bool {
        self.running.lock().await.contains(feed_id)
    }

    async fn release(&self, feed_id: &str) {
        self.running.lock().await.remove(feed_id);
    }
}

impl Drop for FeedSlot {
    fn drop(&mut self) {
        let gate = Arc::clone(&self.gate);
        let feed_id = self.feed_id.clone();
        tokio::spawn(async move {
            gate.release(&feed_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn overlapping_acquire_is_dropped() {
        let gate = FeedGate::new(4);
        let slot = gate.acquire("f").await;
        assert!(slot.is_some());
        assert!(gate.acquire("f").await.is_none());

        drop(slot);
        // release happens on a spawned task
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.acquire("f").await.is_some());
    }

    #[tokio::test]
    async fn semaphore_caps_concurrency_without_dropping() {
        let gate = FeedGate::new(1);
        let first = gate.acquire("a").await.unwrap();

        // a different feed waits for the slot instead of being dropped
        let gate2 = Arc::clone(&gate);
        let waiter = tokio::spawn(async move { gate2.acquire("b").await.is_some() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
    }
}
