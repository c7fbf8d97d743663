//! Lease manager for the in-memory backend
//!
//! Tracks token expirations in a priority queue keyed by deadline. A single
//! background task sleeps until the earliest deadline and publishes expired
//! token ids to an outbound channel; the in-memory token store consumes the
//! channel to drive deletion. Real backends delegate TTL to their native
//! mechanism and never use this.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::debug;

struct LeaseEntry {
    expires_at: Instant,
    lease_id: i64,
    token_id: String,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest deadline is
// on top.
impl Ord for LeaseEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.lease_id.cmp(&self.lease_id))
    }
}

impl PartialOrd for LeaseEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LeaseEntry {
    fn eq(&self, other: &Self) -> bool {
        self.lease_id == other.lease_id
    }
}

impl Eq for LeaseEntry {}

/// Schedules expirations and publishes them to a channel
#[derive(Clone)]
pub struct LeaseManager {
    queue: Arc<Mutex<BinaryHeap<LeaseEntry>>>,
    wakeup: Arc<Notify>,
    next_id: Arc<AtomicI64>,
}

impl LeaseManager {
    /// Create a manager and its channel of expired token ids
    ///
    /// The draining task runs until the manager and all its clones are
    /// dropped and the receiver is closed.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            wakeup: Arc::new(Notify::new()),
            next_id: Arc::new(AtomicI64::new(1)),
        };
        let drain = manager.clone();
        tokio::spawn(async move { drain.run(tx).await });
        (manager, rx)
    }

    /// Register an expiration for the given token id, returning the lease id
    pub fn schedule(&self, token_id: impl Into<String>, ttl: Duration) -> i64 {
        let lease_id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        self.queue.lock().push(LeaseEntry {
            expires_at: Instant::now() + ttl,
            lease_id,
            token_id: token_id.into(),
        });
        self.wakeup.notify_one();
        lease_id
    }

    async fn run(self, tx: mpsc::UnboundedSender<String>) {
        loop {
            let next_deadline = {
                let mut queue = self.queue.lock();
                let now = Instant::now();
                while let Some(entry) = queue.peek() {
                    if entry.expires_at > now {
                        break;
                    }
                    let entry = queue.pop().expect("peeked entry exists");
                    debug!(token = %entry.token_id, lease = entry.lease_id, "lease expired");
                    if tx.send(entry.token_id).is_err() {
                        // receiver gone, nothing left to notify
                        return;
                    }
                }
                queue.peek().map(|e| e.expires_at)
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.wakeup.notified() => {}
                    }
                }
                None => self.wakeup.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expirations_fire_in_deadline_order() {
        let (manager, mut rx) = LeaseManager::new();
        manager.schedule("slow", Duration::from_millis(80));
        manager.schedule("fast", Duration::from_millis(10));

        assert_eq!(rx.recv().await.unwrap(), "fast");
        assert_eq!(rx.recv().await.unwrap(), "slow");
    }

    #[tokio::test]
    async fn newly_scheduled_earlier_lease_preempts_the_sleep() {
        let (manager, mut rx) = LeaseManager::new();
        manager.schedule("later", Duration::from_millis(200));
        // scheduled second but expires first
        manager.schedule("sooner", Duration::from_millis(10));

        let first = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("sooner lease should fire well before the later one");
        assert_eq!(first.unwrap(), "sooner");
    }

    #[tokio::test]
    async fn lease_ids_are_unique_and_increasing() {
        let (manager, _rx) = LeaseManager::new();
        let a = manager.schedule("a", Duration::from_secs(60));
        let b = manager.schedule("b", Duration::from_secs(60));
        assert!(b > a);
    }
}
