//! Delay Queue
//!
//! A single-timer cooperative scheduler. Callers register callbacks to fire
//! at wall-clock instants under caller-owned tokens; one dispatcher task
//! sleeps until the earliest deadline and re-arms whenever the head changes.
//! All deadline work in the storage layer (seal-by-age, replica orphan
//! detection, upload retry) runs through one of these per node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tokio::time::Instant;

/// Opaque handle naming one scheduled callback slot.
///
/// A token is in at most one queue position at a time: `alter` with a live
/// token moves it, `cancel` removes it, firing consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    token: Token,
    when: Instant,
    callback: Callback,
}

/// Single-timer delay queue
pub struct DelayQueue {
    /// Entries sorted by deadline ascending; head is the next to fire
    entries: Mutex<Vec<Entry>>,
    /// Wakes the dispatcher when the head may have changed
    wake: Arc<Notify>,
    next_token: AtomicU64,
}

impl DelayQueue {
    /// Create a queue and spawn its dispatcher task.
    ///
    /// The dispatcher holds only a weak reference; dropping every handle
    /// tears the queue down and discards unfired entries.
    pub fn new() -> Arc<Self> {
        let queue = Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            wake: Arc::new(Notify::new()),
            next_token: AtomicU64::new(1),
        });
        tokio::spawn(Self::dispatch(
            Arc::downgrade(&queue),
            Arc::clone(&queue.wake),
        ));
        queue
    }

    /// Issue a fresh token
    pub fn token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Schedule (or reschedule) `token` to run `callback` at `when`.
    ///
    /// If the token is already queued its previous entry is discarded.
    pub fn alter<F>(&self, token: Token, when: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.token != token);
        let pos = entries.partition_point(|e| e.when <= when);
        entries.insert(
            pos,
            Entry {
                token,
                when,
                callback: Box::new(callback),
            },
        );
        drop(entries);
        self.wake.notify_one();
    }

    /// Remove a scheduled entry. No-op (returns false) if the token is not
    /// present, e.g. because it already fired.
    pub fn cancel(&self, token: Token) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.token != token);
        let removed = entries.len() != before;
        drop(entries);
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    /// Whether the token is currently scheduled
    pub fn contains(&self, token: Token) -> bool {
        self.entries.lock().unwrap().iter().any(|e| e.token == token)
    }

    /// Number of scheduled entries
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deadline of the head entry
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.lock().unwrap().first().map(|e| e.when)
    }

    /// Splice out every entry due at `now`; callbacks are returned so the
    /// dispatcher can invoke them outside the lock.
    fn take_due(&self, now: Instant) -> Vec<Callback> {
        let mut entries = self.entries.lock().unwrap();
        let due = entries.partition_point(|e| e.when <= now);
        entries.drain(..due).map(|e| e.callback).collect()
    }

    /// Dispatcher loop: one real timer, armed from the head deadline.
    async fn dispatch(queue: Weak<DelayQueue>, wake: Arc<Notify>) {
        loop {
            let deadline = match queue.upgrade() {
                Some(q) => q.next_deadline(),
                None => return,
            };

            let notified = wake.notified();
            match deadline {
                Some(when) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(when) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }

            let due = match queue.upgrade() {
                Some(q) => q.take_due(Instant::now()),
                None => return,
            };
            for callback in due {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_fires_in_deadline_order() {
        let queue = DelayQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let now = Instant::now();
        for (label, delay_ms) in [("c", 90u64), ("a", 10), ("b", 50)] {
            let tx = tx.clone();
            queue.alter(queue.token(), now + Duration::from_millis(delay_ms), move || {
                let _ = tx.send(label);
            });
        }

        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.push(
                tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(fired, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_head_has_smallest_deadline() {
        let queue = DelayQueue::new();
        let now = Instant::now();
        let far = queue.token();
        let near = queue.token();
        queue.alter(far, now + Duration::from_secs(60), || {});
        queue.alter(near, now + Duration::from_secs(30), || {});
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(30)));

        // Moving the near token out re-exposes the far deadline.
        queue.alter(near, now + Duration::from_secs(90), || {});
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(60)));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_alter_moves_token() {
        let queue = DelayQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = queue.token();

        let tx1 = tx.clone();
        queue.alter(token, Instant::now() + Duration::from_secs(60), move || {
            let _ = tx1.send("old");
        });
        queue.alter(token, Instant::now() + Duration::from_millis(20), move || {
            let _ = tx.send("new");
        });
        assert_eq!(queue.len(), 1);

        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired, "new");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_is_noop_when_absent() {
        let queue = DelayQueue::new();
        let token = queue.token();
        assert!(!queue.cancel(token));

        queue.alter(token, Instant::now() + Duration::from_secs(60), || {});
        assert!(queue.contains(token));
        assert!(queue.cancel(token));
        assert!(!queue.contains(token));
        assert!(!queue.cancel(token));
    }

    #[tokio::test]
    async fn test_cancelled_token_never_fires() {
        let queue = DelayQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = queue.token();
        queue.alter(token, Instant::now() + Duration::from_millis(30), move || {
            let _ = tx.send(());
        });
        queue.cancel(token);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }
}
