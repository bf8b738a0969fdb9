//! Idle List
//!
//! The queue of Open primaries available to the next inserter, ordered by
//! expiration time so the file closest to sealing is written first. `get`
//! parks callers while the list is empty; the optional check callback lets
//! a caller nudge the opener before waiting.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::Notify;

use super::primary::{Primary, PrimaryState};
use crate::fid::Fid;

struct IdleInner {
    /// Sorted by `expires` ascending
    items: Vec<Arc<Primary>>,
    waiting: usize,
}

/// Ordered queue of primaries available for the next insert
pub struct IdleList {
    inner: Mutex<IdleInner>,
    available: Notify,
}

impl Default for IdleList {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IdleInner {
                items: Vec::new(),
                waiting: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Take the primary expiring soonest, parking until one is available.
    /// `check` runs before each wait so the caller can request that a new
    /// primary be opened.
    pub async fn get(&self, check: impl Fn()) -> Arc<Primary> {
        loop {
            let notified = {
                let mut inner = self.inner.lock().unwrap();
                if !inner.items.is_empty() {
                    return inner.items.remove(0);
                }
                inner.waiting += 1;
                self.available.notified()
            };
            let _waiting = WaitGuard(self);
            check();
            notified.await;
        }
    }

    /// Offer a primary back to the pool. Only Open primaries are accepted;
    /// anything else is the caller holding a stale reference.
    pub fn put(&self, primary: Arc<Primary>) -> bool {
        if primary.state() != PrimaryState::Open {
            tracing::warn!(
                fid = %primary.fid(),
                state = ?primary.state(),
                "refusing to queue non-open primary"
            );
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.items.iter().any(|p| p.fid() == primary.fid()) {
            return false;
        }
        let expires = primary.expires();
        let pos = inner.items.partition_point(|p| p.expires() <= expires);
        inner.items.insert(pos, primary);
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Drop a primary from the pool (sealing takes it out of rotation)
    pub fn remove(&self, fid: &Fid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.items.len();
        inner.items.retain(|p| p.fid() != fid);
        inner.items.len() != before
    }

    /// Number of callers parked in `get`
    pub fn waiting(&self) -> usize {
        self.inner.lock().unwrap().waiting
    }

    /// Number of queued primaries
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expiration of the head primary
    pub fn head_expires(&self) -> Option<SystemTime> {
        self.inner.lock().unwrap().items.first().map(|p| p.expires())
    }
}

/// Keeps the waiting count honest when a parked `get` is cancelled
struct WaitGuard<'a>(&'a IdleList);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().unwrap().waiting -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::DelayQueue;
    use crate::fid::FidAllocator;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::tempdir;

    fn primary_with_age(dir: &std::path::Path, age: Duration) -> Arc<Primary> {
        let alloc = FidAllocator::new(Ipv4Addr::new(10, 0, 0, 1));
        let token = DelayQueue::new().token();
        let p = Primary::create(dir, alloc.next(), vec![], 1024, age, token).unwrap();
        p.mark_open();
        p
    }

    #[tokio::test]
    async fn test_ordered_by_expiration() {
        let dir = tempdir().unwrap();
        let list = IdleList::new();

        let late = primary_with_age(dir.path(), Duration::from_secs(600));
        let soon = primary_with_age(dir.path(), Duration::from_secs(10));
        let middle = primary_with_age(dir.path(), Duration::from_secs(60));

        assert!(list.put(Arc::clone(&late)));
        assert!(list.put(Arc::clone(&soon)));
        assert!(list.put(Arc::clone(&middle)));
        assert_eq!(list.head_expires(), Some(soon.expires()));

        assert_eq!(list.get(|| {}).await.fid(), soon.fid());
        assert_eq!(list.get(|| {}).await.fid(), middle.fid());
        assert_eq!(list.get(|| {}).await.fid(), late.fid());
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocks_until_put() {
        let dir = tempdir().unwrap();
        let list = Arc::new(IdleList::new());
        let primary = primary_with_age(dir.path(), Duration::from_secs(60));

        let waiter = {
            let list = Arc::clone(&list);
            tokio::spawn(async move { list.get(|| {}).await.fid().to_hex() })
        };

        // Let the getter park.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(list.waiting(), 1);

        assert!(list.put(Arc::clone(&primary)));
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, primary.fid().to_hex());
        assert_eq!(list.waiting(), 0);
    }

    #[tokio::test]
    async fn test_check_runs_before_waiting() {
        let dir = tempdir().unwrap();
        let list = Arc::new(IdleList::new());
        let primary = primary_with_age(dir.path(), Duration::from_secs(60));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let waiter = {
            let list = Arc::clone(&list);
            tokio::spawn(async move {
                list.get(move || {
                    let _ = tx.send(());
                })
                .await
            })
        };

        // The check fired while the list was empty.
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        list.put(primary);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_non_open_primary() {
        let dir = tempdir().unwrap();
        let list = IdleList::new();
        let primary = primary_with_age(dir.path(), Duration::from_secs(60));
        primary.mark_draining();

        assert!(!list.put(primary));
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let list = IdleList::new();
        let primary = primary_with_age(dir.path(), Duration::from_secs(60));
        list.put(Arc::clone(&primary));

        assert!(list.remove(primary.fid()));
        assert!(!list.remove(primary.fid()));
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_no_duplicate_entries() {
        let dir = tempdir().unwrap();
        let list = IdleList::new();
        let primary = primary_with_age(dir.path(), Duration::from_secs(60));
        assert!(list.put(Arc::clone(&primary)));
        assert!(!list.put(Arc::clone(&primary)));
        assert_eq!(list.len(), 1);
    }
}
