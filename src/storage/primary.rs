//! Primary File Lifecycle
//!
//! A primary is an append-only local file accepting inserts, plus the
//! coordination state that gates its movement through
//! Opening → Open → Draining → Uploading → Uploaded → Deleting → Deleted.
//! The replica peer set is fixed when the file opens and never changes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::delay::Token;
use crate::error::{Error, Result};
use crate::fid::Fid;

/// Primary file lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryState {
    Opening,
    Open,
    Draining,
    Uploading,
    Uploaded,
    Deleting,
    Deleted,
}

/// A primary file and its coordination state
pub struct Primary {
    fid: Fid,
    path: PathBuf,
    /// Replica peer addresses, fixed at opening
    peers: Vec<String>,
    file: File,
    opened_at: SystemTime,
    /// Wall clock at which the file seals for age
    expires: SystemTime,
    max_file_size: u64,
    /// Delay-queue slot: seal-by-age while Open, upload retry afterwards
    token: Token,
    inner: Mutex<PrimaryInner>,
}

struct PrimaryInner {
    state: PrimaryState,
    /// Committed bytes: every byte below this is on disk and acknowledged
    /// by every replica peer
    size: u64,
    /// Reservation high-water mark; equals `size` between inserts
    reserved: u64,
    inflight: usize,
    /// Bytes acknowledged per peer
    acked: HashMap<String, u64>,
    upload_attempts: u32,
}

impl Primary {
    /// Create a fresh primary file. The caller has already initialized the
    /// replica peers; the primary starts in Opening.
    pub fn create(
        dir: &Path,
        fid: Fid,
        peers: Vec<String>,
        max_file_size: u64,
        max_file_age: Duration,
        token: Token,
    ) -> Result<Arc<Self>> {
        let path = dir.join(fid.to_hex());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let now = SystemTime::now();
        let acked = peers.iter().map(|p| (p.clone(), 0u64)).collect();
        Ok(Arc::new(Self {
            fid,
            path,
            peers,
            file,
            opened_at: now,
            expires: now + max_file_age,
            max_file_size,
            token,
            inner: Mutex::new(PrimaryInner {
                state: PrimaryState::Opening,
                size: 0,
                reserved: 0,
                inflight: 0,
                acked,
                upload_attempts: 0,
            }),
        }))
    }

    /// Re-register a primary file found on disk at startup. Its peer set is
    /// unknown, so it goes straight to Draining and the upload pipeline.
    pub fn open_existing(
        path: PathBuf,
        fid: Fid,
        max_file_size: u64,
        token: Token,
    ) -> Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        let now = SystemTime::now();
        Ok(Arc::new(Self {
            fid,
            path,
            peers: Vec::new(),
            file,
            opened_at: now,
            expires: now,
            max_file_size,
            token,
            inner: Mutex::new(PrimaryInner {
                state: PrimaryState::Draining,
                size,
                reserved: size,
                inflight: 0,
                acked: HashMap::new(),
                upload_attempts: 0,
            }),
        }))
    }

    pub fn fid(&self) -> &Fid {
        &self.fid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn expires(&self) -> SystemTime {
        self.expires
    }

    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> PrimaryState {
        self.inner.lock().unwrap().state
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    pub fn inflight(&self) -> usize {
        self.inner.lock().unwrap().inflight
    }

    /// Opening → Open once the replica set is confirmed
    pub fn mark_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PrimaryState::Opening {
            inner.state = PrimaryState::Open;
        }
    }

    /// Reserve the write position for one insert. Returns the starting
    /// offset, or None if the primary is no longer accepting inserts.
    pub fn begin_insert(&self) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != PrimaryState::Open {
            return None;
        }
        inner.inflight += 1;
        Some(inner.reserved)
    }

    /// Write one chunk at its reserved offset. Runs outside the state lock;
    /// positional writes keep concurrent readers of committed bytes safe.
    pub fn write_chunk(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Commit bytes up to `end`: the chunk is on disk locally and every
    /// replica peer has acknowledged it.
    pub fn commit_chunk(&self, end: u64) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(end >= inner.size);
        inner.reserved = end;
        inner.size = end;
        for peer in &self.peers {
            inner.acked.insert(peer.clone(), end);
        }
    }

    /// Release the insert slot
    pub fn finish_insert(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.inflight > 0);
        inner.inflight = inner.inflight.saturating_sub(1);
        // Uncommitted reservation space is reclaimed; the next insert
        // starts at the committed size.
        inner.reserved = inner.size;
    }

    /// Whether the file has hit a seal condition
    pub fn should_seal(&self) -> bool {
        self.inner.lock().unwrap().size >= self.max_file_size || SystemTime::now() >= self.expires
    }

    /// Single-shot transition to Draining. Returns true only on the first
    /// call; later triggers are no-ops.
    pub fn mark_draining(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state <= PrimaryState::Open {
            inner.state = PrimaryState::Draining;
            true
        } else {
            false
        }
    }

    /// Draining → Uploading once no inserts are in flight
    pub fn try_begin_upload(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PrimaryState::Draining && inner.inflight == 0 {
            inner.state = PrimaryState::Uploading;
            true
        } else {
            false
        }
    }

    pub fn mark_uploaded(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PrimaryState::Uploading {
            inner.state = PrimaryState::Uploaded;
        }
    }

    pub fn mark_deleting(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PrimaryState::Uploaded {
            inner.state = PrimaryState::Deleting;
        }
    }

    pub fn mark_deleted(&self) {
        self.inner.lock().unwrap().state = PrimaryState::Deleted;
    }

    /// Bump and return the upload attempt count
    pub fn next_upload_attempt(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.upload_attempts += 1;
        inner.upload_attempts
    }

    /// Whether the local file still exists for reads
    pub fn has_local_file(&self) -> bool {
        self.inner.lock().unwrap().state < PrimaryState::Deleting
    }

    /// Read committed bytes in `[start, end)`
    pub fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let size = self.size();
        if end > size || start > end {
            return Err(Error::NotFound(format!(
                "range {}..{} beyond {} committed bytes of {}",
                start,
                end,
                size,
                self.fid.to_hex()
            )));
        }
        let mut buf = vec![0u8; (end - start) as usize];
        self.file.read_exact_at(&mut buf, start)?;
        Ok(buf)
    }

    /// Flush file contents to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Unlink the local file
    pub fn remove_file(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Every peer has acknowledged exactly the committed size
    pub fn replicas_in_sync(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.acked.values().all(|&acked| acked == inner.size)
    }

    /// Point-in-time view for status listings
    pub fn status(&self) -> PrimaryStatus {
        let inner = self.inner.lock().unwrap();
        PrimaryStatus {
            fid: self.fid.to_hex(),
            path: self.path.display().to_string(),
            state: inner.state,
            size: inner.size,
            inflight: inner.inflight,
            opened_at: chrono::DateTime::<chrono::Utc>::from(self.opened_at),
            expires: chrono::DateTime::<chrono::Utc>::from(self.expires),
            peers: self.peers.clone(),
        }
    }
}

/// Serializable view of one primary
#[derive(Debug, Clone, Serialize)]
pub struct PrimaryStatus {
    pub fid: String,
    pub path: String,
    pub state: PrimaryState,
    pub size: u64,
    pub inflight: usize,
    pub opened_at: chrono::DateTime<chrono::Utc>,
    pub expires: chrono::DateTime<chrono::Utc>,
    pub peers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::DelayQueue;
    use crate::fid::FidAllocator;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn test_primary(dir: &Path, max_size: u64) -> Arc<Primary> {
        let alloc = FidAllocator::new(Ipv4Addr::new(10, 0, 0, 1));
        // Token identity is all that matters here.
        let token = DelayQueue::new().token();
        Primary::create(
            dir,
            alloc.next(),
            vec!["peer-a:7420".to_string()],
            max_size,
            Duration::from_secs(600),
            token,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_reserve_commit() {
        let dir = tempdir().unwrap();
        let primary = test_primary(dir.path(), 1024);
        primary.mark_open();

        let start = primary.begin_insert().unwrap();
        assert_eq!(start, 0);
        primary.write_chunk(0, b"hello").unwrap();
        primary.commit_chunk(5);
        primary.finish_insert();

        assert_eq!(primary.size(), 5);
        assert!(primary.replicas_in_sync());
        assert_eq!(primary.read_range(0, 5).unwrap(), b"hello");

        let start = primary.begin_insert().unwrap();
        assert_eq!(start, 5);
        primary.finish_insert();
    }

    #[tokio::test]
    async fn test_uncommitted_reservation_is_reclaimed() {
        let dir = tempdir().unwrap();
        let primary = test_primary(dir.path(), 1024);
        primary.mark_open();

        let start = primary.begin_insert().unwrap();
        primary.write_chunk(start, b"partial").unwrap();
        // Insert dies before commit.
        primary.finish_insert();

        assert_eq!(primary.size(), 0);
        assert_eq!(primary.begin_insert().unwrap(), 0);
        primary.finish_insert();
    }

    #[tokio::test]
    async fn test_draining_is_single_shot() {
        let dir = tempdir().unwrap();
        let primary = test_primary(dir.path(), 1024);
        primary.mark_open();

        assert!(primary.mark_draining());
        assert!(!primary.mark_draining());
        assert_eq!(primary.state(), PrimaryState::Draining);
        assert!(primary.begin_insert().is_none());
    }

    #[tokio::test]
    async fn test_upload_waits_for_inflight() {
        let dir = tempdir().unwrap();
        let primary = test_primary(dir.path(), 1024);
        primary.mark_open();

        primary.begin_insert().unwrap();
        primary.mark_draining();
        assert!(!primary.try_begin_upload());

        primary.finish_insert();
        assert!(primary.try_begin_upload());
        assert_eq!(primary.state(), PrimaryState::Uploading);
        assert!(!primary.try_begin_upload());
    }

    #[tokio::test]
    async fn test_seal_by_size() {
        let dir = tempdir().unwrap();
        let primary = test_primary(dir.path(), 10);
        primary.mark_open();
        assert!(!primary.should_seal());

        primary.begin_insert().unwrap();
        primary.write_chunk(0, b"0123456789").unwrap();
        primary.commit_chunk(10);
        primary.finish_insert();
        assert!(primary.should_seal());
    }

    #[tokio::test]
    async fn test_read_range_bounds() {
        let dir = tempdir().unwrap();
        let primary = test_primary(dir.path(), 1024);
        primary.mark_open();
        primary.begin_insert().unwrap();
        primary.write_chunk(0, b"abcdef").unwrap();
        primary.commit_chunk(6);
        primary.finish_insert();

        assert_eq!(primary.read_range(2, 5).unwrap(), b"cde");
        assert!(primary.read_range(0, 7).is_err());
    }

    #[tokio::test]
    async fn test_open_existing_starts_draining() {
        let dir = tempdir().unwrap();
        let primary = test_primary(dir.path(), 1024);
        primary.mark_open();
        primary.begin_insert().unwrap();
        primary.write_chunk(0, b"leftover").unwrap();
        primary.commit_chunk(8);
        primary.finish_insert();
        let fid = *primary.fid();
        let path = primary.path().to_path_buf();
        drop(primary);

        let token = DelayQueue::new().token();
        let reopened = Primary::open_existing(path, fid, 1024, token).unwrap();
        assert_eq!(reopened.state(), PrimaryState::Draining);
        assert_eq!(reopened.size(), 8);
        assert!(reopened.try_begin_upload());
    }
}
