//! Replica File Lifecycle
//!
//! A replica is the local mirror of a remote node's primary. The owner
//! drives it with INITIALIZE / REPLICATE / HEARTBEAT / DELETE; appends must
//! arrive in strictly increasing `(start, end)` order with a matching
//! checksum. A replica whose owner stops heartbeating is orphaned and
//! uploads itself so the bytes survive the owner's loss.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::delay::Token;
use crate::error::{Error, Result};

/// Replica lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Initializing,
    Replicating,
    Orphaned,
    Uploading,
    Uploaded,
    Deleted,
}

/// A remote-owned file hosted locally
pub struct Replica {
    /// Fid as supplied by the owner
    fid: String,
    path: PathBuf,
    /// Single delay-queue slot: orphan deadline, then upload retry
    token: Token,
    inner: Mutex<ReplicaInner>,
}

struct ReplicaInner {
    state: ReplicaState,
    size: u64,
    owner: String,
    last_heartbeat: SystemTime,
    expires: SystemTime,
    file: Option<File>,
    /// Set once the replica has ever been orphaned
    orphaned: bool,
    upload_attempts: u32,
}

impl Replica {
    /// Create an empty replica on INITIALIZE from the owner
    pub fn create(
        dir: &Path,
        fid: &str,
        owner: &str,
        orphan_timeout: Duration,
        token: Token,
    ) -> Result<Arc<Self>> {
        let path = dir.join(fid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let now = SystemTime::now();
        Ok(Arc::new(Self {
            fid: fid.to_string(),
            path,
            token,
            inner: Mutex::new(ReplicaInner {
                state: ReplicaState::Replicating,
                size: 0,
                owner: owner.to_string(),
                last_heartbeat: now,
                expires: now + orphan_timeout,
                file: Some(file),
                orphaned: false,
                upload_attempts: 0,
            }),
        }))
    }

    /// Re-register a replica file found on disk at startup. The owner is
    /// unknown until it heartbeats or appends again; the orphan timer covers
    /// the case where it never does.
    pub fn open_existing(
        path: PathBuf,
        fid: &str,
        orphan_timeout: Duration,
        token: Token,
    ) -> Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        let now = SystemTime::now();
        Ok(Arc::new(Self {
            fid: fid.to_string(),
            path,
            token,
            inner: Mutex::new(ReplicaInner {
                state: ReplicaState::Replicating,
                size,
                owner: String::new(),
                last_heartbeat: now,
                expires: now + orphan_timeout,
                file: Some(file),
                orphaned: false,
                upload_attempts: 0,
            }),
        }))
    }

    pub fn fid(&self) -> &str {
        &self.fid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> ReplicaState {
        self.inner.lock().unwrap().state
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    pub fn owner(&self) -> String {
        self.inner.lock().unwrap().owner.clone()
    }

    pub fn was_orphaned(&self) -> bool {
        self.inner.lock().unwrap().orphaned
    }

    /// Append one chunk. Accepted iff the replica is still replicating,
    /// `start` equals the current size, the length matches the declared
    /// range, and the checksum matches. Accepting the chunk also counts as
    /// hearing from the owner.
    pub fn append(
        &self,
        start: u64,
        end: u64,
        hash: u32,
        body: &[u8],
        orphan_timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.state != ReplicaState::Replicating {
            return Err(Error::WrongReplicaState {
                fid: self.fid.clone(),
                expected: inner.size,
                got: start,
            });
        }
        if start != inner.size || end < start || (end - start) as usize != body.len() {
            return Err(Error::WrongReplicaState {
                fid: self.fid.clone(),
                expected: inner.size,
                got: start,
            });
        }

        let computed = crc32fast::hash(body);
        if computed != hash {
            // The stream from the owner can no longer be trusted; rescue
            // the good prefix by handing the replica to the uploader.
            inner.state = ReplicaState::Uploading;
            return Err(Error::ChecksumMismatch {
                fid: self.fid.clone(),
                expected: hash,
                got: computed,
            });
        }

        let file = inner
            .file
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("replica {} has no file", self.fid)))?;
        file.write_all_at(body, start)?;
        inner.size = end;

        let now = SystemTime::now();
        inner.last_heartbeat = now;
        inner.expires = now + orphan_timeout;
        Ok(())
    }

    /// Owner heartbeat: push the orphan deadline out
    pub fn touch(&self, orphan_timeout: Duration, owner: &str) {
        let mut inner = self.inner.lock().unwrap();
        let now = SystemTime::now();
        inner.last_heartbeat = now;
        inner.expires = now + orphan_timeout;
        if inner.owner.is_empty() && !owner.is_empty() {
            inner.owner = owner.to_string();
        }
    }

    /// Replicating → Orphaned when the heartbeat deadline passes. Returns
    /// false if the replica moved on in the meantime.
    pub fn mark_orphaned(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ReplicaState::Replicating {
            inner.state = ReplicaState::Orphaned;
            inner.orphaned = true;
            true
        } else {
            false
        }
    }

    /// Orphaned → Uploading, exactly once
    pub fn try_begin_upload(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ReplicaState::Orphaned {
            inner.state = ReplicaState::Uploading;
            true
        } else {
            false
        }
    }

    /// Bump and return the upload attempt count
    pub fn next_upload_attempt(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.upload_attempts += 1;
        inner.upload_attempts
    }

    /// Self-upload finished: the object store holds the bytes, the local
    /// file is no longer needed. A later DELETE from the owner is answered
    /// from the record alone.
    pub fn complete_upload(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ReplicaState::Uploaded;
        inner.file = None;
        drop(inner);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Owner DELETE. Discards local state; the file is only touched if the
    /// replica had not already uploaded itself. Returns the prior state.
    pub fn queue_delete(&self) -> Result<ReplicaState> {
        let mut inner = self.inner.lock().unwrap();
        let prior = inner.state;
        inner.state = ReplicaState::Deleted;
        inner.file = None;
        drop(inner);

        if prior != ReplicaState::Uploaded {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(prior)
    }

    /// Read bytes in `[start, end)` for the self-upload path
    pub fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        if end > inner.size || start > end {
            return Err(Error::NotFound(format!(
                "range {}..{} beyond {} bytes of replica {}",
                start, end, inner.size, self.fid
            )));
        }
        let file = inner
            .file
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("replica {} file discarded", self.fid)))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact_at(&mut buf, start)?;
        Ok(buf)
    }

    /// Point-in-time view for status listings
    pub fn status(&self) -> ReplicaStatus {
        let inner = self.inner.lock().unwrap();
        ReplicaStatus {
            fid: self.fid.clone(),
            path: self.path.display().to_string(),
            state: inner.state,
            size: inner.size,
            owner: inner.owner.clone(),
            last_heartbeat: chrono::DateTime::<chrono::Utc>::from(inner.last_heartbeat),
            expires: chrono::DateTime::<chrono::Utc>::from(inner.expires),
        }
    }
}

/// Serializable view of one replica
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub fid: String,
    pub path: String,
    pub state: ReplicaState,
    pub size: u64,
    pub owner: String,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub expires: chrono::DateTime<chrono::Utc>,
}
