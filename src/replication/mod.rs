//! Replication Protocol
//!
//! Owners mirror every primary-file append to a fixed set of peer replicas
//! before acknowledging the client. The wire protocol rides plain HTTP with
//! dedicated verbs on `/<namespace>/<fid>`:
//!
//! - `INITIALIZE` — create an empty replica file
//! - `REPLICATE` — append one chunk at an exact `(start, end)` range
//! - `HEARTBEAT` — owner liveness, resets the replica's orphan deadline
//! - `DELETE` — owner finished uploading; discard the replica
//!
//! [`ReplicaTransport`] is the seam between the storage layer and the wire:
//! production uses [`HttpReplicationClient`], tests wire namespaces together
//! in process.

mod client;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use client::HttpReplicationClient;

/// Wire verbs
pub const VERB_INITIALIZE: &str = "INITIALIZE";
pub const VERB_REPLICATE: &str = "REPLICATE";
pub const VERB_HEARTBEAT: &str = "HEARTBEAT";
pub const VERB_BLASTSTATUS: &str = "BLASTSTATUS";
pub const VERB_BLASTGET: &str = "BLASTGET";

/// Wire headers
pub const HDR_START: &str = "Start";
pub const HDR_END: &str = "End";
pub const HDR_HASH: &str = "Hash";
pub const HDR_OWNER: &str = "Owner";
pub const HDR_LOCAL_ONLY: &str = "Local-Only";
pub const HDR_SHUTTING_DOWN: &str = "Shutting-Down";

/// Peer-facing replication operations.
///
/// `peer` is a `host:port` address. Calls return once the peer has durably
/// applied the operation; any error fails the surrounding insert.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Create an empty replica for `fid`, owned by `owner`
    async fn initialize(&self, peer: &str, namespace: &str, fid: &str, owner: &str) -> Result<()>;

    /// Append `body` to the replica at exactly `[start, end)`
    async fn replicate(
        &self,
        peer: &str,
        namespace: &str,
        fid: &str,
        start: u64,
        end: u64,
        hash: u32,
        body: Bytes,
    ) -> Result<()>;

    /// Reset the replica's orphan deadline
    async fn heartbeat(&self, peer: &str, namespace: &str, fid: &str, owner: &str) -> Result<()>;

    /// Drop the replica; the owner no longer needs it
    async fn delete(&self, peer: &str, namespace: &str, fid: &str) -> Result<()>;

    /// Whether the peer is currently usable for new primaries.
    ///
    /// Transports without failure tracking report every peer as usable.
    fn is_available(&self, _peer: &str) -> bool {
        true
    }
}
