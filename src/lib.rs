//! Blobby - Write-Optimized Blob Ingestion Service
//!
//! Blobby accepts opaque byte payloads from clients, appends them into large
//! local "primary" files, synchronously replicates every append to a quorum
//! of peer "replica" files on other nodes, and asynchronously uploads sealed
//! files to an S3-family object store. Each stored blob is addressable by a
//! compact identifier encoding the file id, byte offset, and length.
//!
//! # Architecture
//!
//! A node runs one storage instance per configured namespace. Writers check
//! a primary file out of an idle list, stream chunks to the local file and to
//! every replica peer in lock step, and only acknowledge the client once all
//! peers have confirmed the bytes. Sealed files move through a background
//! upload pipeline and are deleted locally once the object store and the
//! replica peers have been settled.
//!
//! # Features
//!
//! - Bounded pool of concurrently-open primary files per namespace
//! - Synchronous chunk-level replication gating client acknowledgement
//! - Time- and size-driven sealing with background object-store upload
//! - Orphan-replica detection and self-upload on owner loss
//! - Single-timer delay queue driving all deadline work
//! - HTTP wire protocol with peer-to-peer replication verbs

pub mod api;
pub mod config;
pub mod delay;
pub mod error;
pub mod fid;
pub mod metrics;
pub mod replication;
pub mod storage;
pub mod store;
pub mod upload;

pub use config::BlobbyConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::BlobbyConfig;
    pub use crate::delay::{DelayQueue, Token};
    pub use crate::error::{Error, Result};
    pub use crate::fid::{BlobId, Fid, FidAllocator};
    pub use crate::storage::{InsertData, NamespaceStorage, Node, ReadConfig};
    pub use crate::store::ObjectStore;
}
