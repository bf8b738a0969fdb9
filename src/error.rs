//! Blobby Error Types

use thiserror::Error;

/// Result type alias for Blobby operations
pub type Result<T> = std::result::Result<T, Error>;

/// Blobby error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Client errors
    #[error("Invalid blob id: {0}")]
    InvalidId(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not possible: {0}")]
    NotPossible(String),

    // Peer-to-peer protocol errors
    #[error("Unknown replica: {0}")]
    ReplicaNotFound(String),

    #[error("Wrong replica state for {fid}: expected offset {expected}, got {got}")]
    WrongReplicaState { fid: String, expected: u64, got: u64 },

    #[error("Checksum mismatch on {fid}: expected {expected:#010x}, got {got:#010x}")]
    ChecksumMismatch { fid: String, expected: u32, got: u32 },

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Peer unreachable: {address}: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("Replica quorum not reached: {reached}/{required} peers available")]
    QuorumNotReached { reached: usize, required: usize },

    // Upload errors
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] s3::error::S3Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transient error: {0}")]
    Transient(String),

    // Lifecycle errors
    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Check if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Replication(_)
                | Error::PeerUnreachable { .. }
                | Error::QuorumNotReached { .. }
                | Error::Upload(_)
                | Error::ObjectStore(_)
                | Error::Io(_)
                | Error::Transient(_)
        )
    }

    /// Check if this error requires operator intervention
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Map the error to an HTTP status code for the wire protocol
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidId(_) | Error::NotPossible(_) => 400,
            Error::NotFound(_) | Error::ReplicaNotFound(_) => 404,
            Error::WrongReplicaState { .. } | Error::ChecksumMismatch { .. } => 409,
            Error::ShuttingDown | Error::QuorumNotReached { .. } => 503,
            Error::PeerUnreachable { .. } | Error::Replication(_) => 502,
            Error::Cancelled => 499,
            _ => 500,
        }
    }
}
