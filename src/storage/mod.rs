//! Storage Subsystem
//!
//! One [`NamespaceStorage`] instance per configured namespace owns the whole
//! blob lifecycle: a bounded pool of open primary files fed to inserters
//! through the [`IdleList`], synchronous chunk replication to peers, replica
//! files hosted for remote owners, and the sealing/upload/delete pipeline.
//! [`Node`] bundles the namespaces of one process together with the shared
//! transport, object store, uploader, and delay queue.

pub mod idle;
pub mod namespace;
pub mod primary;
pub mod replica;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::config::BlobbyConfig;
use crate::delay::DelayQueue;
use crate::error::{Error, Result};
use crate::fid::BlobId;
use crate::replication::{HttpReplicationClient, ReplicaTransport};
use crate::upload::Uploader;

pub use idle::IdleList;
pub use namespace::{BlobRead, NamespaceStatus, NamespaceStorage};
pub use primary::{Primary, PrimaryState, PrimaryStatus};
pub use replica::{Replica, ReplicaState, ReplicaStatus};

/// One insert request
pub struct InsertData {
    /// Payload length hint; -1 means unknown until EOF
    pub length: i64,
    /// Payload byte stream
    pub source: Box<dyn AsyncRead + Send + Unpin>,
    /// Optional request tracer carried through log lines
    pub tracer: Option<String>,
}

impl InsertData {
    pub fn new(length: i64, source: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            length,
            source,
            tracer: None,
        }
    }

    /// Insert a fully-buffered payload (tests and small writes)
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let length = bytes.len() as i64;
        Self::new(length, Box::new(std::io::Cursor::new(bytes)))
    }
}

impl std::fmt::Debug for InsertData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertData")
            .field("length", &self.length)
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

/// One read request
#[derive(Debug, Clone, Copy)]
pub struct ReadConfig {
    /// Parsed blob id
    pub id: BlobId,
    /// Disable forwarding to the owning node
    pub local_only: bool,
}

/// All storage instances of one process
pub struct Node {
    config: BlobbyConfig,
    namespaces: HashMap<String, Arc<NamespaceStorage>>,
    shutting_down: AtomicBool,
}

impl Node {
    /// Build the shared machinery and start every configured namespace
    pub async fn start(config: BlobbyConfig) -> Result<Arc<Self>> {
        let delay = DelayQueue::new();
        let store = crate::store::from_config(&config.object_store, &config.upload)?;
        let transport: Arc<dyn ReplicaTransport> =
            Arc::new(HttpReplicationClient::new(&config.replication)?);
        let uploader = Arc::new(Uploader::new(
            Arc::clone(&store),
            config.upload.clone(),
        ));

        let mut namespaces = HashMap::new();
        for ns in &config.namespaces {
            let storage = NamespaceStorage::start(
                &config,
                ns,
                Arc::clone(&transport),
                Arc::clone(&store),
                Arc::clone(&uploader),
                Arc::clone(&delay),
            )
            .await?;
            namespaces.insert(ns.name.clone(), storage);
        }

        tracing::info!(
            namespaces = namespaces.len(),
            data_dir = %config.node.data_dir.display(),
            "storage node started"
        );

        Ok(Arc::new(Self {
            config,
            namespaces,
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// Look up a namespace by name
    pub fn namespace(&self, name: &str) -> Result<&Arc<NamespaceStorage>> {
        self.namespaces
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("unknown namespace {:?}", name)))
    }

    /// Iterate all namespaces
    pub fn namespaces(&self) -> impl Iterator<Item = &Arc<NamespaceStorage>> {
        self.namespaces.values()
    }

    pub fn config(&self) -> &BlobbyConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Stop accepting inserts, wait out in-flight ones within the grace
    /// period, then seal every primary so uploads can drain.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        for ns in self.namespaces.values() {
            ns.begin_shutdown();
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        loop {
            let inflight: usize = self
                .namespaces
                .values()
                .map(|ns| ns.inflight_inserts())
                .sum();
            if inflight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(inflight, "shutdown grace expired with inserts in flight");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        for ns in self.namespaces.values() {
            ns.flush();
        }
        tracing::info!("storage node drained");
    }
}
