//! Namespace Storage Orchestration
//!
//! One instance per namespace coordinates the whole blob lifecycle:
//!
//! - inserts check a primary out of the idle list, stream chunks to the
//!   local file and every replica peer in lock step, and only return a blob
//!   id once all peers have acknowledged every chunk
//! - a dedicated opener task serializes primary creation so peer hiccups do
//!   not multiply into a thundering herd
//! - reads resolve locally, forward to the owning node, or fall back to a
//!   ranged object-store GET
//! - replica files hosted for remote owners are driven by the peer-to-peer
//!   verbs and self-upload once orphaned
//! - sealed files drain through the upload pipeline and are removed locally
//!   once the store and the peers are settled

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use bytes::Bytes;
use futures::TryStreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::io::StreamReader;

use super::idle::IdleList;
use super::primary::{Primary, PrimaryState, PrimaryStatus};
use super::replica::{Replica, ReplicaState, ReplicaStatus};
use super::{InsertData, ReadConfig};
use crate::config::{BlobbyConfig, Encoding, NamespaceConfig, StorageConfig};
use crate::delay::DelayQueue;
use crate::error::{Error, Result};
use crate::fid::{BlobId, Fid, FidAllocator, FID_HEX_LEN};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::replication::{ReplicaTransport, HDR_LOCAL_ONLY};
use crate::store::ObjectStore;
use crate::upload::Uploader;

/// Cap on how often one insert may race a sealing primary before giving up
const MAX_CHECKOUT_ATTEMPTS: usize = 32;

/// Attempts at peer DELETE fan-out before a settled primary is parked
const MAX_PEER_DELETE_ATTEMPTS: u32 = 8;

/// One streaming blob read
pub struct BlobRead {
    pub length: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for BlobRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobRead")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Storage instance for one namespace
pub struct NamespaceStorage {
    name: String,
    settings: StorageConfig,
    encoding: Encoding,
    /// Configured peer pool replicas are drawn from
    peers: Vec<String>,
    replica_count: usize,
    advertise_ip: Ipv4Addr,
    peer_port: u16,
    advertise_address: String,
    primary_dir: PathBuf,
    replica_dir: PathBuf,
    data_dir: PathBuf,
    allocator: FidAllocator,
    transport: Arc<dyn ReplicaTransport>,
    store: Arc<dyn ObjectStore>,
    uploader: Arc<Uploader>,
    delay: Arc<DelayQueue>,
    idle: IdleList,
    primaries: RwLock<HashMap<Fid, Arc<Primary>>>,
    replicas: RwLock<HashMap<String, Arc<Replica>>>,
    metrics: Metrics,
    opener_tx: mpsc::Sender<()>,
    shutting_down: AtomicBool,
    http: reqwest::Client,
    /// Handle to ourselves for delay-queue callbacks and spawned pipelines
    weak_self: Weak<NamespaceStorage>,
}

impl NamespaceStorage {
    /// Create the instance, replay on-disk state, and start its background
    /// tasks (opener, heartbeat ticker).
    pub async fn start(
        config: &BlobbyConfig,
        ns: &NamespaceConfig,
        transport: Arc<dyn ReplicaTransport>,
        store: Arc<dyn ObjectStore>,
        uploader: Arc<Uploader>,
        delay: Arc<DelayQueue>,
    ) -> Result<Arc<Self>> {
        let primary_dir = config.primary_dir(&ns.name);
        let replica_dir = config.replica_dir(&ns.name);
        std::fs::create_dir_all(&primary_dir)?;
        std::fs::create_dir_all(&replica_dir)?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.replication.connect_timeout())
            .timeout(config.replication.request_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;

        let (opener_tx, opener_rx) = mpsc::channel(1);

        let storage = Arc::new_cyclic(|weak| Self {
            name: ns.name.clone(),
            settings: config.storage.clone(),
            encoding: ns.encoding,
            peers: ns.peers.clone(),
            replica_count: ns.replica_count,
            advertise_ip: config.node.advertise_ip,
            peer_port: config.peer_port(),
            advertise_address: config.advertise_address(),
            primary_dir,
            replica_dir,
            data_dir: config.node.data_dir.clone(),
            allocator: FidAllocator::new(config.node.advertise_ip),
            transport,
            store,
            uploader,
            delay,
            idle: IdleList::new(),
            primaries: RwLock::new(HashMap::new()),
            replicas: RwLock::new(HashMap::new()),
            metrics: Metrics::new(),
            opener_tx,
            shutting_down: AtomicBool::new(false),
            http,
            weak_self: weak.clone(),
        });

        storage.scan_existing()?;

        tokio::spawn(Self::opener_loop(Arc::downgrade(&storage), opener_rx));
        tokio::spawn(Self::heartbeat_loop(Arc::downgrade(&storage)));

        tracing::info!(namespace = %storage.name, "namespace storage started");
        Ok(storage)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refuse new inserts; peer traffic keeps flowing
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Inserts currently streaming into a primary
    pub fn inflight_inserts(&self) -> usize {
        self.primaries
            .read()
            .unwrap()
            .values()
            .map(|p| p.inflight())
            .sum()
    }

    // ============ Insert path ============

    /// Store one payload. On success the bytes are on this node and on
    /// every replica peer of the chosen primary, and the returned id reads
    /// back from any of them.
    pub async fn insert(&self, data: InsertData) -> Result<BlobId> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        if let Some(tracer) = &data.tracer {
            tracing::debug!(namespace = %self.name, tracer, "insert accepted");
        }

        let result = self.insert_inner(data).await;
        match &result {
            Ok(id) => {
                self.metrics.inserts.inc();
                self.metrics.insert_bytes.add(id.length as u64);
            }
            Err(_) => self.metrics.inserts_failed.inc(),
        }
        result
    }

    async fn insert_inner(&self, data: InsertData) -> Result<BlobId> {
        for _ in 0..MAX_CHECKOUT_ATTEMPTS {
            let primary = self
                .idle
                .get(|| {
                    let _ = self.opener_tx.try_send(());
                })
                .await;

            // The age timer can seal a primary between queueing and
            // checkout; grab the next one.
            let Some(start) = primary.begin_insert() else {
                self.seal_primary(&primary);
                continue;
            };

            return self.write_blob(primary, start, data).await;
        }
        Err(Error::Internal(
            "primary pool is churning; insert could not check out a file".into(),
        ))
    }

    /// Stream one payload into a checked-out primary, mirroring every chunk
    /// to the replica peers before it is committed.
    async fn write_blob(
        &self,
        primary: Arc<Primary>,
        start: u64,
        mut data: InsertData,
    ) -> Result<BlobId> {
        let mut guard = InsertGuard::new(self.weak_self.clone(), Arc::clone(&primary));
        let known_length = data.length >= 0;
        let fid_hex = primary.fid().to_hex();
        let mut offset = start;
        let mut buf = vec![0u8; self.settings.chunk_size];

        loop {
            let n = read_chunk(data.source.as_mut(), &mut buf).await?;
            if n == 0 {
                break;
            }
            let end = offset + n as u64;

            if !known_length && end > self.settings.max_file_size {
                // An unbounded stream must not grow the file past its seal
                // point; fail the insert and retire the primary.
                guard.force_drain();
                return Err(Error::Transient(format!(
                    "unknown-length insert hit the {} byte file limit",
                    self.settings.max_file_size
                )));
            }
            if end - start > u32::MAX as u64 {
                return Err(Error::NotPossible(
                    "payload exceeds the 4 GiB blob addressing limit".into(),
                ));
            }

            // From here until commit the replica prefixes may diverge.
            guard.mark_dirty();
            primary.write_chunk(offset, &buf[..n])?;

            let body = Bytes::copy_from_slice(&buf[..n]);
            let hash = crc32fast::hash(&body);
            let acks = futures::future::join_all(primary.peers().iter().map(|peer| {
                let body = body.clone();
                let fid_hex = fid_hex.clone();
                async move {
                    self.transport
                        .replicate(peer, &self.name, &fid_hex, offset, end, hash, body)
                        .await
                        .map_err(|e| (peer.clone(), e))
                }
            }))
            .await;

            for ack in acks {
                if let Err((peer, e)) = ack {
                    tracing::warn!(
                        namespace = %self.name,
                        fid = %fid_hex,
                        peer = %peer,
                        error = %e,
                        "replica append failed; draining primary"
                    );
                    return Err(e);
                }
            }

            primary.commit_chunk(end);
            guard.mark_clean();
            offset = end;
        }

        if self.settings.fsync {
            primary.sync()?;
        }

        let length = (offset - start) as u32;
        Ok(BlobId::new(*primary.fid(), start, length))
    }

    // ============ Primary lifecycle ============

    /// Take a primary out of rotation and, once its inserts have drained,
    /// hand it to the upload pipeline. Safe to call repeatedly.
    pub(crate) fn seal_primary(&self, primary: &Arc<Primary>) {
        if primary.mark_draining() {
            tracing::info!(
                namespace = %self.name,
                fid = %primary.fid(),
                size = primary.size(),
                "primary draining"
            );
            self.idle.remove(primary.fid());
            self.delay.cancel(primary.token());
            self.metrics.open_primaries.dec();
        }
        self.maybe_begin_upload(primary);
    }

    fn maybe_begin_upload(&self, primary: &Arc<Primary>) {
        if primary.try_begin_upload() {
            let Some(ns) = self.weak_self.upgrade() else {
                return;
            };
            let primary = Arc::clone(primary);
            tokio::spawn(async move {
                ns.run_primary_upload(primary).await;
            });
        }
    }

    fn run_primary_upload(
        self: Arc<Self>,
        primary: Arc<Primary>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.run_primary_upload_inner(primary))
    }

    async fn run_primary_upload_inner(self: Arc<Self>, primary: Arc<Primary>) {
        if let Err(e) = primary.sync() {
            tracing::error!(fid = %primary.fid(), error = %e, "seal fsync failed");
        }

        let key = self.object_key(&primary.fid().to_hex());
        self.metrics.uploads_inflight.inc();
        let result = self
            .uploader
            .upload_file(&key, primary.path(), self.encoding)
            .await;
        self.metrics.uploads_inflight.dec();

        match result {
            Ok(()) => {
                self.metrics.uploads.inc();
                self.metrics.upload_bytes.add(primary.size());
                primary.mark_uploaded();
                self.settle_primary(primary).await;
            }
            Err(e) => {
                self.metrics.upload_failures.inc();
                let attempt = primary.next_upload_attempt();
                if e.is_retryable() && attempt < self.uploader.max_attempts() {
                    let backoff = self.uploader.backoff(attempt);
                    tracing::warn!(
                        fid = %primary.fid(),
                        attempt,
                        error = %e,
                        "upload failed; retrying in {:?}",
                        backoff
                    );
                    let weak = Arc::downgrade(&self);
                    let token = primary.token();
                    self.delay.alter(token, Instant::now() + backoff, move || {
                        if let Some(ns) = weak.upgrade() {
                            tokio::spawn(ns.run_primary_upload(primary));
                        }
                    });
                } else {
                    tracing::error!(
                        fid = %primary.fid(),
                        attempt,
                        error = %e,
                        "upload abandoned; file parked on disk for the operator"
                    );
                }
            }
        }
    }

    /// After a successful upload: release the replica peers, then remove
    /// the local file and forget the primary.
    async fn settle_primary(&self, primary: Arc<Primary>) {
        let fid_hex = primary.fid().to_hex();
        for peer in primary.peers() {
            let mut attempt: u32 = 0;
            loop {
                match self.transport.delete(peer, &self.name, &fid_hex).await {
                    Ok(()) | Err(Error::ReplicaNotFound(_)) => break,
                    Err(e) => {
                        attempt += 1;
                        if attempt >= MAX_PEER_DELETE_ATTEMPTS {
                            tracing::warn!(
                                fid = %fid_hex,
                                peer = %peer,
                                error = %e,
                                "replica delete exhausted retries; primary stays uploaded"
                            );
                            return;
                        }
                        tokio::time::sleep(self.uploader.backoff(attempt)).await;
                    }
                }
            }
        }

        primary.mark_deleting();
        if let Err(e) = primary.remove_file() {
            tracing::warn!(fid = %fid_hex, error = %e, "could not unlink primary file");
        }
        primary.mark_deleted();
        self.primaries.write().unwrap().remove(primary.fid());
        self.metrics.primaries_deleted.inc();
        tracing::info!(namespace = %self.name, fid = %fid_hex, "primary settled");
    }

    /// Serialized primary opening: pick peers, initialize their replicas,
    /// then expose the file through the idle list.
    async fn open_new_primary(&self) -> Result<Arc<Primary>> {
        let peers = self.select_peers()?;
        let fid = self.allocator.next();
        let fid_hex = fid.to_hex();

        let inits = futures::future::join_all(peers.iter().map(|peer| {
            let fid_hex = fid_hex.clone();
            async move {
                self.transport
                    .initialize(peer, &self.name, &fid_hex, &self.advertise_address)
                    .await
                    .map_err(|e| (peer.clone(), e))
            }
        }))
        .await;

        let failed: Vec<_> = inits.into_iter().filter_map(|r| r.err()).collect();
        if let Some((peer, e)) = failed.into_iter().next() {
            // Roll back the replicas that did come up.
            for other in &peers {
                if *other != peer {
                    let _ = self.transport.delete(other, &self.name, &fid_hex).await;
                }
            }
            return Err(Error::Replication(format!(
                "replica initialize on {} failed: {}",
                peer, e
            )));
        }

        let token = self.delay.token();
        let primary = Primary::create(
            &self.primary_dir,
            fid,
            peers,
            self.settings.max_file_size,
            self.settings.max_file_age(),
            token,
        )?;
        primary.mark_open();
        self.primaries
            .write()
            .unwrap()
            .insert(fid, Arc::clone(&primary));
        self.metrics.primaries_opened.inc();
        self.metrics.open_primaries.inc();

        let weak = self.weak_self.clone();
        let aged = Arc::clone(&primary);
        self.delay.alter(
            token,
            Instant::now() + self.settings.max_file_age(),
            move || {
                if let Some(ns) = weak.upgrade() {
                    ns.seal_primary(&aged);
                }
            },
        );

        tracing::info!(
            namespace = %self.name,
            fid = %fid_hex,
            peers = ?primary.peers(),
            "primary opened"
        );
        Ok(primary)
    }

    /// Shuffle the configured peer pool and take the first `replica_count`
    /// peers the circuit breaker considers usable.
    fn select_peers(&self) -> Result<Vec<String>> {
        use rand::seq::SliceRandom;
        let mut pool = self.peers.clone();
        pool.shuffle(&mut rand::thread_rng());
        let picked: Vec<String> = pool
            .into_iter()
            .filter(|p| self.transport.is_available(p))
            .take(self.replica_count)
            .collect();
        if picked.len() < self.replica_count {
            return Err(Error::QuorumNotReached {
                reached: picked.len(),
                required: self.replica_count,
            });
        }
        Ok(picked)
    }

    fn open_primary_count(&self) -> usize {
        self.primaries
            .read()
            .unwrap()
            .values()
            .filter(|p| p.state() <= PrimaryState::Open)
            .count()
    }

    async fn opener_loop(storage: Weak<Self>, mut requests: mpsc::Receiver<()>) {
        while requests.recv().await.is_some() {
            let Some(ns) = storage.upgrade() else { return };
            if ns.is_shutting_down() {
                continue;
            }

            let mut backoff = ns.uploader.backoff(1);
            while ns.idle.waiting() > ns.idle.len()
                && ns.open_primary_count() < ns.settings.max_open_files
            {
                match ns.open_new_primary().await {
                    Ok(primary) => {
                        ns.idle.put(primary);
                        backoff = ns.uploader.backoff(1);
                    }
                    Err(e) => {
                        tracing::warn!(
                            namespace = %ns.name,
                            error = %e,
                            "primary open failed; retrying in {:?}",
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(ns.uploader.backoff(8));
                        if ns.is_shutting_down() {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Keep replica peers convinced their owner is alive for every primary
    /// that still depends on them.
    async fn heartbeat_loop(storage: Weak<Self>) {
        loop {
            let interval = match storage.upgrade() {
                Some(ns) => ns.settings.heartbeat_interval(),
                None => return,
            };
            tokio::time::sleep(interval).await;

            let Some(ns) = storage.upgrade() else { return };
            let live: Vec<Arc<Primary>> = ns
                .primaries
                .read()
                .unwrap()
                .values()
                .filter(|p| p.state() <= PrimaryState::Uploading)
                .cloned()
                .collect();

            for primary in live {
                let fid_hex = primary.fid().to_hex();
                for peer in primary.peers() {
                    if let Err(e) = ns
                        .transport
                        .heartbeat(peer, &ns.name, &fid_hex, &ns.advertise_address)
                        .await
                    {
                        tracing::debug!(peer = %peer, fid = %fid_hex, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    /// Seal every open primary (explicit flush or shutdown drain)
    pub fn flush(&self) {
        let all: Vec<Arc<Primary>> = self.primaries.read().unwrap().values().cloned().collect();
        for primary in all {
            self.seal_primary(&primary);
        }
    }

    // ============ Read path ============

    /// Stream one blob. Resolution order: local primary file, the owning
    /// node (unless `local_only`), then a ranged object-store GET.
    pub async fn read(&self, config: ReadConfig) -> Result<BlobRead> {
        self.metrics.reads.inc();
        let id = config.id;

        if id.fid.machine_ip() == self.advertise_ip {
            let resident = self.primaries.read().unwrap().get(&id.fid).cloned();
            if let Some(primary) = resident {
                if primary.has_local_file() {
                    match self.read_local(&primary, &id).await {
                        Ok(read) => return Ok(read),
                        // The file can vanish between the check and the
                        // open when a settle races the read.
                        Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        } else if !config.local_only {
            match self.forward_read(&id).await {
                Ok(read) => {
                    self.metrics.reads_forwarded.inc();
                    return Ok(read);
                }
                Err(e @ Error::NotPossible(_)) => return Err(e),
                Err(e) => {
                    tracing::debug!(id = %id, error = %e, "owner read failed; trying object store");
                }
            }
        }

        self.read_from_store(&id).await
    }

    async fn read_local(&self, primary: &Arc<Primary>, id: &BlobId) -> Result<BlobRead> {
        let end = id.offset + id.length as u64;
        if end > primary.size() {
            return Err(Error::NotFound(format!(
                "blob {} ends at {} but primary holds {} bytes",
                id,
                end,
                primary.size()
            )));
        }

        let mut file = match tokio::fs::File::open(primary.path()).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.to_hex()));
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(std::io::SeekFrom::Start(id.offset)).await?;
        self.metrics.read_bytes.add(id.length as u64);
        Ok(BlobRead {
            length: id.length as u64,
            reader: Box::new(file.take(id.length as u64)),
        })
    }

    async fn forward_read(&self, id: &BlobId) -> Result<BlobRead> {
        let url = format!(
            "http://{}:{}/{}/{}",
            id.fid.machine_ip(),
            self.peer_port,
            self.name,
            id.to_hex()
        );
        let response = self
            .http
            .get(&url)
            .header(HDR_LOCAL_ONLY, "true")
            .send()
            .await
            .map_err(|e| Error::PeerUnreachable {
                address: id.fid.machine_ip().to_string(),
                reason: e.to_string(),
            })?;

        match response.status().as_u16() {
            200 => {
                let stream = response
                    .bytes_stream()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
                Ok(BlobRead {
                    length: id.length as u64,
                    reader: Box::new(StreamReader::new(Box::pin(stream))),
                })
            }
            404 => Err(Error::NotFound(id.to_hex())),
            400 => Err(Error::NotPossible(format!(
                "owner refused range read of {}",
                id
            ))),
            other => Err(Error::Transient(format!(
                "owner returned status {} for {}",
                other, id
            ))),
        }
    }

    async fn read_from_store(&self, id: &BlobId) -> Result<BlobRead> {
        if self.encoding == Encoding::Lz4 {
            return Err(Error::NotPossible(format!(
                "namespace {} stores compressed objects; range reads are unavailable",
                self.name
            )));
        }

        let key = self.object_key(&id.fid.to_hex());
        let end = id.offset + id.length as u64;
        let bytes = self.store.get_range(&key, id.offset, end).await?;
        if bytes.len() as u64 != id.length as u64 {
            return Err(Error::NotFound(format!(
                "object {} returned {} bytes for a {} byte blob",
                key,
                bytes.len(),
                id.length
            )));
        }

        self.metrics.reads_object_store.inc();
        self.metrics.read_bytes.add(id.length as u64);
        Ok(BlobRead {
            length: id.length as u64,
            reader: Box::new(std::io::Cursor::new(bytes.to_vec())),
        })
    }

    fn object_key(&self, fid_hex: &str) -> String {
        match self.encoding {
            Encoding::Raw => format!("{}/{}", self.name, fid_hex),
            Encoding::Lz4 => format!("{}/{}.lz4", self.name, fid_hex),
        }
    }

    // ============ Replica control plane ============

    /// INITIALIZE from a remote owner: create an empty replica file
    pub async fn replica_initialize(&self, fid: &str, owner: &str) -> Result<()> {
        validate_fid(fid)?;
        {
            let replicas = self.replicas.read().unwrap();
            if replicas.contains_key(fid) {
                // The owner retried; the empty replica is already there.
                return Ok(());
            }
        }

        let token = self.delay.token();
        let replica = Replica::create(
            &self.replica_dir,
            fid,
            owner,
            self.settings.orphan_timeout(),
            token,
        )?;
        self.replicas
            .write()
            .unwrap()
            .insert(fid.to_string(), Arc::clone(&replica));
        self.metrics.replicas_created.inc();
        self.metrics.replica_files.inc();
        self.arm_orphan_token(&replica);

        tracing::info!(namespace = %self.name, fid, owner, "replica initialized");
        Ok(())
    }

    /// REPLICATE from a remote owner: append one chunk in order
    pub async fn replica_replicate(
        &self,
        fid: &str,
        start: u64,
        end: u64,
        hash: u32,
        body: Bytes,
    ) -> Result<()> {
        let replica = self.lookup_replica(fid)?;
        self.metrics.replicate_calls.inc();

        match replica.append(start, end, hash, &body, self.settings.orphan_timeout()) {
            Ok(()) => {
                self.metrics.replicate_bytes.add(body.len() as u64);
                self.arm_orphan_token(&replica);
                Ok(())
            }
            Err(e @ Error::ChecksumMismatch { .. }) => {
                self.metrics.replicate_rejected.inc();
                // The replica already moved itself to Uploading; get the
                // surviving prefix into the store.
                self.delay.cancel(replica.token());
                if let Some(ns) = self.weak_self.upgrade() {
                    tokio::spawn(async move {
                        ns.run_replica_upload(replica).await;
                    });
                }
                Err(e)
            }
            Err(e) => {
                self.metrics.replicate_rejected.inc();
                Err(e)
            }
        }
    }

    /// HEARTBEAT from a remote owner
    pub async fn replica_heartbeat(&self, fid: &str, owner: &str) -> Result<()> {
        let replica = self.lookup_replica(fid)?;
        self.metrics.heartbeats_received.inc();
        replica.touch(self.settings.orphan_timeout(), owner);
        self.arm_orphan_token(&replica);
        Ok(())
    }

    /// DELETE from a remote owner: the primary is uploaded, drop the mirror
    pub async fn replica_queue_delete(&self, fid: &str) -> Result<()> {
        let replica = self.lookup_replica(fid)?;
        self.delay.cancel(replica.token());
        let prior = replica.queue_delete()?;
        self.replicas.write().unwrap().remove(fid);
        self.metrics.replicas_deleted.inc();
        self.metrics.replica_files.dec();
        if replica.was_orphaned() {
            self.metrics.orphaned_replicas.dec();
        }
        tracing::info!(namespace = %self.name, fid, ?prior, "replica deleted");
        Ok(())
    }

    fn lookup_replica(&self, fid: &str) -> Result<Arc<Replica>> {
        self.replicas
            .read()
            .unwrap()
            .get(fid)
            .cloned()
            .ok_or_else(|| Error::ReplicaNotFound(fid.to_string()))
    }

    fn arm_orphan_token(&self, replica: &Arc<Replica>) {
        let weak = self.weak_self.clone();
        let replica_for_cb = Arc::clone(replica);
        self.delay.alter(
            replica.token(),
            Instant::now() + self.settings.orphan_timeout(),
            move || {
                if let Some(ns) = weak.upgrade() {
                    ns.on_replica_expired(replica_for_cb);
                }
            },
        );
    }

    /// Orphan deadline passed without a heartbeat
    fn on_replica_expired(&self, replica: Arc<Replica>) {
        if !replica.mark_orphaned() {
            return;
        }
        tracing::warn!(
            namespace = %self.name,
            fid = %replica.fid(),
            owner = %replica.owner(),
            "replica orphaned; scheduling self-upload"
        );
        self.metrics.replicas_orphaned.inc();
        self.metrics.orphaned_replicas.inc();

        if replica.try_begin_upload() {
            if let Some(ns) = self.weak_self.upgrade() {
                tokio::spawn(async move {
                    ns.run_replica_upload(replica).await;
                });
            }
        }
    }

    fn run_replica_upload(
        self: Arc<Self>,
        replica: Arc<Replica>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.run_replica_upload_inner(replica))
    }

    async fn run_replica_upload_inner(self: Arc<Self>, replica: Arc<Replica>) {
        if replica.state() == ReplicaState::Deleted {
            return;
        }

        let key = self.object_key(replica.fid());
        self.metrics.uploads_inflight.inc();
        let result = self
            .uploader
            .upload_file(&key, replica.path(), self.encoding)
            .await;
        self.metrics.uploads_inflight.dec();

        match result {
            Ok(()) => {
                self.metrics.uploads.inc();
                self.metrics.upload_bytes.add(replica.size());
                if let Err(e) = replica.complete_upload() {
                    tracing::warn!(fid = %replica.fid(), error = %e, "replica cleanup failed");
                }
                tracing::info!(namespace = %self.name, fid = %replica.fid(), "replica self-uploaded");
            }
            Err(e) => {
                self.metrics.upload_failures.inc();
                let attempt = replica.next_upload_attempt();
                if e.is_retryable() && attempt < self.uploader.max_attempts() {
                    let backoff = self.uploader.backoff(attempt);
                    tracing::warn!(
                        fid = %replica.fid(),
                        attempt,
                        error = %e,
                        "replica upload failed; retrying in {:?}",
                        backoff
                    );
                    let weak = Arc::downgrade(&self);
                    let token = replica.token();
                    self.delay.alter(token, Instant::now() + backoff, move || {
                        if let Some(ns) = weak.upgrade() {
                            tokio::spawn(ns.run_replica_upload(replica));
                        }
                    });
                } else {
                    tracing::error!(
                        fid = %replica.fid(),
                        attempt,
                        error = %e,
                        "replica upload abandoned; file parked on disk"
                    );
                }
            }
        }
    }

    // ============ Startup replay ============

    /// Rebuild registry state by scanning the data directories. Leftover
    /// primaries are sealed and queued for upload; leftover replicas wait
    /// for their owner to catch up or for the orphan timer.
    fn scan_existing(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.primary_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(fid) = Fid::from_hex(&name) else {
                tracing::warn!(file = %name, "skipping unrecognized file in primary dir");
                continue;
            };
            let primary = Primary::open_existing(
                entry.path(),
                fid,
                self.settings.max_file_size,
                self.delay.token(),
            )?;
            tracing::info!(
                namespace = %self.name,
                fid = %name,
                size = primary.size(),
                "recovered sealed primary; scheduling upload"
            );
            self.primaries
                .write()
                .unwrap()
                .insert(fid, Arc::clone(&primary));
            self.maybe_begin_upload(&primary);
        }

        for entry in std::fs::read_dir(&self.replica_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_fid(&name).is_err() {
                tracing::warn!(file = %name, "skipping unrecognized file in replica dir");
                continue;
            }
            let replica = Replica::open_existing(
                entry.path(),
                &name,
                self.settings.orphan_timeout(),
                self.delay.token(),
            )?;
            tracing::info!(
                namespace = %self.name,
                fid = %name,
                size = replica.size(),
                "recovered replica; awaiting owner catch-up"
            );
            self.replicas
                .write()
                .unwrap()
                .insert(name, Arc::clone(&replica));
            self.metrics.replica_files.inc();
            self.arm_orphan_token(&replica);
        }

        Ok(())
    }

    // ============ Introspection ============

    /// Raw file listing for sidecar processors
    pub fn blast_status(&self) -> Vec<PrimaryStatus> {
        let mut listing: Vec<PrimaryStatus> = self
            .primaries
            .read()
            .unwrap()
            .values()
            .map(|p| p.status())
            .collect();
        listing.sort_by(|a, b| a.fid.cmp(&b.fid));
        listing
    }

    /// Raw range read from a resident primary file
    pub fn blast_read(&self, fid: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let fid = Fid::from_hex(fid)?;
        let primary = self
            .primaries
            .read()
            .unwrap()
            .get(&fid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no resident primary {}", fid)))?;
        primary.read_range(start, end)
    }

    /// Human-readable breakdown of a blob id
    pub fn debug_id(&self, id: &str) -> Result<String> {
        let id = BlobId::parse(id)?;
        let fid_hex = id.fid.to_hex();
        let mut out = String::new();
        out.push_str(&format!("blob id:   {}\n", id));
        out.push_str(&format!(
            "fid:       {}\n",
            id.fid.render("%F (time=%T ip=%L seq=%K)")
        ));
        out.push_str(&format!(
            "issued at: {}\n",
            chrono::DateTime::<chrono::Utc>::from(id.fid.timestamp()).to_rfc3339()
        ));
        out.push_str(&format!("offset:    {}\n", id.offset));
        out.push_str(&format!("length:    {}\n", id.length));
        out.push_str(&format!(
            "owner:     {}:{}\n",
            id.fid.machine_ip(),
            self.peer_port
        ));
        out.push_str(&format!("object:    {}\n", self.object_key(&fid_hex)));

        let local = id.fid.machine_ip() == self.advertise_ip;
        out.push_str(&format!("local:     {}\n", local));
        if let Some(primary) = self.primaries.read().unwrap().get(&id.fid) {
            out.push_str(&format!(
                "primary:   state={:?} size={}\n",
                primary.state(),
                primary.size()
            ));
        }
        if let Some(replica) = self.replicas.read().unwrap().get(&fid_hex) {
            out.push_str(&format!(
                "replica:   state={:?} size={}\n",
                replica.state(),
                replica.size()
            ));
        }
        Ok(out)
    }

    /// Namespace health: a primary must be open or openable, orphans must
    /// stay under the threshold, and the data volume needs headroom.
    pub fn health(&self) -> (bool, String) {
        let mut reasons = Vec::new();

        let open = self.open_primary_count();
        let available = self
            .peers
            .iter()
            .filter(|p| self.transport.is_available(p))
            .count();
        if open == 0 && available < self.replica_count {
            reasons.push(format!(
                "no open primary and only {}/{} peers available",
                available, self.replica_count
            ));
        }

        let orphans = self.metrics.orphaned_replicas.get();
        if orphans > self.settings.orphan_threshold as i64 {
            reasons.push(format!(
                "{} orphaned replicas exceed threshold {}",
                orphans, self.settings.orphan_threshold
            ));
        }

        if let Some(free) = disk_free_bytes(&self.data_dir) {
            if free < self.settings.min_free_bytes {
                reasons.push(format!(
                    "{} bytes free on data volume, below the {} byte floor",
                    free, self.settings.min_free_bytes
                ));
            }
        }

        if reasons.is_empty() {
            (true, "ok".to_string())
        } else {
            (false, reasons.join("\n"))
        }
    }

    /// Full status for operators
    pub fn status(&self) -> NamespaceStatus {
        let (healthy, reason) = self.health();
        let mut replicas: Vec<ReplicaStatus> = self
            .replicas
            .read()
            .unwrap()
            .values()
            .map(|r| r.status())
            .collect();
        replicas.sort_by(|a, b| a.fid.cmp(&b.fid));

        NamespaceStatus {
            name: self.name.clone(),
            healthy,
            reason,
            shutting_down: self.is_shutting_down(),
            idle: self.idle.len(),
            waiting: self.idle.waiting(),
            primaries: self.blast_status(),
            replicas,
            metrics: self.get_metrics(),
        }
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        // Parked inserters are tracked by the idle list itself so that a
        // cancelled insert cannot skew the gauge.
        snapshot.queued_inserts = self.idle.waiting() as i64;
        snapshot
    }
}

/// Operator-facing status of one namespace
#[derive(Debug, Serialize)]
pub struct NamespaceStatus {
    pub name: String,
    pub healthy: bool,
    pub reason: String,
    pub shutting_down: bool,
    pub idle: usize,
    pub waiting: usize,
    pub primaries: Vec<PrimaryStatus>,
    pub replicas: Vec<ReplicaStatus>,
    pub metrics: MetricsSnapshot,
}

/// Releases a checked-out primary on every exit path of an insert,
/// including cancellation. A primary left at a clean chunk boundary goes
/// back into rotation; one with a half-replicated chunk is drained because
/// its replica prefixes can no longer be proven equal.
struct InsertGuard {
    ns: Weak<NamespaceStorage>,
    primary: Arc<Primary>,
    dirty: bool,
    drain: bool,
    released: bool,
}

impl InsertGuard {
    fn new(ns: Weak<NamespaceStorage>, primary: Arc<Primary>) -> Self {
        Self {
            ns,
            primary,
            dirty: false,
            drain: false,
            released: false,
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn force_drain(&mut self) {
        self.drain = true;
    }
}

impl Drop for InsertGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.primary.finish_insert();

        let Some(ns) = self.ns.upgrade() else {
            return;
        };
        let reusable = !self.dirty
            && !self.drain
            && self.primary.state() == PrimaryState::Open
            && !self.primary.should_seal();
        if reusable {
            ns.idle.put(Arc::clone(&self.primary));
        } else {
            ns.seal_primary(&self.primary);
        }
    }
}

/// Fill `buf` from the stream, short only at EOF
async fn read_chunk(
    source: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A replica fid must look like a fid this system minted
fn validate_fid(fid: &str) -> Result<()> {
    if fid.len() != FID_HEX_LEN || !fid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidId(format!("malformed fid {:?}", fid)));
    }
    Ok(())
}

/// Free space on the volume holding `path`
fn disk_free_bytes(path: &std::path::Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, ObjectStoreConfig, UploadConfig};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-process transport: every peer address resolves to one target
    /// namespace, so a two-node cluster fits in a single test.
    struct LoopbackTransport {
        target: StdMutex<Option<Arc<NamespaceStorage>>>,
        fail_replicates: AtomicBool,
    }

    impl LoopbackTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                target: StdMutex::new(None),
                fail_replicates: AtomicBool::new(false),
            })
        }

        fn connect(&self, target: &Arc<NamespaceStorage>) {
            *self.target.lock().unwrap() = Some(Arc::clone(target));
        }

        fn set_failing(&self, failing: bool) {
            self.fail_replicates.store(failing, Ordering::Relaxed);
        }

        fn peer(&self) -> Result<Arc<NamespaceStorage>> {
            if self.fail_replicates.load(Ordering::Relaxed) {
                return Err(Error::PeerUnreachable {
                    address: "loopback".into(),
                    reason: "induced failure".into(),
                });
            }
            self.target
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::Internal("loopback not connected".into()))
        }
    }

    #[async_trait]
    impl ReplicaTransport for LoopbackTransport {
        async fn initialize(&self, _peer: &str, _ns: &str, fid: &str, owner: &str) -> Result<()> {
            self.peer()?.replica_initialize(fid, owner).await
        }

        async fn replicate(
            &self,
            _peer: &str,
            _ns: &str,
            fid: &str,
            start: u64,
            end: u64,
            hash: u32,
            body: Bytes,
        ) -> Result<()> {
            self.peer()?
                .replica_replicate(fid, start, end, hash, body)
                .await
        }

        async fn heartbeat(&self, _peer: &str, _ns: &str, fid: &str, owner: &str) -> Result<()> {
            self.peer()?.replica_heartbeat(fid, owner).await
        }

        async fn delete(&self, _peer: &str, _ns: &str, fid: &str) -> Result<()> {
            self.peer()?.replica_queue_delete(fid).await
        }
    }

    struct Cluster {
        owner: Arc<NamespaceStorage>,
        peer: Arc<NamespaceStorage>,
        transport: Arc<LoopbackTransport>,
        store: Arc<dyn ObjectStore>,
        _dirs: (TempDir, TempDir, TempDir),
    }

    fn test_config(data_dir: &std::path::Path, ip: [u8; 4]) -> BlobbyConfig {
        BlobbyConfig {
            node: NodeConfig {
                advertise_ip: Ipv4Addr::from(ip),
                peer_port: Some(7420),
                data_dir: data_dir.to_path_buf(),
                shutdown_grace_secs: 5,
            },
            storage: StorageConfig {
                max_open_files: 4,
                max_file_size: 1024,
                max_file_age_secs: 3600,
                orphan_timeout_secs: 0,
                chunk_size: 64,
                fsync: false,
                min_free_bytes: 0,
                orphan_threshold: 16,
            },
            replication: Default::default(),
            upload: UploadConfig {
                max_concurrent_uploads: 2,
                max_upload_attempts: 3,
                backoff_base_ms: 50,
                max_backoff_secs: 1,
                part_size: 8 * 1024 * 1024,
            },
            object_store: ObjectStoreConfig {
                backend: "local_fs".into(),
                bucket: String::new(),
                region: "us-east-1".into(),
                endpoint: None,
                access_key: None,
                secret_key: None,
                credentials_file: None,
                path_style: false,
                root: None,
            },
            api: Default::default(),
            logging: Default::default(),
            metrics: Default::default(),
            namespaces: vec![],
        }
    }

    fn ns_config(replica_count: usize) -> NamespaceConfig {
        NamespaceConfig {
            name: "photos".into(),
            peers: if replica_count > 0 {
                vec!["10.9.0.2:7420".into()]
            } else {
                vec![]
            },
            replica_count,
            encoding: Encoding::Raw,
        }
    }

    /// Owner node replicating to one peer node, sharing an object store
    async fn two_node_cluster() -> Cluster {
        two_node_cluster_with(|_| {}).await
    }

    async fn two_node_cluster_with(tweak: impl Fn(&mut BlobbyConfig)) -> Cluster {
        let owner_dir = tempfile::tempdir().unwrap();
        let peer_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(
            crate::store::LocalFsStore::new(store_dir.path().to_path_buf()).unwrap(),
        );
        let transport = LoopbackTransport::new();
        let delay = DelayQueue::new();

        let mut owner_config = test_config(owner_dir.path(), [10, 9, 0, 1]);
        tweak(&mut owner_config);
        let mut peer_config = test_config(peer_dir.path(), [10, 9, 0, 2]);
        tweak(&mut peer_config);

        let uploader = Arc::new(Uploader::new(
            Arc::clone(&store),
            owner_config.upload.clone(),
        ));

        let owner = NamespaceStorage::start(
            &owner_config,
            &ns_config(1),
            transport.clone() as Arc<dyn ReplicaTransport>,
            Arc::clone(&store),
            Arc::clone(&uploader),
            Arc::clone(&delay),
        )
        .await
        .unwrap();

        let peer = NamespaceStorage::start(
            &peer_config,
            &ns_config(0),
            transport.clone() as Arc<dyn ReplicaTransport>,
            Arc::clone(&store),
            uploader,
            delay,
        )
        .await
        .unwrap();

        transport.connect(&peer);
        Cluster {
            owner,
            peer,
            transport,
            store,
            _dirs: (owner_dir, peer_dir, store_dir),
        }
    }

    async fn read_all(read: BlobRead) -> Vec<u8> {
        let mut out = Vec::new();
        let mut reader = read.reader;
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..200 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition never became true");
    }

    async fn wait_for_object(store: &Arc<dyn ObjectStore>, key: &str) {
        for _ in 0..200 {
            if store.exists(key).await.unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("object {} never appeared", key);
    }

    #[tokio::test]
    async fn test_insert_read_round_trip() {
        let cluster = two_node_cluster().await;
        let payload = vec![b'A'; 100];

        let id = cluster
            .owner
            .insert(InsertData::from_bytes(payload.clone()))
            .await
            .unwrap();
        assert_eq!(id.length, 100);
        assert_eq!(id.offset, 0);
        assert_eq!(id.fid.machine_ip(), Ipv4Addr::new(10, 9, 0, 1));

        let read = cluster
            .owner
            .read(ReadConfig {
                id,
                local_only: false,
            })
            .await
            .unwrap();
        assert_eq!(read.length, 100);
        assert_eq!(read_all(read).await, payload);

        // The peer holds an identical mirror.
        let fid_hex = id.fid.to_hex();
        let replica = cluster.peer.lookup_replica(&fid_hex).unwrap();
        assert_eq!(replica.size(), 100);
        assert_eq!(replica.read_range(0, 100).unwrap(), payload);

        let snapshot = cluster.owner.get_metrics();
        assert_eq!(snapshot.inserts, 1);
        assert_eq!(snapshot.insert_bytes, 100);
    }

    #[tokio::test]
    async fn test_sequential_inserts_share_a_primary() {
        let cluster = two_node_cluster().await;

        let id1 = cluster
            .owner
            .insert(InsertData::from_bytes(vec![1; 10]))
            .await
            .unwrap();
        let id2 = cluster
            .owner
            .insert(InsertData::from_bytes(vec![2; 20]))
            .await
            .unwrap();

        assert_eq!(id1.fid, id2.fid);
        assert_eq!(id2.offset, 10);

        let read = cluster
            .owner
            .read(ReadConfig {
                id: id2,
                local_only: false,
            })
            .await
            .unwrap();
        assert_eq!(read_all(read).await, vec![2; 20]);
    }

    #[tokio::test]
    async fn test_zero_length_insert() {
        let cluster = two_node_cluster().await;
        let id = cluster
            .owner
            .insert(InsertData::from_bytes(vec![]))
            .await
            .unwrap();
        assert_eq!(id.length, 0);

        let read = cluster
            .owner
            .read(ReadConfig {
                id,
                local_only: false,
            })
            .await
            .unwrap();
        assert_eq!(read.length, 0);
        assert!(read_all(read).await.is_empty());
    }

    #[tokio::test]
    async fn test_seal_by_size_rotates_primaries() {
        let cluster = two_node_cluster().await;

        let id1 = cluster
            .owner
            .insert(InsertData::from_bytes(vec![1; 900]))
            .await
            .unwrap();
        // Crosses the 1024 byte seal point: committed, then drained.
        let id2 = cluster
            .owner
            .insert(InsertData::from_bytes(vec![2; 200]))
            .await
            .unwrap();
        assert_eq!(id1.fid, id2.fid);
        assert_eq!(id2.offset, 900);

        // The sealed file uploads and settles; the peer replica is deleted.
        let key = format!("photos/{}", id1.fid.to_hex());
        wait_for_object(&cluster.store, &key).await;

        // A third insert lands on a fresh primary.
        let id3 = cluster
            .owner
            .insert(InsertData::from_bytes(vec![3; 10]))
            .await
            .unwrap();
        assert_ne!(id3.fid, id1.fid);
        assert_eq!(id3.offset, 0);

        // The uploaded blob still reads back, now from the object store.
        let read = cluster
            .owner
            .read(ReadConfig {
                id: id2,
                local_only: false,
            })
            .await
            .unwrap();
        assert_eq!(read_all(read).await, vec![2; 200]);
    }

    #[tokio::test]
    async fn test_replica_failure_drains_primary() {
        let cluster = two_node_cluster().await;

        let id1 = cluster
            .owner
            .insert(InsertData::from_bytes(vec![1; 10]))
            .await
            .unwrap();

        cluster.transport.set_failing(true);
        let err = cluster
            .owner
            .insert(InsertData::from_bytes(vec![2; 10]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // The broken primary left rotation.
        let primary = cluster
            .owner
            .primaries
            .read()
            .unwrap()
            .get(&id1.fid)
            .cloned()
            .unwrap();
        assert!(primary.state() >= PrimaryState::Draining);

        // With the peer back, a retried insert provisions a new primary.
        cluster.transport.set_failing(false);
        let id3 = cluster
            .owner
            .insert(InsertData::from_bytes(vec![3; 10]))
            .await
            .unwrap();
        assert_ne!(id3.fid, id1.fid);
        assert_eq!(cluster.owner.get_metrics().inserts_failed, 1);
    }

    #[tokio::test]
    async fn test_flush_uploads_and_settles() {
        let cluster = two_node_cluster().await;
        let id = cluster
            .owner
            .insert(InsertData::from_bytes(vec![7; 500]))
            .await
            .unwrap();

        cluster.owner.flush();

        let owner = Arc::clone(&cluster.owner);
        let fid = id.fid;
        wait_until(move || !owner.primaries.read().unwrap().contains_key(&fid)).await;

        // Peer replica was released by the owner's DELETE.
        assert!(cluster
            .peer
            .lookup_replica(&id.fid.to_hex())
            .is_err());

        // Reads now come from the object store.
        let read = cluster
            .owner
            .read(ReadConfig {
                id,
                local_only: false,
            })
            .await
            .unwrap();
        assert_eq!(read_all(read).await, vec![7; 500]);
        assert!(cluster.owner.get_metrics().reads_object_store >= 1);
    }

    #[tokio::test]
    async fn test_unknown_length_insert() {
        let cluster = two_node_cluster().await;
        let body = vec![9u8; 150];
        let id = cluster
            .owner
            .insert(InsertData::new(-1, Box::new(std::io::Cursor::new(body.clone()))))
            .await
            .unwrap();
        assert_eq!(id.length, 150);

        let read = cluster
            .owner
            .read(ReadConfig {
                id,
                local_only: false,
            })
            .await
            .unwrap();
        assert_eq!(read_all(read).await, body);
    }

    #[tokio::test]
    async fn test_unknown_length_hitting_file_limit_drains() {
        let cluster = two_node_cluster().await;
        // More than max_file_size with no length hint
        let body = vec![0u8; 2048];
        let err = cluster
            .owner
            .insert(InsertData::new(-1, Box::new(std::io::Cursor::new(body))))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient(_)));

        // The capped primary drained; the next insert gets a fresh one.
        let id = cluster
            .owner
            .insert(InsertData::from_bytes(vec![1; 10]))
            .await
            .unwrap();
        assert_eq!(id.offset, 0);
    }

    #[tokio::test]
    async fn test_orphaned_replica_self_uploads() {
        let cluster = two_node_cluster_with(|c| {
            c.storage.orphan_timeout_secs = 1;
        })
        .await;

        // A replica whose owner never heartbeats.
        cluster
            .peer
            .replica_initialize("000000640a0900020001", "10.9.0.99:7420")
            .await
            .unwrap();
        let body = b"orphan bytes".to_vec();
        cluster
            .peer
            .replica_replicate(
                "000000640a0900020001",
                0,
                body.len() as u64,
                crc32fast::hash(&body),
                Bytes::from(body.clone()),
            )
            .await
            .unwrap();

        wait_for_object(&cluster.store, "photos/000000640a0900020001").await;

        let replica = cluster
            .peer
            .lookup_replica("000000640a0900020001")
            .unwrap();
        assert_eq!(replica.state(), ReplicaState::Uploaded);
        assert!(!replica.path().exists());

        // A late DELETE from the owner is accepted with no disk effect.
        cluster
            .peer
            .replica_queue_delete("000000640a0900020001")
            .await
            .unwrap();
        assert!(cluster
            .peer
            .lookup_replica("000000640a0900020001")
            .is_err());
    }

    #[tokio::test]
    async fn test_startup_scan_recovers_files() {
        let owner_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let config = test_config(owner_dir.path(), [10, 9, 0, 1]);

        // Seed leftover files the way a crashed node would leave them.
        let primary_dir = config.primary_dir("photos");
        let replica_dir = config.replica_dir("photos");
        std::fs::create_dir_all(&primary_dir).unwrap();
        std::fs::create_dir_all(&replica_dir).unwrap();
        std::fs::write(primary_dir.join("000000640a0900010003"), b"sealed").unwrap();
        std::fs::write(replica_dir.join("000000640a0900020004"), b"mirrored").unwrap();
        std::fs::write(primary_dir.join("not-a-fid"), b"junk").unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(
            crate::store::LocalFsStore::new(store_dir.path().to_path_buf()).unwrap(),
        );
        let transport = LoopbackTransport::new();
        let delay = DelayQueue::new();
        let uploader = Arc::new(Uploader::new(Arc::clone(&store), config.upload.clone()));

        let storage = NamespaceStorage::start(
            &config,
            &ns_config(0),
            transport.clone() as Arc<dyn ReplicaTransport>,
            Arc::clone(&store),
            uploader,
            delay,
        )
        .await
        .unwrap();
        transport.connect(&storage);

        // The leftover primary uploads and settles.
        wait_for_object(&store, "photos/000000640a0900010003").await;

        // The leftover replica is re-registered at its on-disk size and the
        // owner can continue exactly where it stopped.
        let replica = storage.lookup_replica("000000640a0900020004").unwrap();
        assert_eq!(replica.size(), 8);
        storage
            .replica_replicate(
                "000000640a0900020004",
                8,
                10,
                crc32fast::hash(b"!!"),
                Bytes::from_static(b"!!"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_errors() {
        let cluster = two_node_cluster().await;

        // Unknown id owned by this node
        let bogus = BlobId::new(
            Fid::new(100, Ipv4Addr::new(10, 9, 0, 1), 1),
            0,
            10,
        );
        let err = cluster
            .owner
            .read(ReadConfig {
                id: bogus,
                local_only: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // Remote id with forwarding disabled falls straight to the store
        let remote = BlobId::new(
            Fid::new(100, Ipv4Addr::new(10, 9, 0, 42), 1),
            0,
            10,
        );
        let err = cluster
            .owner
            .read(ReadConfig {
                id: remote,
                local_only: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_lz4_namespace_refuses_store_reads() {
        let owner_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let config = test_config(owner_dir.path(), [10, 9, 0, 1]);

        let store: Arc<dyn ObjectStore> = Arc::new(
            crate::store::LocalFsStore::new(store_dir.path().to_path_buf()).unwrap(),
        );
        let transport = LoopbackTransport::new();
        let delay = DelayQueue::new();
        let uploader = Arc::new(Uploader::new(Arc::clone(&store), config.upload.clone()));

        let mut ns = ns_config(0);
        ns.encoding = Encoding::Lz4;
        let storage = NamespaceStorage::start(
            &config,
            &ns,
            transport.clone() as Arc<dyn ReplicaTransport>,
            Arc::clone(&store),
            uploader,
            delay,
        )
        .await
        .unwrap();
        transport.connect(&storage);

        let id = storage
            .insert(InsertData::from_bytes(vec![5; 50]))
            .await
            .unwrap();

        // Resident file still serves reads.
        let read = storage
            .read(ReadConfig {
                id,
                local_only: false,
            })
            .await
            .unwrap();
        assert_eq!(read_all(read).await, vec![5; 50]);

        // Once only the compressed object remains, reads are impossible.
        storage.flush();
        let probe = Arc::clone(&storage);
        let fid = id.fid;
        wait_until(move || !probe.primaries.read().unwrap().contains_key(&fid)).await;

        let err = storage
            .read(ReadConfig {
                id,
                local_only: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPossible(_)));
    }

    #[tokio::test]
    async fn test_blast_endpoints() {
        let cluster = two_node_cluster().await;
        let id = cluster
            .owner
            .insert(InsertData::from_bytes(b"blast data".to_vec()))
            .await
            .unwrap();

        let listing = cluster.owner.blast_status();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].fid, id.fid.to_hex());
        assert_eq!(listing[0].size, 10);

        let raw = cluster
            .owner
            .blast_read(&id.fid.to_hex(), 0, 5)
            .unwrap();
        assert_eq!(raw, b"blast");

        assert!(cluster.owner.blast_read(&id.fid.to_hex(), 0, 999).is_err());
    }

    #[tokio::test]
    async fn test_debug_id_and_health() {
        let cluster = two_node_cluster().await;
        let id = cluster
            .owner
            .insert(InsertData::from_bytes(vec![1; 10]))
            .await
            .unwrap();

        let debug = cluster.owner.debug_id(&id.to_hex()).unwrap();
        assert!(debug.contains(&id.fid.to_hex()));
        assert!(debug.contains("10.9.0.1"));
        assert!(cluster.owner.debug_id("nonsense").is_err());

        let (healthy, reason) = cluster.owner.health();
        assert!(healthy, "unexpected degradation: {}", reason);

        let status = cluster.owner.status();
        assert_eq!(status.name, "photos");
        assert_eq!(status.primaries.len(), 1);
        assert_eq!(status.metrics.inserts, 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_inserts() {
        let cluster = two_node_cluster().await;
        cluster.owner.begin_shutdown();
        let err = cluster
            .owner
            .insert(InsertData::from_bytes(vec![1; 10]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }
}
