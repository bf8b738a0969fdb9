//! Blobby Configuration
//!
//! Configuration structures for a Blobby node, loaded from TOML.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main Blobby configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobbyConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Storage tuning shared by all namespaces
    #[serde(default)]
    pub storage: StorageConfig,

    /// Replication client configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Upload pipeline configuration
    #[serde(default)]
    pub upload: UploadConfig,

    /// Object store backend
    pub object_store: ObjectStoreConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Namespaces served by this node
    #[serde(default, rename = "namespace")]
    pub namespaces: Vec<NamespaceConfig>,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// IPv4 address stamped into fids and advertised to peers
    pub advertise_ip: Ipv4Addr,

    /// Port peers use to reach this node (defaults to the API bind port)
    #[serde(default)]
    pub peer_port: Option<u16>,

    /// Data directory for primary and replica files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds to let in-flight inserts finish during shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Storage tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Concurrently open primary files per namespace
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,

    /// Seal-by-size threshold in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Seal-by-age threshold in seconds
    #[serde(default = "default_max_file_age_secs")]
    pub max_file_age_secs: u64,

    /// Replica heartbeat grace in seconds (0 = twice the file age)
    #[serde(default)]
    pub orphan_timeout_secs: u64,

    /// Streaming chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// fsync primary files when an insert commits
    #[serde(default = "default_fsync")]
    pub fsync: bool,

    /// Minimum free bytes on the data volume before health degrades
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Orphaned replicas tolerated before health degrades
    #[serde(default = "default_orphan_threshold")]
    pub orphan_threshold: usize,
}

/// Replication client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Consecutive failures before a peer is quarantined
    #[serde(default = "default_peer_failure_threshold")]
    pub peer_failure_threshold: u32,

    /// Window in seconds within which failures count as consecutive
    #[serde(default = "default_peer_failure_window_secs")]
    pub peer_failure_window_secs: u64,

    /// Seconds a quarantined peer is skipped by primary opening
    #[serde(default = "default_peer_quarantine_secs")]
    pub peer_quarantine_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Upload pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Uploads allowed in flight at once
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Attempts before an upload is parked for the operator
    #[serde(default = "default_max_upload_attempts")]
    pub max_upload_attempts: u32,

    /// Exponential backoff base in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in seconds
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Multipart part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: u64,
}

/// Object store backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Backend: "s3" or "local_fs"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Bucket name (s3)
    #[serde(default)]
    pub bucket: String,

    /// Region (s3)
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible stores (s3)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Static credentials (s3); prefer `credentials_file` in production
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,

    /// File holding `access_key` / `secret_key` as TOML (s3)
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// Use path-style addressing (s3)
    #[serde(default)]
    pub path_style: bool,

    /// Root directory (local_fs)
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Static credentials loaded from `credentials_file`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCredentials {
    pub access_key: String,
    pub secret_key: String,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the HTTP listener
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prefix applied to every exported Prometheus series
    #[serde(default = "default_prometheus_tag_prefix")]
    pub prometheus_tag_prefix: String,
}

/// Storage encoding for uploaded objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Raw bytes; range reads are served directly
    #[default]
    Raw,
    /// LZ4-compressed objects; blob range reads are not possible
    Lz4,
}

/// One served namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace name (first path segment on the wire)
    pub name: String,

    /// Peer node addresses (host:port) eligible to hold replicas
    #[serde(default)]
    pub peers: Vec<String>,

    /// Synchronous peer copies required per primary
    #[serde(default = "default_replica_count")]
    pub replica_count: usize,

    /// Object encoding for this namespace
    #[serde(default)]
    pub encoding: Encoding,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/blobby")
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_max_open_files() -> usize {
    4
}

fn default_max_file_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_max_file_age_secs() -> u64 {
    600 // 10 minutes
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_fsync() -> bool {
    true
}

fn default_min_free_bytes() -> u64 {
    4 * 1024 * 1024 * 1024 // 4 GiB
}

fn default_orphan_threshold() -> usize {
    16
}

fn default_peer_failure_threshold() -> u32 {
    3
}

fn default_peer_failure_window_secs() -> u64 {
    60
}

fn default_peer_quarantine_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_uploads() -> usize {
    2
}

fn default_max_upload_attempts() -> u32 {
    8
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_store_backend() -> String {
    "s3".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_replica_count() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:7420".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_prometheus_tag_prefix() -> String {
    "blobby".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_open_files: default_max_open_files(),
            max_file_size: default_max_file_size(),
            max_file_age_secs: default_max_file_age_secs(),
            orphan_timeout_secs: 0,
            chunk_size: default_chunk_size(),
            fsync: default_fsync(),
            min_free_bytes: default_min_free_bytes(),
            orphan_threshold: default_orphan_threshold(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peer_failure_threshold: default_peer_failure_threshold(),
            peer_failure_window_secs: default_peer_failure_window_secs(),
            peer_quarantine_secs: default_peer_quarantine_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
            max_upload_attempts: default_max_upload_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            part_size: default_part_size(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_tag_prefix: default_prometheus_tag_prefix(),
        }
    }
}

impl StorageConfig {
    /// Seal-by-age threshold as a Duration
    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age_secs)
    }

    /// Replica heartbeat grace as a Duration
    pub fn orphan_timeout(&self) -> Duration {
        if self.orphan_timeout_secs > 0 {
            Duration::from_secs(self.orphan_timeout_secs)
        } else {
            Duration::from_secs(self.max_file_age_secs * 2)
        }
    }

    /// Interval between owner heartbeats to replica peers
    pub fn heartbeat_interval(&self) -> Duration {
        self.orphan_timeout() / 4
    }
}

impl ReplicationConfig {
    pub fn peer_failure_window(&self) -> Duration {
        Duration::from_secs(self.peer_failure_window_secs)
    }

    pub fn peer_quarantine(&self) -> Duration {
        Duration::from_secs(self.peer_quarantine_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl UploadConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl BlobbyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: BlobbyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.namespaces.is_empty() {
            return Err(crate::Error::Config(
                "at least one [[namespace]] is required".into(),
            ));
        }
        for ns in &self.namespaces {
            if ns.name.is_empty() {
                return Err(crate::Error::Config("namespace.name cannot be empty".into()));
            }
            if ns.name.contains('/') {
                return Err(crate::Error::Config(format!(
                    "namespace name {:?} cannot contain '/'",
                    ns.name
                )));
            }
            if ns.replica_count > ns.peers.len() {
                return Err(crate::Error::Config(format!(
                    "namespace {:?} wants {} replicas but lists {} peers",
                    ns.name,
                    ns.replica_count,
                    ns.peers.len()
                )));
            }
        }
        if self.storage.chunk_size == 0 {
            return Err(crate::Error::Config("storage.chunk_size cannot be 0".into()));
        }
        if self.storage.max_open_files == 0 {
            return Err(crate::Error::Config(
                "storage.max_open_files cannot be 0".into(),
            ));
        }
        match self.object_store.backend.as_str() {
            "s3" => {
                if self.object_store.bucket.is_empty() {
                    return Err(crate::Error::Config(
                        "object_store.bucket is required for the s3 backend".into(),
                    ));
                }
            }
            "local_fs" => {
                if self.object_store.root.is_none() {
                    return Err(crate::Error::Config(
                        "object_store.root is required for the local_fs backend".into(),
                    ));
                }
            }
            other => {
                return Err(crate::Error::Config(format!(
                    "unknown object_store.backend {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Port peers use to reach this node
    pub fn peer_port(&self) -> u16 {
        if let Some(port) = self.node.peer_port {
            return port;
        }
        self.api
            .bind_address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(7420)
    }

    /// Address other nodes use to reach this one
    pub fn advertise_address(&self) -> String {
        format!("{}:{}", self.node.advertise_ip, self.peer_port())
    }

    /// Shutdown grace as a Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.node.shutdown_grace_secs)
    }

    /// Directory holding primary files for a namespace
    pub fn primary_dir(&self, namespace: &str) -> PathBuf {
        self.node.data_dir.join(namespace).join("primary")
    }

    /// Directory holding replica files for a namespace
    pub fn replica_dir(&self, namespace: &str) -> PathBuf {
        self.node.data_dir.join(namespace).join("replica")
    }
}

impl ObjectStoreConfig {
    /// Resolve static credentials, preferring the credentials file
    pub fn credentials(&self) -> crate::Result<Option<StoreCredentials>> {
        if let Some(path) = &self.credentials_file {
            let content = std::fs::read_to_string(path)?;
            let creds: StoreCredentials = toml::from_str(&content)?;
            return Ok(Some(creds));
        }
        match (&self.access_key, &self.secret_key) {
            (Some(access_key), Some(secret_key)) => Ok(Some(StoreCredentials {
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
            })),
            (None, None) => Ok(None),
            _ => Err(crate::Error::Config(
                "object_store.access_key and secret_key must be set together".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[node]
advertise_ip = "10.0.0.5"
data_dir = "/var/lib/blobby"

[storage]
max_file_size = 1073741824
max_file_age_secs = 600

[object_store]
backend = "local_fs"
root = "/tmp/blobby-store"

[[namespace]]
name = "photos"
peers = ["10.0.0.6:7420", "10.0.0.7:7420", "10.0.0.8:7420"]
replica_count = 2
"#;

    #[test]
    fn test_parse_config() {
        let config = BlobbyConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.node.advertise_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(config.namespaces.len(), 1);
        assert_eq!(config.namespaces[0].replica_count, 2);
        assert_eq!(config.namespaces[0].encoding, Encoding::Raw);
        assert_eq!(config.peer_port(), 7420);
        assert_eq!(config.advertise_address(), "10.0.0.5:7420");
    }

    #[test]
    fn test_orphan_timeout_defaults_to_twice_age() {
        let config = BlobbyConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(
            config.storage.orphan_timeout(),
            Duration::from_secs(1200)
        );
        assert_eq!(
            config.storage.heartbeat_interval(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_replica_count_exceeding_peers_rejected() {
        let toml = SAMPLE.replace("replica_count = 2", "replica_count = 9");
        assert!(BlobbyConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_missing_namespace_rejected() {
        let toml = r#"
[node]
advertise_ip = "10.0.0.5"

[object_store]
backend = "local_fs"
root = "/tmp/store"
"#;
        assert!(BlobbyConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let toml = SAMPLE
            .replace("backend = \"local_fs\"", "backend = \"s3\"")
            .replace("root = \"/tmp/blobby-store\"", "");
        assert!(BlobbyConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_lz4_encoding_parses() {
        let toml = SAMPLE.replace(
            "replica_count = 2",
            "replica_count = 2\nencoding = \"lz4\"",
        );
        let config = BlobbyConfig::from_toml(&toml).unwrap();
        assert_eq!(config.namespaces[0].encoding, Encoding::Lz4);
    }
}
