//! Blobby - Write-Optimized Blob Ingestion Service
//!
//! Accepts opaque payloads over HTTP, appends them into large local files,
//! replicates every append to peer nodes, and offloads sealed files to an
//! S3-family object store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blobby::api::HttpServer;
use blobby::config::BlobbyConfig;
use blobby::error::{Error, Result};
use blobby::storage::Node;

/// Blobby - Write-Optimized Blob Ingestion Service
#[derive(Parser)]
#[command(name = "blobby")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "blobby.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Blobby node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "blobby.toml")]
        output: PathBuf,
    },

    /// Validate the configuration file
    Validate,

    /// Query a running node's status
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:7420")]
        address: String,
    },

    /// Insert a file and print its blob id
    Insert {
        /// Namespace to insert into
        namespace: String,
        /// File to upload
        file: PathBuf,
        /// Node address
        #[arg(short, long, default_value = "localhost:7420")]
        address: String,
    },

    /// Fetch a blob to stdout
    Get {
        /// Namespace to read from
        namespace: String,
        /// Blob id
        id: String,
        /// Node address
        #[arg(short, long, default_value = "localhost:7420")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = BlobbyConfig::from_file(&cli.config)?;
            init_logging(&cli.log_level, &config);
            run_start(config).await?;
        }
        Commands::Init { output } => run_init(&output)?,
        Commands::Validate => {
            BlobbyConfig::from_file(&cli.config)?;
            println!("{} is valid", cli.config.display());
        }
        Commands::Status { address } => run_status(&address).await?,
        Commands::Insert {
            namespace,
            file,
            address,
        } => run_insert(&address, &namespace, &file).await?,
        Commands::Get {
            namespace,
            id,
            address,
        } => run_get(&address, &namespace, &id).await?,
    }

    Ok(())
}

/// Initialize logging per the config, with the CLI flag as fallback level
fn init_logging(level: &str, config: &BlobbyConfig) {
    let level = if config.logging.level.is_empty() {
        level
    } else {
        &config.logging.level
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run the node until SIGINT/SIGTERM, then drain within the grace period
async fn run_start(config: BlobbyConfig) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config.api.bind_address,
        "blobby starting"
    );

    let node = Node::start(config.clone()).await?;
    let server = HttpServer::new(config.api.clone(), Arc::clone(&node));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let signal_node = Arc::clone(&node);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received; draining");
        signal_node.shutdown().await;
        let _ = shutdown_tx.send(());
    });

    server
        .start(async {
            let _ = shutdown_rx.await;
        })
        .await?;

    tracing::info!("blobby stopped");
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Write a commented sample configuration
fn run_init(output: &PathBuf) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!(
            "{} already exists; refusing to overwrite",
            output.display()
        )));
    }

    let sample = r#"# Blobby node configuration

[node]
# IPv4 address stamped into blob ids; peers reach this node at
# advertise_ip:peer_port.
advertise_ip = "10.0.0.1"
data_dir = "/var/lib/blobby"
shutdown_grace_secs = 30

[storage]
max_open_files = 4
max_file_size = 1073741824   # 1 GiB
max_file_age_secs = 600
chunk_size = 65536
# orphan_timeout_secs = 1200 # default: twice max_file_age_secs

[replication]
peer_failure_threshold = 3
peer_failure_window_secs = 60
peer_quarantine_secs = 300

[upload]
max_concurrent_uploads = 2
max_upload_attempts = 8

[object_store]
backend = "s3"
bucket = "blobby-archive"
region = "us-east-1"
# endpoint = "https://storage.example.net"
# credentials_file = "/etc/blobby/store-credentials.toml"

[api]
bind_address = "0.0.0.0:7420"

[logging]
level = "info"
format = "pretty"

[metrics]
prometheus_tag_prefix = "blobby"

[[namespace]]
name = "photos"
peers = ["10.0.0.2:7420", "10.0.0.3:7420", "10.0.0.4:7420"]
replica_count = 2
# encoding = "lz4"           # compressed objects; disables range reads
"#;

    std::fs::write(output, sample)?;
    println!("wrote {}", output.display());
    Ok(())
}

async fn run_status(address: &str) -> Result<()> {
    let body = reqwest::get(format!("http://{}/statusz", address))
        .await
        .map_err(|e| Error::PeerUnreachable {
            address: address.to_string(),
            reason: e.to_string(),
        })?
        .text()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    println!("{}", body);
    Ok(())
}

async fn run_insert(address: &str, namespace: &str, file: &PathBuf) -> Result<()> {
    let bytes = tokio::fs::read(file).await?;
    let response = reqwest::Client::new()
        .post(format!("http://{}/{}", address, namespace))
        .body(bytes)
        .send()
        .await
        .map_err(|e| Error::PeerUnreachable {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    if !status.is_success() {
        return Err(Error::Transient(format!("insert failed ({}): {}", status, body)));
    }
    println!("{}", body);
    Ok(())
}

async fn run_get(address: &str, namespace: &str, id: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let response = reqwest::get(format!("http://{}/{}/{}", address, namespace, id))
        .await
        .map_err(|e| Error::PeerUnreachable {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Transient(format!("read failed ({}): {}", status, body)));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&bytes).await?;
    stdout.flush().await?;
    Ok(())
}
