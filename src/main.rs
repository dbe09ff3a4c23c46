//! s3gateway -- S3-compatible protocol gateway.
//!
//! Every startup is a recovery: the temp directory is cleared and stale
//! multipart uploads are reaped before the listeners open.  SIGTERM/SIGINT
//! stop accepting connections and wait up to `server.shutdown_timeout`
//! for in-flight requests.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use s3gateway::config::{Config, LoggingConfig};
use s3gateway::metadata::sqlite::SqliteMetadataStore;
use s3gateway::metadata::store::MetadataStore;
use s3gateway::service::{Gateway, GatewaySettings};
use s3gateway::storage::backend::StorageBackend;
use s3gateway::storage::local::LocalBackend;
use s3gateway::{rpc, server, AppState};

/// Command-line arguments for the gateway.
#[derive(Parser, Debug)]
#[command(name = "s3gateway", version, about = "S3-compatible protocol gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "s3gateway.example.yaml")]
    config: String,

    /// Override the S3 bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = s3gateway::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let state = Arc::new(build_state(config).await?);
    let config = &state.config;

    let s3_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let (stop_tx, stop_rx) = watch::channel(false);

    let s3_listener = TcpListener::bind(&s3_addr).await?;
    info!("S3 listener on {}", s3_addr);
    let mut servers = vec![tokio::spawn(serve(
        s3_listener,
        server::app(Arc::clone(&state)),
        stop_rx.clone(),
    ))];

    if config.rpc.enabled {
        let rpc_addr = format!("{}:{}", config.rpc.host, config.rpc.port);
        let rpc_listener = TcpListener::bind(&rpc_addr).await?;
        info!("RPC listener on {}", rpc_addr);
        servers.push(tokio::spawn(serve(
            rpc_listener,
            rpc::app(Arc::clone(&state)),
            stop_rx,
        )));
    }

    shutdown_signal().await;
    let _ = stop_tx.send(true);

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    let drained = tokio::time::timeout(grace, async {
        for server in servers {
            match server.await {
                Ok(Err(err)) => warn!("listener stopped with error: {err}"),
                Err(err) => warn!("listener task failed: {err}"),
                Ok(Ok(())) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            "Shutdown timeout of {}s elapsed with requests in flight",
            config.server.shutdown_timeout
        );
    }

    info!("s3gateway shut down");
    Ok(())
}

/// `RUST_LOG` overrides `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open the repositories, seed the bootstrap credential and run the
/// startup housekeeping.
async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let metadata_path = &config.metadata.sqlite.path;
    if metadata_path != ":memory:" {
        if let Some(parent) = std::path::Path::new(metadata_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = SqliteMetadataStore::new(metadata_path)?
        .with_default_quota(config.quota.default_user_quota);
    info!("SQLite metadata store initialized at {}", metadata_path);

    let auth = &config.auth;
    store.seed_credential(
        &auth.access_key,
        &auth.secret_key,
        &auth.owner_id,
        &auth.display_name,
    )?;
    info!(access_key = %auth.access_key, "Bootstrap credential seeded");

    let metadata: Arc<dyn MetadataStore> = Arc::new(store);
    let storage_root = &config.storage.local.root_dir;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(storage_root)?);
    info!("Local blob store initialized at {}", storage_root);

    match storage.cleanup_temp().await {
        Ok(0) => {}
        Ok(removed) => info!("Removed {removed} orphaned temp files"),
        Err(err) => warn!("Temp directory cleanup failed: {err}"),
    }

    let gateway = Gateway::new(
        Arc::clone(&metadata),
        storage,
        GatewaySettings::from_config(&config),
    );
    match gateway.reap_expired_uploads(config.multipart.upload_ttl).await {
        Ok(0) => {}
        Ok(reaped) => info!("Reaped {reaped} expired multipart uploads"),
        Err(err) => warn!("Multipart reaping failed: {err}"),
    }

    Ok(AppState {
        config,
        metadata,
        gateway,
    })
}

async fn serve(
    listener: TcpListener,
    app: Router,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
