//! casgate -- content-addressed object gateway.
//!
//! SIGTERM/SIGINT handlers only stop accepting connections and wait for
//! in-flight requests, bounded by `server.shutdown_timeout`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use casgate::config::Config;
use casgate::storage::backend::ObjectStore;

/// Command-line arguments for the casgate server.
#[derive(Parser, Debug)]
#[command(
    name = "casgate",
    version,
    about = "Content-addressed object gateway"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "casgate.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = casgate::config::load_config(&cli.config)?;
    init_tracing(&config);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        casgate::metrics::init_metrics();
        casgate::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    if config.auth.client_secret.is_empty() {
        warn!(
            "auth.client_secret is empty; every mutating request will be rejected (set {})",
            casgate::config::ENV_CLIENT_SECRET
        );
    }

    let store = build_store(&config).await?;
    let signer = casgate::build_signer(&config.signer)?;
    info!(
        "Upload signer initialized: endpoint={} bucket={} region={}",
        config.signer.endpoint, config.signer.bucket, config.signer.region
    );

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(casgate::AppState::new(config, store, Arc::new(signer)));
    let app = casgate::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("casgate listening on {}", bind_addr);

    // Stop accepting on SIGTERM/SIGINT, then give in-flight requests
    // `shutdown_timeout` to finish.
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown_signal().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!("Graceful shutdown timed out after {:?}", shutdown_timeout);
        }
    }

    info!("casgate shut down");

    Ok(())
}

/// Initialize tracing from the `logging` section; `RUST_LOG` wins when set.
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Initialize the backing store based on config.
async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.storage.backend.as_str() {
        "aws" => {
            let aws_config = config.storage.aws.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 'aws' but storage.aws config section is missing")
            })?;
            let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
            let store = casgate::storage::aws::AwsStore::new(
                aws_config.bucket.clone(),
                aws_config.region.clone(),
                non_empty(&aws_config.endpoint_url),
                aws_config.use_path_style,
                non_empty(&aws_config.access_key_id),
                non_empty(&aws_config.secret_access_key),
            )
            .await?;
            info!(
                "AWS object store initialized: bucket={} region={}",
                aws_config.bucket, aws_config.region
            );
            Arc::new(store)
        }
        "local" => {
            let root = &config.storage.local.root_dir;
            let store = casgate::storage::local::LocalStore::new(root)?;
            info!("Local object store initialized at {}", root);
            Arc::new(store)
        }
        "memory" => {
            let max = config.storage.memory.max_size_bytes;
            info!("Memory object store initialized (max_size_bytes={})", max);
            Arc::new(casgate::storage::memory::MemoryStore::new(max))
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected memory, local or aws)"),
    };
    Ok(store)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
