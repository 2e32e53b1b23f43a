//! capstan - self-hosted S3-compatible object storage server

use capstan::api::handlers::AppState;
use capstan::catalog::Catalog;
use capstan::config::Config;
use capstan::credentials::CredentialCache;
use capstan::multipart::MultipartStore;
use capstan::router::build_router;
use capstan::storage::ObjectStore;
use clap::Parser;
use rand::distributions::{Alphanumeric, DistString};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    // e.g. "0.4.2 (built 2026-07-30T21:40:07Z)"
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("CAPSTAN_BUILD_TIME"),
        )
    })
}

/// capstan: S3-compatible object storage on your own disk
#[derive(Parser, Debug)]
#[command(name = "capstan")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Priority: RUST_LOG > CAPSTAN_LOG_LEVEL > --verbose > default
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("CAPSTAN_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("capstan=trace,tower_http=trace")
            } else {
                EnvFilter::new("capstan=info,tower_http=info")
            }
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    info!(
        "Starting capstan v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("CAPSTAN_BUILD_TIME"),
    );
    info!("  Listen address: {}", config.listen_addr);
    info!("  Buckets root:   {:?}", config.buckets_root);
    info!("  Multipart root: {:?}", config.multipart_root);
    info!("  Catalog:        {:?}", config.catalog_path);
    info!("  Region:         {}", config.region);

    let catalog = Arc::new(Catalog::open(&config.catalog_path)?);

    // Bootstrap credentials so a fresh instance is reachable. Configured
    // pair wins; otherwise a random pair is minted and printed once.
    match config.root_credentials() {
        Some((key, secret)) => {
            catalog.bootstrap_root(key, secret)?;
            info!("  Root access key: {}", key);
        }
        None => {
            if catalog.active_access_keys()?.is_empty() {
                let key = format!(
                    "AK{}",
                    Alphanumeric
                        .sample_string(&mut rand::thread_rng(), 18)
                        .to_ascii_uppercase()
                );
                let secret = Alphanumeric.sample_string(&mut rand::thread_rng(), 40);
                catalog.bootstrap_root(&key, &secret)?;
                warn!("  No credentials configured; generated root pair:");
                warn!("    access key id:     {}", key);
                warn!("    secret access key: {}", secret);
            }
        }
    }

    let credentials = Arc::new(CredentialCache::from_catalog(&catalog)?);
    let objects = Arc::new(ObjectStore::new(config.buckets_root.clone()).await?);
    let multipart = Arc::new(MultipartStore::new(config.multipart_root.clone()).await?);

    // Sweep abandoned multipart scratch directories
    let max_age = Duration::from_secs(config.multipart_max_age_secs);
    spawn_periodic(Duration::from_secs(300), {
        let mp = multipart.clone();
        move || mp.cleanup_expired(max_age)
    });

    let state = Arc::new(AppState {
        catalog,
        credentials,
        objects,
        multipart,
        region: config.region.clone(),
        max_body_size: config.max_body_size,
    });

    let app = build_router(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("capstan listening on http://{}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Spawn a background task that runs `f` every `interval`.
fn spawn_periodic(interval: Duration, f: impl Fn() + Send + 'static) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            f();
        }
    });
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
