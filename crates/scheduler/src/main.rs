//! Courier scheduler binary.

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::config::SchedulerConfig;
use courier_metadata::MetadataStore as _;
use courier_scheduler::carfile::{CarfileManager, SchedulerCtx};
use courier_scheduler::{AppState, LiveStore, NodeClient, NodeRegistry, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Courier scheduler
#[derive(Parser, Debug)]
#[command(name = "courier-schedulerd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "COURIER_SCHEDULER_CONFIG",
        default_value = "config/scheduler.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Courier scheduler v{}", env!("CARGO_PKG_VERSION"));

    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    }
    let config: SchedulerConfig = figment
        .merge(Env::prefixed("COURIER_SCHEDULER_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    let metadata: Arc<dyn courier_metadata::MetadataStore> = Arc::new(
        courier_metadata::SqliteStore::new(&config.database_path, &config.area)
            .await
            .context("failed to open metadata store")?,
    );
    tracing::info!(area = %config.area, "metadata store initialized");

    // nodes re-announce on reconnect; everything starts offline
    metadata.set_all_nodes_offline(&config.server_name).await?;

    let ctx = Arc::new(SchedulerCtx {
        metadata,
        live: Arc::new(LiveStore::new(config.caching.cache_error_ttl())),
        registry: Arc::new(NodeRegistry::new()),
        dispatcher: Arc::new(NodeClient::new(config.caching.api_timeout())),
        config: config.clone(),
    });

    let manager = CarfileManager::new(ctx);
    manager.run();
    tracing::info!("carfile manager loops spawned");

    let app = create_router(AppState::new(manager));
    let addr: SocketAddr = config.bind.parse().context("invalid bind address")?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
