//! Courier node binary.

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::config::NodeConfig;
use courier_node::{
    CidFidIndex, Device, GatewayLoader, NodeState, PeerLoader, Pipeline, SchedulerClient,
    create_router,
};
use courier_signer::{DownloadVerifier, PublicKey};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Courier edge/candidate node
#[derive(Parser, Debug)]
#[command(name = "courier-noded")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "COURIER_NODE_CONFIG", default_value = "config/node.toml")]
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

    tracing::info!("Courier node v{}", env!("CARGO_PKG_VERSION"));

    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    }
    let config: NodeConfig = figment
        .merge(Env::prefixed("COURIER_NODE_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    let store: Arc<dyn courier_blockstore::BlockStore> = Arc::new(
        courier_blockstore::FilesystemStore::new(&config.store_path)
            .await
            .context("failed to open block store")?,
    );
    let index = Arc::new(
        CidFidIndex::new(&config.store_path)
            .await
            .context("failed to open fid index")?,
    );
    let device = Arc::new(Device::new(&config, store.clone()));

    let scheduler = Arc::new(SchedulerClient::new(
        config.scheduler_url.clone(),
        config.caching.api_timeout(),
    ));

    let gateway = Arc::new(GatewayLoader::new(
        config.ipfs_gateway.clone(),
        config.caching.download_timeout(),
    ));
    let peer = Arc::new(PeerLoader::new(config.caching.download_timeout()));

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        index.clone(),
        device.clone(),
        scheduler.clone(),
        gateway,
        peer,
        config.caching.clone(),
    ));
    let _worker = pipeline.spawn_worker();
    tracing::info!("pipeline worker spawned");

    let state = NodeState::new(
        pipeline,
        store,
        index,
        device.clone(),
        scheduler.clone(),
    );

    // Register and pull the download verifying key; retry until the
    // scheduler is reachable.
    {
        let state = state.clone();
        let scheduler = scheduler.clone();
        let device = device.clone();
        tokio::spawn(async move {
            loop {
                let announce = async {
                    let registration = device.registration().await?;
                    scheduler.register(&registration).await?;
                    let key = scheduler.get_public_key(&device.device_id).await?;
                    let key = PublicKey::from_base64(&key)
                        .map_err(courier_node::NodeError::Signer)?;
                    state.set_verifier(DownloadVerifier::new(key));
                    Ok::<_, courier_node::NodeError>(())
                };
                match announce.await {
                    Ok(()) => {
                        tracing::info!("registered with scheduler");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "scheduler registration failed, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    let app = create_router(state);
    let addr: SocketAddr = config.bind.parse().context("invalid bind address")?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
