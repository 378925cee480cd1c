use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bus_tracker::{ReqwestClient, Runtime};
use fleet::{Config, FleetStore, MemoryStore};
use fleet_http::{HttpStore, StoreConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default().with(filter).with(fmt::layer()).init();

    let config = Config::from_env().context("loading configuration")?;

    match StoreConfig::from_env().context("loading store configuration")? {
        Some(store_config) => {
            info!(url = %store_config.base_url, "using document store");
            let http = Arc::new(ReqwestClient::new(HTTP_TIMEOUT)?);
            run(config, Arc::new(HttpStore::new(store_config, http))).await
        }
        None => {
            info!("STORE_URL not set; using in-memory store");
            run(config, Arc::new(MemoryStore::new())).await
        }
    }
}

async fn run<S: FleetStore>(config: Config, store: Arc<S>) -> Result<()> {
    let mut runtime = Runtime::new(config, store);
    runtime.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");
    runtime.shutdown().await;
    Ok(())
}
