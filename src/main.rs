//! ACS tenant process
//!
//! Boots one engine for the tenant named by `ACS_TENANT_ID`, serves until
//! SIGINT, then drains and shuts down.

use std::sync::Arc;

use acs::persistence::{RelationalStore, SqliteStore};
use acs::{AcsConfig, AcsEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AcsConfig::from_env()?;
    tracing::info!(tenant = %config.tenant_id, version = acs::VERSION, "starting acs");

    let store: Arc<dyn RelationalStore> = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .map_err(|e| anyhow::anyhow!("cannot open store: {e}"))?,
    );
    let engine = AcsEngine::start(config, store).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    engine.shutdown().await?;
    Ok(())
}
