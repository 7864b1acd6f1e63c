use anyhow::Result;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use visitcount::config::{Config, StoreBackend};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv_result = dotenv();
    init_tracing();
    match dotenv_result {
        Ok(path) => info!("Loaded environment from {:?}", path),
        Err(e) => warn!("No .env file loaded ({}) - relying on environment", e),
    }

    let config = Config::from_env()?;
    if config.backend == StoreBackend::Azure && config.connection_string.is_none() {
        warn!("COSMOS_CONNECTION_STRING is not set; requests will report a configuration error");
    }
    info!(
        "Table '{}', visit window {}s",
        config.table_name,
        config.window.num_seconds()
    );
    visitcount::app::run_server(config).await
}
