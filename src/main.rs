use opsgate::api;
use opsgate::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        host = %config.host,
        port = config.port,
        db = %config.db_path.display(),
        catalog = %config.catalog_path.display(),
        "starting opsgate"
    );

    api::serve(config).await
}
