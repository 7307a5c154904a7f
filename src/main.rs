use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crawl_crew::artifacts;
use crawl_crew::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crawl_crew=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()?;
    config.artifact_dir = artifacts::ensure_dir(&config.artifact_dir).map_err(|e| {
        anyhow::anyhow!(
            "cannot create artifact directory {}: {e}",
            config.artifact_dir.display()
        )
    })?;
    info!(
        port = config.port,
        artifact_dir = %config.artifact_dir.display(),
        "crawl-crew starting"
    );

    crawl_crew::api::serve(config).await
}
