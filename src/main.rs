//! Binary entry point for the staking indexer daemon.

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = staking_indexer::cli::run().await {
        tracing::error!(error = %err, "the staking indexer failed");
        std::process::exit(1);
    }
}
