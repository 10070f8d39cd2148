use clap::Parser;
use db::PgLedger;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use indexer::catchup::DirectorySource;
use indexer::config::{load_config, CLIArguments};
use indexer::indexer::Indexer;
use indexer::rpc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli_args = CLIArguments::parse();
    let config_path = cli_args.config_path.unwrap_or_default();
    let config = load_config(&config_path)?;

    let ledger = Arc::new(PgLedger::connect().await?);
    let node = Arc::new(rpc::connect(&config.node_endpoint)?);
    let source = DirectorySource::new(&config.blocks_dir);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen to shutdown signal"),
        }
    });

    Indexer::new(config, ledger, node, source).run(cancel).await?;

    Ok(())
}
