use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cqi-cli")]
#[command(about = "Civic Quest Ingestor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion pipeline once over all enabled feeds.
    Ingest,
    /// Start the cron scheduler and run until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let results = cqi_ingest::run_ingest_once_from_env().await?;
            for run in &results {
                println!(
                    "ingest complete: run_id={} feed={} fetched={} created={} skipped={} batches={}",
                    run.run_id,
                    run.feed,
                    run.fetched,
                    run.created,
                    run.skipped(),
                    run.batches_committed
                );
            }
        }
        Commands::Schedule => {
            cqi_ingest::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
