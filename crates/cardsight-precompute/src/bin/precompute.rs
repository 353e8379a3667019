//! Cardsight precompute CLI
//!
//! Imports card records into the local store and fills in their reference
//! embeddings and local features.

use std::path::PathBuf;

use anyhow::{Context, Result};
use cardsight_core::ClipEncoder;
use cardsight_precompute::{
    default_db_path, default_model_dir, run, CardStore, Downloader, PrecomputeConfig,
    RetryConfig, DB_ENV, MODEL_DIR_ENV,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cardsight-precompute")]
#[command(about = "Build the Cardsight reference catalog")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Card store file
    #[arg(short, long, env = DB_ENV)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Import card records from a JSON array
    Import {
        /// JSON file to import
        #[arg(short, long)]
        json: PathBuf,
    },
    /// Download images and compute embeddings and features
    Run {
        /// Cards per checkpointed chunk
        #[arg(long, default_value_t = 50)]
        chunk_size: usize,

        /// Concurrent downloads
        #[arg(short, long, default_value_t = 4)]
        workers: usize,

        /// Images per inference batch
        #[arg(short, long, default_value_t = 16)]
        batch_size: usize,

        /// Encoder model directory
        #[arg(short, long, env = MODEL_DIR_ENV)]
        model_dir: Option<PathBuf>,

        /// Ignore the checkpoint and start from the first card
        #[arg(long)]
        restart: bool,

        /// Retries per image download
        #[arg(long, default_value_t = 3)]
        retries: u32,
    },
    /// Show store counts and the checkpoint
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let db = cli.db.unwrap_or_else(default_db_path);
    if let Some(parent) = db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = CardStore::open(&db)
        .with_context(|| format!("Failed to open card store {}", db.display()))?;

    match cli.command {
        Commands::Import { json } => {
            let text = std::fs::read_to_string(&json)
                .with_context(|| format!("Failed to read {}", json.display()))?;
            let imported = store.import_json(&text).context("Failed to import cards")?;
            info!(imported, db = %db.display(), "import complete");
        }
        Commands::Run {
            chunk_size,
            workers,
            batch_size,
            model_dir,
            restart,
            retries,
        } => {
            let model_dir = model_dir.unwrap_or_else(default_model_dir);
            info!(model_dir = %model_dir.display(), "loading encoder");
            let encoder = ClipEncoder::load(&model_dir)
                .with_context(|| format!("Failed to load encoder from {}", model_dir.display()))?;

            let retry = RetryConfig::new().with_max_retries(retries);
            let downloader = Downloader::new(retry).context("Failed to build HTTP client")?;
            let config = PrecomputeConfig::new()
                .with_chunk_size(chunk_size)
                .with_workers(workers)
                .with_batch_size(batch_size)
                .with_retry(retry)
                .with_restart(restart);

            let summary = run(&store, encoder, downloader, &config)
                .await
                .context("Precompute failed")?;
            let failed =
                summary.download_failed + summary.feature_failed + summary.embedding_failed;
            if failed > 0 {
                warn!(failed, "some cards were skipped; rerun with --restart to retry them");
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Status => {
            let counts = store.counts().context("Failed to read store counts")?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults_match_config() {
        let cli = Cli::try_parse_from(["cardsight-precompute", "run"]).unwrap();
        let Commands::Run {
            chunk_size,
            workers,
            batch_size,
            restart,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        let config = PrecomputeConfig::default();
        assert_eq!(chunk_size, config.chunk_size);
        assert_eq!(workers, config.workers);
        assert_eq!(batch_size, config.batch_size);
        assert!(!restart);
    }
}
