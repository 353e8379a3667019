use std::path::PathBuf;

use anyhow::{Context, Result};
use cardsight_core::{
    CatalogConfig, CatalogStats, ClipEncoder, Encoder, IdentificationPipeline, IndexStrategy,
    MatchResult, NoopDetector, PipelineConfig, PqConfig, QuantBits,
};
use cardsight_precompute::{default_db_path, default_model_dir, CardStore, DB_ENV, MODEL_DIR_ENV};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    Exact,
    Manual,
    Pq,
}

#[derive(Parser)]
#[command(name = "cardsight-identify")]
#[command(about = "Identify the cards in a photo")]
#[command(version)]
struct Cli {
    /// Photo to identify
    image: PathBuf,

    /// Card store file
    #[arg(short, long, env = DB_ENV)]
    db: Option<PathBuf>,

    /// Encoder model directory
    #[arg(short, long, env = MODEL_DIR_ENV)]
    model_dir: Option<PathBuf>,

    /// Search strategy
    #[arg(short, long, value_enum, default_value_t = Strategy::Exact)]
    strategy: Strategy,

    /// Scalar quantization width (8 or 16)
    #[arg(short, long, default_value_t = 8)]
    bits: u8,

    /// PQ segments
    #[arg(long, default_value_t = 64)]
    pq_segments: usize,

    /// PQ bits per segment code
    #[arg(long, default_value_t = 8)]
    pq_bits: u8,
}

#[derive(Debug, Serialize)]
struct IdentifyOutput {
    image: String,
    cards: usize,
    strategy: IndexStrategy,
    compression_ratio: f64,
    stats: CatalogStats,
    matches: Vec<MatchResult>,
}

fn index_strategy(strategy: Strategy, pq_segments: usize, pq_bits: u8) -> IndexStrategy {
    match strategy {
        Strategy::Exact => IndexStrategy::Exact,
        Strategy::Manual => IndexStrategy::Manual,
        Strategy::Pq => IndexStrategy::ProductQuantized(
            PqConfig::new()
                .with_segments(pq_segments)
                .with_bits(pq_bits),
        ),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let bits = QuantBits::try_from(cli.bits)?;
    let db = cli.db.unwrap_or_else(default_db_path);
    let model_dir = cli.model_dir.unwrap_or_else(default_model_dir);

    let encoder = ClipEncoder::load(&model_dir)
        .with_context(|| format!("Failed to load encoder from {}", model_dir.display()))?;
    let store = CardStore::open(&db)
        .with_context(|| format!("Failed to open card store {}", db.display()))?;

    let config = PipelineConfig::new()
        .with_catalog(
            CatalogConfig::new()
                .with_dimension(encoder.dimension())
                .with_bits(bits),
        )
        .with_strategy(index_strategy(cli.strategy, cli.pq_segments, cli.pq_bits));
    let pipeline = IdentificationPipeline::new(encoder, NoopDetector, store, config);

    let bytes = std::fs::read(&cli.image)
        .with_context(|| format!("Failed to read {}", cli.image.display()))?;
    let snapshot = pipeline.snapshot().context("Failed to build catalog")?;
    info!(cards = snapshot.len(), version = snapshot.version(), "catalog ready");

    let matches = pipeline
        .identify_bytes(&bytes)
        .with_context(|| format!("Failed to identify {}", cli.image.display()))?;

    let output = IdentifyOutput {
        image: cli.image.display().to_string(),
        cards: snapshot.len(),
        strategy: config.strategy,
        compression_ratio: snapshot.index().compression_ratio(),
        stats: *snapshot.catalog().stats(),
        matches,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
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
    fn strategy_maps_to_index_strategy() {
        assert_eq!(index_strategy(Strategy::Exact, 64, 8), IndexStrategy::Exact);
        assert_eq!(index_strategy(Strategy::Manual, 64, 8), IndexStrategy::Manual);
        let IndexStrategy::ProductQuantized(pq) = index_strategy(Strategy::Pq, 32, 4) else {
            panic!("expected product quantization");
        };
        assert_eq!(pq.segments, 32);
        assert_eq!(pq.bits, 4);
    }

    #[test]
    fn strategy_names_parse() {
        let cli = Cli::try_parse_from(["cardsight-identify", "--strategy", "pq", "card.jpg"]).unwrap();
        assert_eq!(cli.strategy, Strategy::Pq);
        assert_eq!(cli.bits, 8);
        assert!(Cli::try_parse_from(["cardsight-identify", "--strategy", "ivf", "card.jpg"]).is_err());
    }
}
