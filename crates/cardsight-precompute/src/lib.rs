//! # Cardsight Precompute
//!
//! Builds the reference side of the catalog: card records live in a SQLite
//! [`CardStore`]; [`run`] downloads each card image, computes its local
//! features and its embedding, and saves them back in checkpointed chunks.
pub mod download;
pub mod error;
pub mod features;
pub mod inference;
pub mod keypoints;
pub mod precompute;
pub mod store;

// Re-export primary API
pub use download::{is_retryable_status, Downloader, ImageFetcher, RetryConfig};
pub use error::{PrecomputeError, Result};
pub use features::{hsv_histogram, perceptual_hash, LocalFeatures};
pub use inference::InferenceWorker;
pub use keypoints::binary_descriptors;
pub use precompute::{run, ItemOutcome, PrecomputeConfig, PrecomputeSummary};
pub use store::{CardStore, NewCard, PendingCard, StoreCounts};

use std::path::PathBuf;

/// Environment variable naming the card store file.
pub const DB_ENV: &str = "CARDSIGHT_DB";
/// Environment variable naming the encoder model directory.
pub const MODEL_DIR_ENV: &str = "CARDSIGHT_MODEL_DIR";

/// Default card store location, under the user data directory.
#[must_use]
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cardsight")
        .join("cards.sqlite3")
}

/// Default encoder model directory.
#[must_use]
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models").join("clip")
}
