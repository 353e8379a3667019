use cardsight_core::CardsightError;
use thiserror::Error;

/// Errors that can occur while precomputing the reference catalog.
#[derive(Debug, Error)]
pub enum PrecomputeError {
    /// A card image could not be downloaded.
    #[error("failed to download {url}: {reason}")]
    Download {
        /// Image URL.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Local features could not be computed from a downloaded image.
    #[error("feature extraction failed: {0}")]
    FeatureExtraction(String),

    /// The card store failed.
    #[error("card store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The encoder failed or could not be loaded.
    #[error("encoder error: {0}")]
    Encoder(#[from] CardsightError),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A JSON column or import file is malformed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrecomputeError {
    /// `true` when the failure concerns a single card and the run can go on.
    #[must_use]
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            Self::Download { .. } | Self::FeatureExtraction(_) | Self::Encoder(_)
        )
    }
}

/// Result type alias for precompute operations.
pub type Result<T> = std::result::Result<T, PrecomputeError>;
