use thiserror::Error;

/// Errors that can occur during Cardsight core operations.
#[derive(Debug, Error)]
pub enum CardsightError {
    /// Quantization was fitted on data with no usable range.
    #[error("cannot fit quantization parameters: {0}")]
    DegenerateInput(String),

    /// No card record carried a valid embedding.
    #[error("catalog is empty: no card record has a valid embedding")]
    EmptyCatalog,

    /// A search was attempted on an index holding no vectors.
    #[error("index is empty")]
    EmptyIndex,

    /// A stored embedding is not a finite vector of the catalog dimension.
    #[error("malformed embedding for card {card_id}: {reason}")]
    MalformedEmbedding {
        /// The card whose embedding was rejected.
        card_id: i64,
        /// Why it was rejected.
        reason: String,
    },

    /// A vector does not have the dimension the index was built with.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension of the index.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The catalog/index is still being loaded by another caller.
    #[error("identification model is initializing, retry in {retry_after_secs}s")]
    ModelUnavailable {
        /// Suggested delay before retrying.
        retry_after_secs: u64,
    },

    /// The encoder weights could not be loaded.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// The encoder failed to produce an embedding.
    #[error("inference error: {0}")]
    Inference(String),

    /// The detector failed to propose regions.
    #[error("detection error: {0}")]
    Detection(String),

    /// The caller-supplied image cannot be decoded or is empty.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// The card records could not be loaded.
    #[error("card source error: {0}")]
    CardSource(String),

    /// Candle ML framework error.
    #[error("ML inference error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; the same request may succeed later.
    Retry,
    /// Affects a single item; continue with the rest.
    Skip,
    /// The request cannot succeed as issued.
    Fail,
}

impl CardsightError {
    /// Classifies the error for retry / skip / fail decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelUnavailable { .. } => ErrorKind::Retry,
            Self::MalformedEmbedding { .. } => ErrorKind::Skip,
            _ => ErrorKind::Fail,
        }
    }

    /// Returns `true` if the caller should retry later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retry
    }
}

/// Result type alias for Cardsight operations.
pub type Result<T> = std::result::Result<T, CardsightError>;
