//! # Embedding Catalog
//!
//! Owns the reference vectors of every card that has a stored embedding, the
//! parallel metadata array, and the single quantization parameter set of the
//! corpus. A catalog is immutable: rebuilding produces a new one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{QuantBits, QuantizationParams, QuantizedMatrix};
use crate::error::{CardsightError, Result};
use crate::types::{CardMetadata, CardRecord};
use crate::vector::normalized;

/// Default embedding dimension (CLIP ViT-B/32 projection).
pub const DEFAULT_DIMENSION: usize = 512;

/// Configuration of a catalog build.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Length every stored embedding must have.
    pub dimension: usize,
    /// Code width of the quantized store.
    pub bits: QuantBits,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            bits: QuantBits::Eight,
        }
    }
}

impl CatalogConfig {
    /// Create a new catalog configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Set the quantization width.
    pub fn with_bits(mut self, bits: QuantBits) -> Self {
        self.bits = bits;
        self
    }
}

/// Counters and memory figures reported by a catalog build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    /// Records that entered the catalog.
    pub accepted: usize,
    /// Records without an embedding.
    pub missing: usize,
    /// Records whose embedding was rejected.
    pub malformed: usize,
    /// Size of the normalized matrix as `f32`.
    pub original_bytes: usize,
    /// Size of the quantized codes.
    pub quantized_bytes: usize,
}

impl CatalogStats {
    /// Fraction of memory saved by quantization, `1 - quantized / original`.
    #[must_use]
    pub fn memory_reduction(&self) -> f64 {
        if self.original_bytes == 0 {
            0.0
        } else {
            1.0 - self.quantized_bytes as f64 / self.original_bytes as f64
        }
    }
}

/// Unit-norm reference vectors stacked row-major, with their metadata.
///
/// This is the float matrix a catalog is quantized from. It is also what the
/// product quantizer trains on.
#[derive(Debug, Clone)]
pub struct NormalizedEmbeddings {
    dimension: usize,
    vectors: Vec<f32>,
    metadata: Vec<CardMetadata>,
    missing: usize,
    malformed: usize,
}

impl NormalizedEmbeddings {
    /// Validates and normalizes every record that has an embedding.
    ///
    /// Malformed embeddings are logged and skipped; they never reach the index.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero dimension and `EmptyCatalog` when no
    /// record carries a valid embedding.
    pub fn collect<I>(records: I, dimension: usize) -> Result<Self>
    where
        I: IntoIterator<Item = CardRecord>,
    {
        if dimension == 0 {
            return Err(CardsightError::InvalidConfig(
                "catalog dimension must be > 0".into(),
            ));
        }

        let mut vectors = Vec::new();
        let mut metadata = Vec::new();
        let mut missing = 0usize;
        let mut malformed = 0usize;

        for record in records {
            let Some(ref embedding) = record.embedding else {
                missing += 1;
                debug!(card_id = record.id, "card has no stored embedding");
                continue;
            };

            match validate_embedding(record.id, embedding, dimension) {
                Ok(unit) => {
                    vectors.extend_from_slice(&unit);
                    metadata.push(record.metadata());
                }
                Err(err) => {
                    malformed += 1;
                    warn!(card_id = record.id, error = %err, "skipping card embedding");
                }
            }
        }

        if metadata.is_empty() {
            return Err(CardsightError::EmptyCatalog);
        }

        Ok(Self {
            dimension,
            vectors,
            metadata,
            missing,
            malformed,
        })
    }

    /// Number of accepted vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    /// Always `false`: collection fails instead of producing an empty set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// All vectors, row-major.
    #[must_use]
    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    #[must_use]
    pub fn metadata(&self) -> &[CardMetadata] {
        &self.metadata
    }
}

/// Checks one stored embedding and returns it normalized.
///
/// # Errors
///
/// Returns `MalformedEmbedding` if the length is wrong, an element is not
/// finite, or the vector has zero norm.
pub fn validate_embedding(card_id: i64, embedding: &[f32], dimension: usize) -> Result<Vec<f32>> {
    if embedding.len() != dimension {
        return Err(CardsightError::MalformedEmbedding {
            card_id,
            reason: format!("expected {dimension} values, got {}", embedding.len()),
        });
    }
    if let Some(pos) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(CardsightError::MalformedEmbedding {
            card_id,
            reason: format!("non-finite value at position {pos}"),
        });
    }
    normalized(embedding).ok_or_else(|| CardsightError::MalformedEmbedding {
        card_id,
        reason: "zero-norm vector".into(),
    })
}

/// Quantized reference vectors with their parallel metadata.
#[derive(Debug, Clone)]
pub struct EmbeddingCatalog {
    metadata: Vec<CardMetadata>,
    matrix: Arc<QuantizedMatrix>,
    stats: CatalogStats,
}

impl EmbeddingCatalog {
    /// Builds a catalog from card records.
    ///
    /// # Errors
    ///
    /// Returns `EmptyCatalog` when no record has a valid embedding, and
    /// `DegenerateInput` when the accepted vectors are all constant.
    pub fn build<I>(records: I, config: &CatalogConfig) -> Result<Self>
    where
        I: IntoIterator<Item = CardRecord>,
    {
        let embeddings = NormalizedEmbeddings::collect(records, config.dimension)?;
        Self::from_embeddings(&embeddings, config.bits)
    }

    /// Quantizes already normalized embeddings.
    ///
    /// # Errors
    ///
    /// Propagates `DegenerateInput` from the quantization fit.
    pub fn from_embeddings(embeddings: &NormalizedEmbeddings, bits: QuantBits) -> Result<Self> {
        if embeddings.is_empty() {
            return Err(CardsightError::EmptyCatalog);
        }

        let matrix = QuantizedMatrix::quantize(embeddings.vectors(), embeddings.dimension(), bits)?;

        let stats = CatalogStats {
            accepted: embeddings.len(),
            missing: embeddings.missing,
            malformed: embeddings.malformed,
            original_bytes: matrix.float_nbytes(),
            quantized_bytes: matrix.nbytes(),
        };

        info!(
            cards = stats.accepted,
            missing = stats.missing,
            malformed = stats.malformed,
            original_bytes = stats.original_bytes,
            quantized_bytes = stats.quantized_bytes,
            "quantization complete ({:.1}% reduction)",
            stats.memory_reduction() * 100.0
        );

        Ok(Self {
            metadata: embeddings.metadata().to_vec(),
            matrix: Arc::new(matrix),
            stats,
        })
    }

    /// Number of cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    /// Always `false` for a successfully built catalog.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.matrix.dimension()
    }

    #[must_use]
    pub fn bits(&self) -> QuantBits {
        self.matrix.params().bits
    }

    #[must_use]
    pub fn params(&self) -> &QuantizationParams {
        self.matrix.params()
    }

    /// The quantized codes, one row per card.
    #[must_use]
    pub fn matrix(&self) -> &QuantizedMatrix {
        &self.matrix
    }

    /// A shared handle on the codes, for indexes that read them per query.
    #[must_use]
    pub fn shared_matrix(&self) -> Arc<QuantizedMatrix> {
        Arc::clone(&self.matrix)
    }

    /// Metadata of the card stored at `index`.
    #[must_use]
    pub fn metadata(&self, index: usize) -> Option<&CardMetadata> {
        self.metadata.get(index)
    }

    /// All metadata in catalog order.
    #[must_use]
    pub fn all_metadata(&self) -> &[CardMetadata] {
        &self.metadata
    }

    #[must_use]
    pub fn stats(&self) -> &CatalogStats {
        &self.stats
    }
}
