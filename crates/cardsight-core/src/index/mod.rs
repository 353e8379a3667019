//! # Vector Index
//!
//! Similarity search over the catalog. Three interchangeable strategies share
//! one `search(query, k)` capability and are selected at build time:
//!
//! - [`FlatIndex`]: exact inner product over vectors dequantized once.
//! - [`ManualIndex`]: dequantizes the codes on every query; the reference the
//!   other strategies are validated against.
//! - [`PqIndex`]: product-quantized codes searched through lookup tables.
//!
//! Scores are inner products of unit vectors (cosine similarity). The top `k`
//! hits are ordered by descending score, ties going to the lowest stored index.

pub mod flat;
pub mod kmeans;
pub mod pq;

use serde::{Deserialize, Serialize};

use crate::catalog::{EmbeddingCatalog, NormalizedEmbeddings};
use crate::error::{CardsightError, Result};
use crate::types::SearchMethod;

pub use flat::{FlatIndex, ManualIndex};
pub use kmeans::{KMeans, KMeansConfig};
pub use pq::{PqConfig, PqIndex, ProductQuantizer};

/// One search result: a score and the catalog position it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Inner product between the query and the stored vector.
    pub score: f32,
    /// Position of the stored vector in catalog order.
    pub index: usize,
}

/// Capability shared by every index strategy.
pub trait SimilaritySearch {
    /// Returns the `k` highest-scoring stored vectors.
    ///
    /// # Errors
    ///
    /// Returns `EmptyIndex` if nothing is stored and `DimensionMismatch` if the
    /// query has the wrong length.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    /// Number of stored vectors.
    fn len(&self) -> usize;

    /// Returns `true` if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimension of stored vectors.
    fn dimension(&self) -> usize;

    /// Which strategy this is.
    fn method(&self) -> SearchMethod;
}

/// Index strategy chosen when the catalog snapshot is built.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexStrategy {
    /// Flat inner-product index.
    #[default]
    Exact,
    /// No index structure, dequantize per query.
    Manual,
    /// Product quantization with the given parameters.
    ProductQuantized(PqConfig),
}

/// A built index of one of the three strategies.
#[derive(Debug, Clone)]
pub enum VectorIndex {
    /// Vectors dequantized once at build time.
    Exact(FlatIndex),
    /// Codes dequantized on every query.
    Manual(ManualIndex),
    /// Product-quantized codes scored through lookup tables.
    ProductQuantized(PqIndex),
}

impl VectorIndex {
    /// Builds the index selected by `strategy`.
    ///
    /// The scalar strategies read the catalog's quantized codes; product
    /// quantization trains on the normalized float vectors the catalog was
    /// quantized from.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for PQ parameters that do not fit the catalog,
    /// and `DimensionMismatch` if `embeddings` and `catalog` disagree.
    pub fn build(
        strategy: &IndexStrategy,
        catalog: &EmbeddingCatalog,
        embeddings: &NormalizedEmbeddings,
    ) -> Result<Self> {
        if embeddings.dimension() != catalog.dimension() {
            return Err(CardsightError::DimensionMismatch {
                expected: catalog.dimension(),
                actual: embeddings.dimension(),
            });
        }

        let index = match strategy {
            IndexStrategy::Exact => Self::Exact(FlatIndex::from_catalog(catalog)),
            IndexStrategy::Manual => Self::Manual(ManualIndex::from_catalog(catalog)),
            IndexStrategy::ProductQuantized(config) => Self::ProductQuantized(PqIndex::build(
                embeddings.vectors(),
                embeddings.dimension(),
                config,
            )?),
        };
        Ok(index)
    }

    /// Code width of the scalar-quantized codes this index searches, if any.
    #[must_use]
    pub fn quantization_bits(&self) -> Option<u8> {
        match self {
            Self::Exact(index) => Some(index.bits().into()),
            Self::Manual(index) => Some(index.bits().into()),
            Self::ProductQuantized(_) => None,
        }
    }

    /// Compression of the stored representation relative to `f32`.
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        match self {
            Self::Exact(index) => 32.0 / f64::from(index.bits().bits()),
            Self::Manual(index) => 32.0 / f64::from(index.bits().bits()),
            Self::ProductQuantized(index) => index.compression_ratio(),
        }
    }
}

impl SimilaritySearch for VectorIndex {
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        match self {
            Self::Exact(index) => index.search(query, k),
            Self::Manual(index) => index.search(query, k),
            Self::ProductQuantized(index) => index.search(query, k),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Exact(index) => index.len(),
            Self::Manual(index) => index.len(),
            Self::ProductQuantized(index) => index.len(),
        }
    }

    fn dimension(&self) -> usize {
        match self {
            Self::Exact(index) => index.dimension(),
            Self::Manual(index) => index.dimension(),
            Self::ProductQuantized(index) => index.dimension(),
        }
    }

    fn method(&self) -> SearchMethod {
        match self {
            Self::Exact(_) => SearchMethod::Exact,
            Self::Manual(_) => SearchMethod::Manual,
            Self::ProductQuantized(_) => SearchMethod::ProductQuantization,
        }
    }
}

/// Checks the preconditions every strategy shares.
pub(crate) fn check_query(len: usize, dimension: usize, query: &[f32]) -> Result<()> {
    if len == 0 {
        return Err(CardsightError::EmptyIndex);
    }
    if query.len() != dimension {
        return Err(CardsightError::DimensionMismatch {
            expected: dimension,
            actual: query.len(),
        });
    }
    Ok(())
}

/// Keeps the `k` best scores in descending order.
///
/// Scores arrive in stored order; a later score must be strictly greater to
/// displace an earlier one, so ties resolve to the lowest index. NaN scores
/// rank below everything.
pub(crate) fn top_k<I>(scores: I, k: usize) -> Vec<SearchHit>
where
    I: IntoIterator<Item = f32>,
{
    let mut best: Vec<SearchHit> = Vec::with_capacity(k.saturating_add(1).min(1024));
    if k == 0 {
        return best;
    }

    for (index, score) in scores.into_iter().enumerate() {
        let score = if score.is_nan() { f32::NEG_INFINITY } else { score };
        if best.len() == k && score <= best[k - 1].score {
            continue;
        }
        let pos = best.partition_point(|hit| hit.score >= score);
        best.insert(pos, SearchHit { score, index });
        best.truncate(k);
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::QuantBits;
    use crate::types::CardRecord;
    use crate::vector::normalized;

    fn abc_catalog() -> (EmbeddingCatalog, NormalizedEmbeddings) {
        let records = vec![
            CardRecord::new(1, "A").with_embedding(vec![1.0, 0.0, 0.0, 0.0]),
            CardRecord::new(2, "B").with_embedding(vec![0.0, 1.0, 0.0, 0.0]),
            CardRecord::new(3, "C").with_embedding(vec![0.0, 0.0, 1.0, 0.0]),
        ];
        let embeddings = NormalizedEmbeddings::collect(records, 4).unwrap();
        let catalog = EmbeddingCatalog::from_embeddings(&embeddings, QuantBits::Eight).unwrap();
        (catalog, embeddings)
    }

    #[test]
    fn top_k_orders_and_breaks_ties_by_index() {
        let hits = top_k([0.5, 0.9, 0.9, 0.1, 0.9], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 1);
        assert_eq!(hits[1].index, 2);

        let hits = top_k([0.2, 0.7, 0.4], 5);
        let order: Vec<usize> = hits.iter().map(|h| h.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn top_k_zero_and_nan() {
        assert!(top_k([1.0, 2.0], 0).is_empty());
        let hits = top_k([f32::NAN, 0.1], 1);
        assert_eq!(hits[0].index, 1);
    }

    #[test]
    fn every_strategy_finds_b() {
        let (catalog, embeddings) = abc_catalog();
        let query = normalized(&[0.0, 0.9, 0.1, 0.0]).unwrap();

        let strategies = [
            IndexStrategy::Exact,
            IndexStrategy::Manual,
            IndexStrategy::ProductQuantized(
                PqConfig::new().with_segments(2).with_bits(2).with_seed(7),
            ),
        ];
        for strategy in &strategies {
            let index = VectorIndex::build(strategy, &catalog, &embeddings).unwrap();
            let hits = index.search(&query, 1).unwrap();
            let matched = catalog.metadata(hits[0].index).unwrap();
            assert_eq!(matched.name, "B", "{strategy:?}");
            assert!((hits[0].score - 0.99).abs() < 0.01, "{strategy:?}: {}", hits[0].score);
        }
    }

    #[test]
    fn manual_matches_exact_bit_for_bit() {
        let records: Vec<CardRecord> = (0..50)
            .map(|i| {
                let v: Vec<f32> = (0..8)
                    .map(|d| ((i * 7 + d * 13) % 17) as f32 - 8.0)
                    .collect();
                CardRecord::new(i, format!("c{i}")).with_embedding(v)
            })
            .filter(|r| r.embedding.as_ref().is_some_and(|v| v.iter().any(|x| *x != 0.0)))
            .collect();
        let embeddings = NormalizedEmbeddings::collect(records, 8).unwrap();
        let catalog = EmbeddingCatalog::from_embeddings(&embeddings, QuantBits::Eight).unwrap();

        let exact = VectorIndex::build(&IndexStrategy::Exact, &catalog, &embeddings).unwrap();
        let manual = VectorIndex::build(&IndexStrategy::Manual, &catalog, &embeddings).unwrap();

        for q in 0..embeddings.len() {
            let query = &embeddings.vectors()[q * 8..(q + 1) * 8];
            assert_eq!(exact.search(query, 10).unwrap(), manual.search(query, 10).unwrap());
        }
    }

    #[test]
    fn self_search_recovers_catalog_position() {
        let (catalog, embeddings) = abc_catalog();
        let index = VectorIndex::build(&IndexStrategy::Exact, &catalog, &embeddings).unwrap();
        for i in 0..catalog.len() {
            let decoded = catalog.matrix().decode_row(i).unwrap();
            let hits = index.search(&decoded, 1).unwrap();
            assert_eq!(hits[0].index, i);
            assert_eq!(catalog.metadata(hits[0].index).unwrap().id, i as i64 + 1);
        }
    }

    #[test]
    fn repeated_queries_are_deterministic() {
        let (catalog, embeddings) = abc_catalog();
        let index = VectorIndex::build(&IndexStrategy::Exact, &catalog, &embeddings).unwrap();
        let query = normalized(&[0.5, 0.5, 0.5, 0.5]).unwrap();
        let first = index.search(&query, 3).unwrap();
        // equal scores for A, B and C: catalog order wins
        assert_eq!(
            first.iter().map(|h| h.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        for _ in 0..5 {
            assert_eq!(index.search(&query, 3).unwrap(), first);
        }
    }

    #[test]
    fn strategy_metadata() {
        let (catalog, embeddings) = abc_catalog();
        let exact = VectorIndex::build(&IndexStrategy::Exact, &catalog, &embeddings).unwrap();
        assert_eq!(exact.method(), SearchMethod::Exact);
        assert_eq!(exact.quantization_bits(), Some(8));
        assert_eq!(exact.compression_ratio(), 4.0);
        assert_eq!(exact.len(), 3);
    }

    #[test]
    fn strategy_serde() {
        let json = serde_json::to_string(&IndexStrategy::Manual).unwrap();
        assert_eq!(json, r#"{"kind":"manual"}"#);
        let pq: IndexStrategy =
            serde_json::from_str(r#"{"kind":"product_quantized","segments":64,"bits":8,"iterations":25,"seed":42}"#)
                .unwrap();
        assert!(matches!(pq, IndexStrategy::ProductQuantized(c) if c.segments == 64));
    }
}
