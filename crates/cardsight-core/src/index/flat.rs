use std::sync::Arc;

use crate::catalog::EmbeddingCatalog;
use crate::codec::{QuantBits, QuantizedMatrix};
use crate::error::Result;
use crate::types::SearchMethod;
use crate::vector::dot;

use super::{check_query, top_k, SearchHit, SimilaritySearch};

/// Brute-force inner-product index over dequantized vectors.
///
/// Dequantization happens once at build time, so stored vectors carry the
/// bounded error of the scalar codec.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    bits: QuantBits,
    vectors: Vec<f32>,
}

impl FlatIndex {
    /// Decodes every catalog row into the index.
    #[must_use]
    pub fn from_catalog(catalog: &EmbeddingCatalog) -> Self {
        Self {
            dimension: catalog.dimension(),
            bits: catalog.bits(),
            vectors: catalog.matrix().decode_all(),
        }
    }

    /// Builds an index over raw row-major vectors.
    #[cfg(test)]
    fn from_vectors(dimension: usize, vectors: Vec<f32>, bits: QuantBits) -> Result<Self> {
        if dimension == 0 {
            return Err(crate::CardsightError::InvalidConfig("dimension must be > 0".into()));
        }
        if vectors.len() % dimension != 0 {
            return Err(crate::CardsightError::DimensionMismatch {
                expected: dimension,
                actual: vectors.len() % dimension,
            });
        }
        Ok(Self {
            dimension,
            bits,
            vectors,
        })
    }

    /// Width of the codes the vectors were decoded from.
    #[must_use]
    pub fn bits(&self) -> QuantBits {
        self.bits
    }
}

impl SimilaritySearch for FlatIndex {
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_query(self.len(), self.dimension, query)?;
        let scores = self
            .vectors
            .chunks_exact(self.dimension)
            .map(|row| dot(query, row));
        Ok(top_k(scores, k))
    }

    fn len(&self) -> usize {
        self.vectors.len() / self.dimension
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn method(&self) -> SearchMethod {
        SearchMethod::Exact
    }
}

/// Search without an index structure: `query · decode(codes)^T`, then argmax.
///
/// Only the quantized codes are kept in memory. Produces the same scores and
/// ranking as [`FlatIndex`] built from the same catalog.
#[derive(Debug, Clone)]
pub struct ManualIndex {
    matrix: Arc<QuantizedMatrix>,
}

impl ManualIndex {
    #[must_use]
    pub fn from_catalog(catalog: &EmbeddingCatalog) -> Self {
        Self {
            matrix: catalog.shared_matrix(),
        }
    }

    #[must_use]
    pub fn new(matrix: Arc<QuantizedMatrix>) -> Self {
        Self { matrix }
    }

    #[must_use]
    pub fn bits(&self) -> QuantBits {
        self.matrix.params().bits
    }
}

impl SimilaritySearch for ManualIndex {
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_query(self.len(), self.matrix.dimension(), query)?;
        let decoded = self.matrix.decode_all();
        let scores = decoded
            .chunks_exact(self.matrix.dimension())
            .map(|row| dot(query, row));
        Ok(top_k(scores, k))
    }

    fn len(&self) -> usize {
        self.matrix.rows()
    }

    fn dimension(&self) -> usize {
        self.matrix.dimension()
    }

    fn method(&self) -> SearchMethod {
        SearchMethod::Manual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CardsightError;

    #[test]
    fn empty_index_is_an_error() {
        let index = FlatIndex::from_vectors(4, Vec::new(), QuantBits::Eight).unwrap();
        assert!(index.is_empty());
        let err = index.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, CardsightError::EmptyIndex));
    }

    #[test]
    fn wrong_query_dimension_is_an_error() {
        let index = FlatIndex::from_vectors(2, vec![1.0, 0.0], QuantBits::Eight).unwrap();
        let err = index.search(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(
            err,
            CardsightError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn flat_search_returns_best_first() {
        let index = FlatIndex::from_vectors(
            2,
            vec![1.0, 0.0, 0.0, 1.0, 0.6, 0.8],
            QuantBits::Eight,
        )
        .unwrap();
        let hits = index.search(&[0.0, 1.0], 3).unwrap();
        assert_eq!(hits.iter().map(|h| h.index).collect::<Vec<_>>(), vec![1, 2, 0]);
        assert_eq!(hits[0].score, 1.0);
    }

    #[test]
    fn duplicate_vectors_resolve_to_first() {
        let index = FlatIndex::from_vectors(
            2,
            vec![0.0, 1.0, 0.6, 0.8, 0.6, 0.8],
            QuantBits::Eight,
        )
        .unwrap();
        let hits = index.search(&[0.6, 0.8], 1).unwrap();
        assert_eq!(hits[0].index, 1);
    }

    #[test]
    fn manual_index_searches_codes() {
        let matrix =
            QuantizedMatrix::quantize(&[1.0, 0.0, 0.0, 1.0], 2, QuantBits::Sixteen).unwrap();
        let index = ManualIndex::new(Arc::new(matrix));
        let hits = index.search(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].index, 1);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert_eq!(index.method(), SearchMethod::Manual);
    }
}
