use crate::catalog::{EmbeddingCatalog, NormalizedEmbeddings};
use crate::error::Result;
use crate::index::{SimilaritySearch, VectorIndex};
use crate::types::CardRecord;

use super::PipelineConfig;

/// A catalog and the index built over it, swapped in as one unit.
#[derive(Debug)]
pub struct CatalogSnapshot {
    version: u64,
    catalog: EmbeddingCatalog,
    index: VectorIndex,
}

impl CatalogSnapshot {
    /// Normalizes, quantizes and indexes `records`.
    ///
    /// # Errors
    ///
    /// Returns `EmptyCatalog` if no record has a valid embedding, plus any
    /// quantization or index build failure.
    pub fn build<I>(version: u64, records: I, config: &PipelineConfig) -> Result<Self>
    where
        I: IntoIterator<Item = CardRecord>,
    {
        let embeddings = NormalizedEmbeddings::collect(records, config.catalog.dimension)?;
        let catalog = EmbeddingCatalog::from_embeddings(&embeddings, config.catalog.bits)?;
        let index = VectorIndex::build(&config.strategy, &catalog, &embeddings)?;
        Ok(Self {
            version,
            catalog,
            index,
        })
    }

    /// Monotonically increasing build number.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn catalog(&self) -> &EmbeddingCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Number of searchable cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogConfig;
    use crate::error::CardsightError;
    use crate::index::IndexStrategy;
    use crate::types::SearchMethod;

    fn config() -> PipelineConfig {
        PipelineConfig::new().with_catalog(CatalogConfig::new().with_dimension(2))
    }

    #[test]
    fn snapshot_pairs_catalog_and_index() {
        let records = vec![
            CardRecord::new(1, "A").with_embedding(vec![1.0, 0.0]),
            CardRecord::new(2, "B"),
            CardRecord::new(3, "C").with_embedding(vec![0.0, 1.0]),
        ];
        let snapshot =
            CatalogSnapshot::build(7, records, &config().with_strategy(IndexStrategy::Manual))
                .unwrap();
        assert_eq!(snapshot.version(), 7);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.catalog().stats().missing, 1);
        assert_eq!(snapshot.index().method(), SearchMethod::Manual);
    }

    #[test]
    fn all_null_catalog_fails() {
        let records = vec![CardRecord::new(1, "A"), CardRecord::new(2, "B")];
        let err = CatalogSnapshot::build(1, records, &config()).unwrap_err();
        assert!(matches!(err, CardsightError::EmptyCatalog));
    }
}
