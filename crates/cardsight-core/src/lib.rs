//! # Cardsight Core
//!
//! Visual identification of trading cards. Reference embeddings are held in a
//! scalar-quantized catalog, searched by inner product, and matched against
//! the regions a detector proposes in a query photo.
//!
//! ## Quick Start
//!
//! ```rust
//! use cardsight_core::{CardRecord, CatalogConfig, EmbeddingCatalog, IndexStrategy, NormalizedEmbeddings, SimilaritySearch, VectorIndex};
//!
//! let records = vec![
//!     CardRecord::new(1, "Pikachu").with_embedding(vec![1.0, 0.0, 0.0]),
//!     CardRecord::new(2, "Charizard").with_embedding(vec![0.0, 1.0, 0.0]),
//! ];
//! let config = CatalogConfig::new().with_dimension(3);
//! let embeddings = NormalizedEmbeddings::collect(records, config.dimension).unwrap();
//! let catalog = EmbeddingCatalog::from_embeddings(&embeddings, config.bits).unwrap();
//! let index = VectorIndex::build(&IndexStrategy::Exact, &catalog, &embeddings).unwrap();
//!
//! let hits = index.search(&[0.1, 0.99, 0.0], 1).unwrap();
//! assert_eq!(catalog.metadata(hits[0].index).unwrap().name, "Charizard");
//! ```
pub mod catalog;
pub mod codec;
pub mod detector;
pub mod encoder;
pub mod error;
pub mod image_ops;
pub mod index;
pub mod pipeline;
pub mod types;
pub mod vector;

// Re-export primary API
pub use catalog::{CatalogConfig, CatalogStats, EmbeddingCatalog, NormalizedEmbeddings};
pub use codec::{QuantBits, QuantizationParams, QuantizedMatrix, QuantizedVector};
pub use detector::{Detector, DetectorConfig, NoopDetector, RegionDetector};
pub use encoder::{ClipEncoder, Encoder};
pub use error::{CardsightError, ErrorKind, Result};
pub use index::{
    FlatIndex, IndexStrategy, ManualIndex, PqConfig, PqIndex, SearchHit, SimilaritySearch,
    VectorIndex,
};
pub use pipeline::{
    CardSource, CatalogSnapshot, IdentificationPipeline, ModelStatus, PipelineConfig,
    PipelineStatus,
};
pub use types::{
    BoundingBox, CardMetadata, CardRecord, DetectionCandidate, MatchResult, Performance,
    SearchMethod,
};
