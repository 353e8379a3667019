//! # Cardsight
//!
//! Umbrella crate: the identification runtime from [`runtime`] and the catalog
//! builder from [`precompute`].

pub use cardsight_core as runtime;
pub use cardsight_precompute as precompute;

pub use cardsight_core::{
    CardsightError, ClipEncoder, IdentificationPipeline, IndexStrategy, MatchResult,
    NoopDetector, PipelineConfig, QuantBits, Result,
};
pub use cardsight_precompute::CardStore;
