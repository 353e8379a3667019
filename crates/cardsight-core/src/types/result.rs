use std::fmt;

use serde::{Deserialize, Serialize};

use super::card::CardMetadata;
use super::detection::DetectionCandidate;

/// Which search structure produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// Flat inner-product index over dequantized vectors.
    Exact,
    /// Per-query dequantization and argmax, no index structure.
    Manual,
    /// Product-quantized codes with lookup tables.
    ProductQuantization,
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Manual => write!(f, "manual"),
            Self::ProductQuantization => write!(f, "product_quantization"),
        }
    }
}

/// Timing of one identification request, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    /// Whole request.
    pub total_time: f64,
    /// Decoding the uploaded bytes.
    pub image_load_time: f64,
    /// Waiting for or building the catalog snapshot.
    pub model_init_time: f64,
    /// Detection, encoding and search.
    pub identification_time: f64,
}

/// Identity recovered for one detected region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Id of the matched card.
    pub card_id: i64,

    /// Catalog metadata of the matched card.
    pub metadata: CardMetadata,

    /// Inner product between the query and the stored vector.
    pub similarity_score: f32,

    /// Search structure that produced the match.
    pub method: SearchMethod,

    /// Code width of the scalar-quantized catalog, when it was searched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization_bits: Option<u8>,

    /// The region this match was computed for.
    pub detection: DetectionCandidate,

    /// Timing breakdown, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<Performance>,
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MatchResult(card={}, name={:?}, score={:.3}, method={}, box={})",
            self.card_id, self.metadata.name, self.similarity_score, self.method, self.detection.bbox
        )
    }
}
