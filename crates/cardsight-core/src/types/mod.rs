pub mod card;
pub mod detection;
pub mod result;

pub use card::{CardMetadata, CardRecord};
pub use detection::{BoundingBox, DetectionCandidate};
pub use result::{MatchResult, Performance, SearchMethod};
