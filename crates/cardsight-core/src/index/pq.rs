//! Product quantization.
//!
//! A vector is split into `segments` contiguous sub-vectors; each sub-space
//! gets its own k-means codebook and a vector is stored as one centroid id per
//! segment. Queries are scored with per-segment inner-product lookup tables.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CardsightError, Result};
use crate::types::SearchMethod;
use crate::vector::dot;

use super::kmeans::{KMeans, KMeansConfig};
use super::{check_query, top_k, SearchHit, SimilaritySearch};

/// Product quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PqConfig {
    /// Number of sub-vectors; must divide the dimension.
    pub segments: usize,
    /// Bits per segment code, `1..=8`.
    pub bits: u8,
    /// K-means iterations per codebook.
    pub iterations: usize,
    /// Base seed; segment `s` trains with `seed + s`.
    pub seed: u64,
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            segments: 64,
            bits: 8,
            iterations: 25,
            seed: 42,
        }
    }
}

impl PqConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_segments(mut self, segments: usize) -> Self {
        self.segments = segments;
        self
    }

    #[must_use]
    pub const fn with_bits(mut self, bits: u8) -> Self {
        self.bits = bits;
        self
    }

    #[must_use]
    pub const fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Codebook size before clamping to the training set.
    #[must_use]
    pub const fn centroids(&self) -> usize {
        1 << self.bits
    }

    /// Checks the parameters against a vector dimension.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `bits` is outside `1..=8`, `segments` is zero
    /// or `dimension` is not divisible by `segments`.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if !(1..=8).contains(&self.bits) {
            return Err(CardsightError::InvalidConfig(format!(
                "pq bits must be in 1..=8, got {}",
                self.bits
            )));
        }
        if self.segments == 0 {
            return Err(CardsightError::InvalidConfig("pq segments must be > 0".into()));
        }
        if dimension % self.segments != 0 {
            return Err(CardsightError::InvalidConfig(format!(
                "dimension {dimension} is not divisible by {} pq segments",
                self.segments
            )));
        }
        Ok(())
    }
}

/// Trained per-segment codebooks.
#[derive(Debug, Clone)]
pub struct ProductQuantizer {
    config: PqConfig,
    dimension: usize,
    sub_dimension: usize,
    codebooks: Vec<KMeans>,
}

impl ProductQuantizer {
    /// Trains one codebook per segment on row-major `vectors`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unusable parameters or empty input and
    /// `DimensionMismatch` if `vectors` is not a whole number of rows.
    pub fn train(vectors: &[f32], dimension: usize, config: &PqConfig) -> Result<Self> {
        config.validate(dimension)?;
        if vectors.len() % dimension != 0 {
            return Err(CardsightError::DimensionMismatch {
                expected: dimension,
                actual: vectors.len() % dimension,
            });
        }
        let n = vectors.len() / dimension;
        if n == 0 {
            return Err(CardsightError::InvalidConfig(
                "cannot train pq on empty data".into(),
            ));
        }

        let k = config.centroids();
        if n < k {
            warn!(
                vectors = n,
                requested = k,
                "fewer vectors than pq centroids, clamping codebook size"
            );
        }

        let sub_dimension = dimension / config.segments;
        let mut codebooks = Vec::with_capacity(config.segments);
        let mut sub = Vec::with_capacity(n * sub_dimension);

        for segment in 0..config.segments {
            sub.clear();
            let start = segment * sub_dimension;
            for row in vectors.chunks_exact(dimension) {
                sub.extend_from_slice(&row[start..start + sub_dimension]);
            }

            let kmeans_config = KMeansConfig::new(k)
                .with_max_iterations(config.iterations)
                .with_seed(config.seed.wrapping_add(segment as u64));
            codebooks.push(KMeans::train(&sub, sub_dimension, &kmeans_config)?);
        }

        Ok(Self {
            config: *config,
            dimension,
            sub_dimension,
            codebooks,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PqConfig {
        &self.config
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn segments(&self) -> usize {
        self.codebooks.len()
    }

    /// Encodes one vector as a centroid id per segment.
    #[must_use]
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        debug_assert_eq!(vector.len(), self.dimension);
        vector
            .chunks_exact(self.sub_dimension)
            .zip(&self.codebooks)
            // at most 256 centroids, so the id fits a byte
            .map(|(sub, codebook)| codebook.nearest(sub) as u8)
            .collect()
    }

    /// Reconstructs a vector from its codes.
    #[must_use]
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimension);
        for (&code, codebook) in codes.iter().zip(&self.codebooks) {
            out.extend_from_slice(codebook.centroid(usize::from(code)));
        }
        out
    }

    /// Inner product of `query` with every centroid, `[segment][centroid]`.
    fn lookup_tables(&self, query: &[f32]) -> Vec<Vec<f32>> {
        query
            .chunks_exact(self.sub_dimension)
            .zip(&self.codebooks)
            .map(|(sub, codebook)| {
                (0..codebook.k())
                    .map(|c| dot(sub, codebook.centroid(c)))
                    .collect()
            })
            .collect()
    }
}

/// Index over product-quantized codes.
#[derive(Debug, Clone)]
pub struct PqIndex {
    quantizer: ProductQuantizer,
    codes: Vec<u8>,
    len: usize,
}

impl PqIndex {
    /// Trains a quantizer on `vectors` and encodes all of them.
    ///
    /// # Errors
    ///
    /// See [`ProductQuantizer::train`].
    pub fn build(vectors: &[f32], dimension: usize, config: &PqConfig) -> Result<Self> {
        let quantizer = ProductQuantizer::train(vectors, dimension, config)?;
        let len = vectors.len() / dimension;
        let mut codes = Vec::with_capacity(len * quantizer.segments());
        for row in vectors.chunks_exact(dimension) {
            codes.extend(quantizer.encode(row));
        }
        Ok(Self {
            quantizer,
            codes,
            len,
        })
    }

    #[must_use]
    pub fn quantizer(&self) -> &ProductQuantizer {
        &self.quantizer
    }

    /// Codes of stored vector `i`.
    #[must_use]
    pub fn codes(&self, i: usize) -> Option<&[u8]> {
        let m = self.quantizer.segments();
        self.codes.get(i * m..(i + 1) * m)
    }

    /// `f32` size over packed code size.
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        compression_ratio(
            self.len,
            self.quantizer.dimension(),
            self.quantizer.segments(),
            self.quantizer.config().bits,
        )
    }
}

impl SimilaritySearch for PqIndex {
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_query(self.len, self.quantizer.dimension(), query)?;
        let tables = self.quantizer.lookup_tables(query);
        let scores = self
            .codes
            .chunks_exact(self.quantizer.segments())
            .map(|codes| {
                codes
                    .iter()
                    .zip(&tables)
                    .map(|(&c, table)| table[usize::from(c)])
                    .sum::<f32>()
            });
        Ok(top_k(scores, k))
    }

    fn len(&self) -> usize {
        self.len
    }

    fn dimension(&self) -> usize {
        self.quantizer.dimension()
    }

    fn method(&self) -> SearchMethod {
        SearchMethod::ProductQuantization
    }
}

/// `(n * d * 4) / (n * m * bits / 8)`; zero for an empty set.
#[must_use]
pub fn compression_ratio(n: usize, dimension: usize, segments: usize, bits: u8) -> f64 {
    let packed = n as f64 * segments as f64 * f64::from(bits) / 8.0;
    if packed == 0.0 {
        return 0.0;
    }
    (n as f64 * dimension as f64 * 4.0) / packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::normalized;

    fn clustered(n: usize, dimension: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(n * dimension);
        for i in 0..n {
            let raw: Vec<f32> = (0..dimension)
                .map(|d| (((i * 31 + d * 17) % 23) as f32 - 11.0) / 11.0 + 0.05)
                .collect();
            out.extend(normalized(&raw).unwrap());
        }
        out
    }

    #[test]
    fn config_validation() {
        assert!(PqConfig::new().validate(512).is_ok());
        assert!(PqConfig::new().validate(500).is_err());
        assert!(PqConfig::new().with_bits(0).validate(512).is_err());
        assert!(PqConfig::new().with_bits(9).validate(512).is_err());
        assert!(PqConfig::new().with_segments(0).validate(512).is_err());
    }

    #[test]
    fn indivisible_dimension_is_rejected() {
        let data = clustered(10, 6);
        let err = PqIndex::build(&data, 6, &PqConfig::new().with_segments(4)).unwrap_err();
        assert!(matches!(err, CardsightError::InvalidConfig(_)));
    }

    #[test]
    fn small_catalog_clamps_codebook() {
        let data = clustered(5, 8);
        let index = PqIndex::build(&data, 8, &PqConfig::new().with_segments(4)).unwrap();
        assert_eq!(index.len(), 5);
        assert_eq!(index.quantizer().segments(), 4);
        // every vector is its own centroid, so reconstruction is exact
        for i in 0..5 {
            let codes = index.codes(i).unwrap();
            let restored = index.quantizer().decode(codes);
            for (a, b) in restored.iter().zip(&data[i * 8..(i + 1) * 8]) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn lookup_scores_match_decoded_dot() {
        let data = clustered(40, 8);
        let index = PqIndex::build(
            &data,
            8,
            &PqConfig::new().with_segments(2).with_bits(3).with_seed(1),
        )
        .unwrap();
        let query = &data[0..8];
        let hits = index.search(query, 40).unwrap();
        for hit in hits {
            let decoded = index.quantizer().decode(index.codes(hit.index).unwrap());
            assert!((dot(query, &decoded) - hit.score).abs() < 1e-5);
        }
    }

    #[test]
    fn same_seed_same_codes() {
        let data = clustered(30, 8);
        let config = PqConfig::new().with_segments(4).with_bits(2).with_seed(3);
        let a = PqIndex::build(&data, 8, &config).unwrap();
        let b = PqIndex::build(&data, 8, &config).unwrap();
        assert_eq!(a.codes, b.codes);
    }

    #[test]
    fn compression_ratio_for_default_config() {
        assert_eq!(compression_ratio(1000, 512, 64, 8), 32.0);
        assert_eq!(compression_ratio(0, 512, 64, 8), 0.0);
    }

    #[test]
    fn pq_config_serde_defaults() {
        let config: PqConfig = serde_json::from_str(r#"{"segments":16}"#).unwrap();
        assert_eq!(config.segments, 16);
        assert_eq!(config.bits, 8);
        assert_eq!(config.seed, 42);
    }
}
