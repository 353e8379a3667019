//! K-means clustering used to train product-quantization codebooks.

use oorandom::Rand64;

use crate::error::{CardsightError, Result};
use crate::vector::squared_l2;

/// Configuration for k-means clustering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansConfig {
    /// Number of clusters.
    pub k: usize,
    /// Maximum number of Lloyd iterations.
    pub max_iterations: usize,
    /// Stop when no centroid moves further than this (squared distance).
    pub convergence_threshold: f32,
    /// Seed for k-means++ initialization.
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            k: 256,
            max_iterations: 25,
            convergence_threshold: 1e-10,
            seed: 42,
        }
    }
}

impl KMeansConfig {
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Trained centroids.
#[derive(Debug, Clone)]
pub struct KMeans {
    /// Row-major `[k][dimension]` centroids.
    pub centroids: Vec<f32>,
    /// Length of each centroid.
    pub dimension: usize,
    /// Lloyd iterations run before convergence or the cap.
    pub iterations: usize,
    /// Sum of squared distances to the assigned centroid.
    pub inertia: f32,
}

impl KMeans {
    /// Trains on row-major `data` of the given dimension.
    ///
    /// `k` is clamped to the number of points.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty input, a zero dimension or `k == 0`.
    pub fn train(data: &[f32], dimension: usize, config: &KMeansConfig) -> Result<Self> {
        if dimension == 0 || data.len() % dimension != 0 {
            return Err(CardsightError::InvalidConfig(format!(
                "k-means data of length {} is not a multiple of dimension {dimension}",
                data.len()
            )));
        }
        let n = data.len() / dimension;
        if n == 0 {
            return Err(CardsightError::InvalidConfig(
                "cannot train k-means on empty data".into(),
            ));
        }
        if config.k == 0 {
            return Err(CardsightError::InvalidConfig("k must be > 0".into()));
        }
        let k = config.k.min(n);

        let mut rng = Rand64::new(u128::from(config.seed));
        let mut centroids = plus_plus_init(data, dimension, k, &mut rng);
        let mut assignments = vec![0usize; n];
        let mut iterations = 0;
        let mut inertia = f32::MAX;

        for _ in 0..config.max_iterations {
            iterations += 1;
            inertia = assign(data, dimension, &centroids, &mut assignments);
            let updated = update(data, dimension, k, &assignments, &mut rng);

            let movement = centroids
                .chunks_exact(dimension)
                .zip(updated.chunks_exact(dimension))
                .map(|(a, b)| squared_l2(a, b))
                .fold(0.0f32, f32::max);
            centroids = updated;

            if movement <= config.convergence_threshold {
                break;
            }
        }

        Ok(Self {
            centroids,
            dimension,
            iterations,
            inertia,
        })
    }

    /// Number of centroids.
    #[must_use]
    pub fn k(&self) -> usize {
        self.centroids.len() / self.dimension
    }

    /// Centroid `i`.
    #[must_use]
    pub fn centroid(&self, i: usize) -> &[f32] {
        &self.centroids[i * self.dimension..(i + 1) * self.dimension]
    }

    /// Index of the nearest centroid (first one on ties).
    #[must_use]
    pub fn nearest(&self, point: &[f32]) -> usize {
        nearest(point, &self.centroids, self.dimension).0
    }
}

fn nearest(point: &[f32], centroids: &[f32], dimension: usize) -> (usize, f32) {
    let mut best = (0usize, f32::MAX);
    for (j, c) in centroids.chunks_exact(dimension).enumerate() {
        let d = squared_l2(point, c);
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

/// k-means++: each new centroid is drawn with probability proportional to the
/// squared distance to the closest centroid chosen so far.
fn plus_plus_init(data: &[f32], dimension: usize, k: usize, rng: &mut Rand64) -> Vec<f32> {
    let n = data.len() / dimension;
    let row = |i: usize| &data[i * dimension..(i + 1) * dimension];

    let mut centroids = Vec::with_capacity(k * dimension);
    let first = rng.rand_range(0..n as u64) as usize;
    centroids.extend_from_slice(row(first));

    let mut min_dist: Vec<f32> = (0..n).map(|i| squared_l2(row(i), row(first))).collect();

    for _ in 1..k {
        let total: f64 = min_dist.iter().map(|&d| f64::from(d)).sum();
        let chosen = if total <= 0.0 {
            rng.rand_range(0..n as u64) as usize
        } else {
            let threshold = rng.rand_float() * total;
            let mut cumsum = 0.0f64;
            let mut selected = n - 1;
            for (i, &d) in min_dist.iter().enumerate() {
                cumsum += f64::from(d);
                if cumsum >= threshold && d > 0.0 {
                    selected = i;
                    break;
                }
            }
            selected
        };

        centroids.extend_from_slice(row(chosen));
        for (i, d) in min_dist.iter_mut().enumerate() {
            *d = d.min(squared_l2(row(i), row(chosen)));
        }
    }

    centroids
}

fn assign(data: &[f32], dimension: usize, centroids: &[f32], assignments: &mut [usize]) -> f32 {
    let mut inertia = 0.0f32;
    for (i, point) in data.chunks_exact(dimension).enumerate() {
        let (j, d) = nearest(point, centroids, dimension);
        assignments[i] = j;
        inertia += d;
    }
    inertia
}

fn update(
    data: &[f32],
    dimension: usize,
    k: usize,
    assignments: &[usize],
    rng: &mut Rand64,
) -> Vec<f32> {
    let n = assignments.len();
    let mut sums = vec![0.0f32; k * dimension];
    let mut counts = vec![0usize; k];

    for (point, &cluster) in data.chunks_exact(dimension).zip(assignments) {
        counts[cluster] += 1;
        let target = &mut sums[cluster * dimension..(cluster + 1) * dimension];
        for (t, v) in target.iter_mut().zip(point) {
            *t += v;
        }
    }

    for (cluster, &count) in counts.iter().enumerate() {
        let target = &mut sums[cluster * dimension..(cluster + 1) * dimension];
        if count > 0 {
            let inv = 1.0 / count as f32;
            target.iter_mut().for_each(|t| *t *= inv);
        } else {
            // empty cluster: restart from a random point
            let i = rng.rand_range(0..n as u64) as usize;
            target.copy_from_slice(&data[i * dimension..(i + 1) * dimension]);
        }
    }

    sums
}
