//! # Identification Pipeline
//!
//! Orchestrates detection, cropping, encoding and search for a query image.
//!
//! The catalog snapshot is loaded lazily on first use. Only one caller builds
//! it; callers that arrive while a build is in progress get
//! [`CardsightError::ModelUnavailable`] immediately instead of waiting. A
//! failed build leaves the pipeline unloaded so the next call retries.

mod snapshot;

pub use snapshot::CatalogSnapshot;

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::Instant;

use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogConfig;
use crate::detector::{Detector, DetectorConfig, RegionDetector};
use crate::encoder::Encoder;
use crate::error::{CardsightError, Result};
use crate::image_ops::{crop_candidate, decode_image, flatten_onto_white};
use crate::index::{IndexStrategy, SimilaritySearch};
use crate::types::{CardRecord, DetectionCandidate, MatchResult, Performance};
use crate::vector::normalized;

/// Supplies the card records a snapshot is built from.
pub trait CardSource: Send + Sync {
    /// Loads every card record.
    ///
    /// # Errors
    ///
    /// Returns `CardSource` when the backing store cannot be read.
    fn load_records(&self) -> Result<Vec<CardRecord>>;
}

impl CardSource for Vec<CardRecord> {
    fn load_records(&self) -> Result<Vec<CardRecord>> {
        Ok(self.clone())
    }
}

impl<S: CardSource + ?Sized> CardSource for Arc<S> {
    fn load_records(&self) -> Result<Vec<CardRecord>> {
        (**self).load_records()
    }
}

/// Configuration of the identification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Embedding dimension and code width of the catalog.
    pub catalog: CatalogConfig,
    /// Search structure built over the catalog.
    pub strategy: IndexStrategy,
    /// Region filter thresholds.
    pub detector: DetectorConfig,
    /// Delay suggested to callers that hit a load in progress.
    pub retry_after_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            strategy: IndexStrategy::default(),
            detector: DetectorConfig::default(),
            retry_after_secs: 5,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: CatalogConfig) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: IndexStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    #[must_use]
    pub fn with_retry_after_secs(mut self, secs: u64) -> Self {
        self.retry_after_secs = secs.max(1);
        self
    }
}

/// Load state of the catalog snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// No snapshot yet; the next query starts a load.
    NotLoaded,
    /// A load is running.
    Initializing,
    /// A snapshot is serving queries.
    Ready,
}

impl PipelineStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            STATE_LOADING => Self::Initializing,
            STATE_READY => Self::Ready,
            _ => Self::NotLoaded,
        }
    }
}

/// Serializable status summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    /// Queries are answered.
    pub model_ready: bool,
    /// Queries get `ModelUnavailable` until the load ends.
    pub model_initializing: bool,
    pub status: PipelineStatus,
}

impl From<PipelineStatus> for ModelStatus {
    fn from(status: PipelineStatus) -> Self {
        Self {
            model_ready: status == PipelineStatus::Ready,
            model_initializing: status == PipelineStatus::Initializing,
            status,
        }
    }
}

const STATE_UNLOADED: u8 = 0;
const STATE_LOADING: u8 = 1;
const STATE_READY: u8 = 2;

/// Load-state transition held for the duration of one build.
///
/// Dropping it without [`LoadingState::finish`], on error or on unwind,
/// restores the state the build started from.
struct LoadingState<'a> {
    state: &'a AtomicU8,
    revert_to: u8,
    finished: bool,
}

impl<'a> LoadingState<'a> {
    /// A build over a ready snapshot keeps reporting ready while it runs.
    fn enter(state: &'a AtomicU8, was_ready: bool) -> Self {
        let revert_to = if was_ready {
            STATE_READY
        } else {
            state.store(STATE_LOADING, Ordering::Release);
            STATE_UNLOADED
        };
        Self {
            state,
            revert_to,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
        self.state.store(STATE_READY, Ordering::Release);
    }
}

impl Drop for LoadingState<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.store(self.revert_to, Ordering::Release);
        }
    }
}

/// Detector → crop → encode → search, over a lazily loaded snapshot.
pub struct IdentificationPipeline<E, D, S> {
    encoder: E,
    detector: RegionDetector<D>,
    source: S,
    config: PipelineConfig,
    load_guard: Mutex<()>,
    state: AtomicU8,
    next_version: AtomicU64,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
}

impl<E, D, S> IdentificationPipeline<E, D, S>
where
    E: Encoder,
    D: Detector,
    S: CardSource,
{
    /// Creates an unloaded pipeline. Nothing is read until the first query.
    pub fn new(encoder: E, detector: D, source: S, config: PipelineConfig) -> Self {
        Self {
            encoder,
            detector: RegionDetector::new(detector, config.detector),
            source,
            config,
            load_guard: Mutex::new(()),
            state: AtomicU8::new(STATE_UNLOADED),
            next_version: AtomicU64::new(1),
            current: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    #[must_use]
    pub fn is_initializing(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_LOADING
    }

    #[must_use]
    pub fn status(&self) -> ModelStatus {
        PipelineStatus::from_u8(self.state.load(Ordering::Acquire)).into()
    }

    fn loaded(&self) -> Option<Arc<CatalogSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the current snapshot, loading it if needed.
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` while another caller is loading, or the
    /// load failure itself.
    pub fn snapshot(&self) -> Result<Arc<CatalogSnapshot>> {
        if let Some(snapshot) = self.loaded() {
            return Ok(snapshot);
        }

        let _guard = match self.load_guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(CardsightError::ModelUnavailable {
                    retry_after_secs: self.config.retry_after_secs,
                });
            }
        };

        // another caller may have finished between the read and the lock
        if let Some(snapshot) = self.loaded() {
            return Ok(snapshot);
        }

        let loading = LoadingState::enter(&self.state, false);
        info!("loading card catalog");
        match self.build_snapshot() {
            Ok(snapshot) => {
                *self.current.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::clone(&snapshot));
                loading.finish();
                info!(version = snapshot.version(), cards = snapshot.len(), "catalog ready");
                Ok(snapshot)
            }
            Err(err) => {
                error!(error = %err, "catalog load failed");
                Err(err)
            }
        }
    }

    /// Builds a fresh snapshot from the card source and swaps it in.
    ///
    /// Queries already running keep the snapshot they started with. Returns
    /// the new version.
    ///
    /// # Errors
    ///
    /// Returns the build failure; the previous snapshot, if any, stays active.
    pub fn rebuild(&self) -> Result<u64> {
        let _guard = self.load_guard.lock().unwrap_or_else(PoisonError::into_inner);
        let loading = LoadingState::enter(&self.state, self.is_ready());

        match self.build_snapshot() {
            Ok(snapshot) => {
                let version = snapshot.version();
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
                loading.finish();
                info!(version, "catalog rebuilt");
                Ok(version)
            }
            Err(err) => {
                error!(error = %err, "catalog rebuild failed");
                Err(err)
            }
        }
    }

    fn build_snapshot(&self) -> Result<Arc<CatalogSnapshot>> {
        let records = self.source.load_records()?;
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(CatalogSnapshot::build(version, records, &self.config)?))
    }

    /// Identifies every acceptable card region in `image`.
    ///
    /// Results follow the detector's candidate order; rejected candidates are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` while the catalog is loading, or any
    /// detection, encoding or search failure.
    pub fn identify(&self, image: &DynamicImage) -> Result<Vec<MatchResult>> {
        let snapshot = self.snapshot()?;
        self.identify_with(&snapshot, image)
    }

    /// Decodes `bytes` and identifies it, attaching a timing breakdown.
    ///
    /// # Errors
    ///
    /// Returns `InvalidImage` if the bytes cannot be decoded, otherwise as
    /// [`IdentificationPipeline::identify`].
    pub fn identify_bytes(&self, bytes: &[u8]) -> Result<Vec<MatchResult>> {
        let start = Instant::now();
        let image = decode_image(bytes)?;
        let image_load_time = start.elapsed().as_secs_f64();

        let init_start = Instant::now();
        let snapshot = self.snapshot()?;
        let model_init_time = init_start.elapsed().as_secs_f64();

        let identify_start = Instant::now();
        let mut matches = self.identify_with(&snapshot, &image)?;
        let identification_time = identify_start.elapsed().as_secs_f64();

        let performance = Performance {
            total_time: start.elapsed().as_secs_f64(),
            image_load_time,
            model_init_time,
            identification_time,
        };
        for m in &mut matches {
            m.performance = Some(performance);
        }
        Ok(matches)
    }

    fn identify_with(
        &self,
        snapshot: &CatalogSnapshot,
        image: &DynamicImage,
    ) -> Result<Vec<MatchResult>> {
        let size = image.dimensions();
        let candidates = self.detector.propose(image)?;
        let mut matches = Vec::with_capacity(candidates.len());

        for (i, candidate) in candidates.into_iter().enumerate() {
            if !self.detector.is_acceptable(size, &candidate) {
                info!(detection = i + 1, bbox = %candidate.bbox, "detection rejected as low quality");
                continue;
            }
            let Some(crop) = crop_candidate(image, &candidate.bbox) else {
                warn!(detection = i + 1, bbox = %candidate.bbox, "detection is outside the image");
                continue;
            };
            matches.push(self.match_region(snapshot, &crop, candidate)?);
        }

        debug!(matches = matches.len(), version = snapshot.version(), "identification done");
        Ok(matches)
    }

    fn match_region(
        &self,
        snapshot: &CatalogSnapshot,
        crop: &DynamicImage,
        detection: DetectionCandidate,
    ) -> Result<MatchResult> {
        let rgb = flatten_onto_white(crop);
        let embedding = self.encoder.embed(&rgb)?;
        let query = normalized(&embedding)
            .ok_or_else(|| CardsightError::Inference("encoder produced a zero-norm embedding".into()))?;

        let index = snapshot.index();
        let hit = index
            .search(&query, 1)?
            .into_iter()
            .next()
            .ok_or(CardsightError::EmptyIndex)?;
        let metadata = snapshot
            .catalog()
            .metadata(hit.index)
            .cloned()
            .ok_or(CardsightError::EmptyIndex)?;

        Ok(MatchResult {
            card_id: metadata.id,
            metadata,
            similarity_score: hit.score,
            method: index.method(),
            quantization_bits: index.quantization_bits(),
            detection,
            performance: None,
        })
    }
}

impl<E, D, S> std::fmt::Debug for IdentificationPipeline<E, D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentificationPipeline")
            .field("config", &self.config)
            .field("state", &PipelineStatus::from_u8(self.state.load(Ordering::Relaxed)))
            .finish_non_exhaustive()
    }
}
