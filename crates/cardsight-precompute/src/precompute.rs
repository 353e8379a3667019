//! Chunked batch precompute of reference embeddings.
//!
//! Cards are processed in id order, one chunk at a time. Inside a chunk a
//! bounded pool downloads images and extracts local features; prepared images
//! are then embedded in batches on the inference thread and saved. The last
//! card id of every finished chunk is checkpointed in the store.

use std::sync::Arc;

use cardsight_core::Encoder;
use cardsight_core::vector::normalized;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::download::{ImageFetcher, RetryConfig};
use crate::error::{PrecomputeError, Result};
use crate::features::LocalFeatures;
use crate::inference::InferenceWorker;
use crate::store::{CardStore, PendingCard};

/// Batch precompute settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecomputeConfig {
    /// Cards per checkpointed chunk.
    pub chunk_size: usize,
    /// Concurrent download and feature tasks.
    pub workers: usize,
    /// Images per inference batch.
    pub batch_size: usize,
    /// Download retry policy.
    pub retry: RetryConfig,
    /// Ignore the stored checkpoint and start from the first card.
    pub restart: bool,
}

impl Default for PrecomputeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            workers: 4,
            batch_size: 16,
            retry: RetryConfig::default(),
            restart: false,
        }
    }
}

impl PrecomputeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, 64);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }
}

/// Counters of one precompute run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecomputeSummary {
    pub processed: usize,
    pub saved: usize,
    pub download_failed: usize,
    pub feature_failed: usize,
    pub embedding_failed: usize,
    pub chunks: usize,
}

/// Result of preparing one card on the worker pool.
#[derive(Debug)]
pub enum ItemOutcome {
    Prepared {
        card_id: i64,
        image: RgbImage,
        features: LocalFeatures,
    },
    DownloadFailed {
        card_id: i64,
        error: PrecomputeError,
    },
    FeatureFailed {
        card_id: i64,
        error: PrecomputeError,
    },
}

/// Runs precompute over every card after the checkpoint.
///
/// # Errors
///
/// Returns `Store` if the card store fails and `Io` if the inference thread
/// cannot start. Per-card failures are counted, never returned.
pub async fn run<E, F>(
    store: &CardStore,
    encoder: E,
    fetcher: F,
    config: &PrecomputeConfig,
) -> Result<PrecomputeSummary>
where
    E: Encoder + 'static,
    F: ImageFetcher,
{
    if config.restart {
        store.clear_checkpoint()?;
    }
    let resume_after = store.checkpoint()?;
    let cards = store.cards_after(resume_after)?;
    if let Some(id) = resume_after {
        info!(after = id, remaining = cards.len(), "resuming precompute");
    }

    let total_chunks = cards.len().div_ceil(config.chunk_size.max(1));
    info!(cards = cards.len(), chunks = total_chunks, "starting precompute");

    let worker = InferenceWorker::spawn(encoder)?;
    let fetcher = Arc::new(fetcher);
    let mut summary = PrecomputeSummary::default();

    for (i, chunk) in cards.chunks(config.chunk_size.max(1)).enumerate() {
        let outcomes = prepare_chunk(chunk, &fetcher, config.workers).await;
        let saved = embed_and_save(store, &worker, outcomes, config.batch_size, &mut summary).await?;

        summary.processed += chunk.len();
        summary.chunks += 1;
        if let Some(last) = chunk.last() {
            store.set_checkpoint(last.id)?;
        }
        info!(
            chunk = i + 1,
            of = total_chunks,
            saved,
            cards = chunk.len(),
            "chunk finished"
        );
    }

    worker.shutdown();
    info!(
        processed = summary.processed,
        saved = summary.saved,
        download_failed = summary.download_failed,
        feature_failed = summary.feature_failed,
        embedding_failed = summary.embedding_failed,
        "precompute finished"
    );
    Ok(summary)
}

/// Downloads and extracts features for one chunk on a bounded pool.
///
/// Outcomes are returned in card order.
async fn prepare_chunk<F: ImageFetcher>(
    chunk: &[PendingCard],
    fetcher: &Arc<F>,
    workers: usize,
) -> Vec<ItemOutcome> {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let (tx, mut rx) = mpsc::channel(chunk.len().max(1));
    let mut tasks = JoinSet::new();

    for card in chunk.iter().cloned() {
        let permits = Arc::clone(&permits);
        let fetcher = Arc::clone(fetcher);
        let tx = tx.clone();
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let outcome = prepare_card(card, fetcher.as_ref()).await;
            // the receiver lives until every sender is gone
            let _ = tx.send(outcome).await;
        });
    }
    drop(tx);

    let mut outcomes = Vec::with_capacity(chunk.len());
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "precompute task panicked");
        }
    }

    outcomes.sort_by_key(ItemOutcome::card_id);
    outcomes
}

async fn prepare_card<F: ImageFetcher>(card: PendingCard, fetcher: &F) -> ItemOutcome {
    let card_id = card.id;
    let Some(url) = card.image_url else {
        return ItemOutcome::DownloadFailed {
            card_id,
            error: PrecomputeError::Download {
                url: String::new(),
                reason: "card has no image url".into(),
            },
        };
    };

    let bytes = match fetcher.fetch(&url).await {
        Ok(bytes) => bytes,
        Err(error) => return ItemOutcome::DownloadFailed { card_id, error },
    };

    let extracted = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes)
            .map_err(|e| PrecomputeError::FeatureExtraction(format!("undecodable image: {e}")))?
            .to_rgb8();
        let features = LocalFeatures::extract(&image)?;
        Ok::<_, PrecomputeError>((image, features))
    })
    .await;

    match extracted {
        Ok(Ok((image, features))) => ItemOutcome::Prepared {
            card_id,
            image,
            features,
        },
        Ok(Err(error)) => ItemOutcome::FeatureFailed { card_id, error },
        Err(e) => ItemOutcome::FeatureFailed {
            card_id,
            error: PrecomputeError::FeatureExtraction(e.to_string()),
        },
    }
}

/// Embeds prepared cards in batches and saves the complete ones.
async fn embed_and_save(
    store: &CardStore,
    worker: &InferenceWorker,
    outcomes: Vec<ItemOutcome>,
    batch_size: usize,
    summary: &mut PrecomputeSummary,
) -> Result<usize> {
    let mut prepared = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            ItemOutcome::Prepared {
                card_id,
                image,
                features,
            } => prepared.push((card_id, image, features)),
            ItemOutcome::DownloadFailed { card_id, error } => {
                warn!(card_id, error = %error, "download failed");
                summary.download_failed += 1;
            }
            ItemOutcome::FeatureFailed { card_id, error } => {
                warn!(card_id, error = %error, "feature extraction failed");
                summary.feature_failed += 1;
            }
        }
    }

    let mut saved = 0;
    let mut rest = prepared.into_iter().peekable();
    while rest.peek().is_some() {
        let batch: Vec<_> = rest.by_ref().take(batch_size.max(1)).collect();
        let (ids, images, features): (Vec<i64>, Vec<RgbImage>, Vec<LocalFeatures>) =
            batch.into_iter().fold(
                (Vec::new(), Vec::new(), Vec::new()),
                |(mut ids, mut images, mut features), (id, image, f)| {
                    ids.push(id);
                    images.push(image);
                    features.push(f);
                    (ids, images, features)
                },
            );

        let embeddings = match worker.embed(images).await {
            Ok(embeddings) if embeddings.len() == ids.len() => embeddings,
            Ok(embeddings) => {
                warn!(expected = ids.len(), got = embeddings.len(), "encoder returned a short batch");
                summary.embedding_failed += ids.len();
                continue;
            }
            Err(e) if e.is_per_item() => {
                warn!(cards = ids.len(), error = %e, "embedding batch failed");
                summary.embedding_failed += ids.len();
                continue;
            }
            Err(e) => return Err(e),
        };

        for ((card_id, embedding), features) in ids.into_iter().zip(embeddings).zip(&features) {
            let Some(unit) = normalized(&embedding) else {
                warn!(card_id, "encoder produced a zero-norm embedding");
                summary.embedding_failed += 1;
                continue;
            };
            store.save_features(card_id, &unit, features)?;
            debug!(card_id, "saved card features");
            saved += 1;
        }
    }

    summary.saved += saved;
    Ok(saved)
}

impl ItemOutcome {
    #[must_use]
    pub fn card_id(&self) -> i64 {
        match self {
            Self::Prepared { card_id, .. }
            | Self::DownloadFailed { card_id, .. }
            | Self::FeatureFailed { card_id, .. } => *card_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewCard;
    use cardsight_core::{CardSource, CardsightError};
    use image::{DynamicImage, ImageFormat, Rgb};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Serves PNGs from memory; unknown urls fail like a 404.
    struct MemoryFetcher {
        images: HashMap<String, Vec<u8>>,
        requests: Mutex<Vec<String>>,
    }

    impl ImageFetcher for MemoryFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(url.to_string());
            self.images
                .get(url)
                .cloned()
                .ok_or_else(|| PrecomputeError::Download {
                    url: url.to_string(),
                    reason: "HTTP 404 Not Found".into(),
                })
        }
    }

    /// Embeds the mean RGB color.
    struct ColorEncoder;

    impl Encoder for ColorEncoder {
        fn dimension(&self) -> usize {
            3
        }

        fn embed(&self, image: &RgbImage) -> cardsight_core::Result<Vec<f32>> {
            let p = image.get_pixel(0, 0);
            Ok(vec![f32::from(p[0]), f32::from(p[1]), f32::from(p[2])])
        }
    }

    struct BrokenEncoder;

    impl Encoder for BrokenEncoder {
        fn dimension(&self) -> usize {
            3
        }

        fn embed(&self, _image: &RgbImage) -> cardsight_core::Result<Vec<f32>> {
            Err(CardsightError::Inference("out of memory".into()))
        }
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb(color)))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn url(id: i64) -> String {
        format!("https://images.example/cards/{id}.png")
    }

    fn fixture(ids: &[i64], missing: &[i64]) -> (CardStore, MemoryFetcher) {
        let store = CardStore::open_in_memory().unwrap();
        let cards: Vec<NewCard> = ids
            .iter()
            .map(|&id| NewCard {
                id,
                name: format!("card {id}"),
                number: String::new(),
                rarity: String::new(),
                price: String::new(),
                set_title: None,
                image_url: Some(url(id)),
            })
            .collect();
        store.upsert_cards(&cards).unwrap();

        let mut images = HashMap::new();
        for &id in ids {
            if !missing.contains(&id) {
                images.insert(url(id), png([(id as u8).wrapping_mul(10), 100, 50]));
            }
        }
        // a corrupt download
        images.insert(url(99), b"<html>not an image</html>".to_vec());

        let fetcher = MemoryFetcher {
            images,
            requests: Mutex::new(Vec::new()),
        };
        (store, fetcher)
    }

    #[tokio::test]
    async fn failing_items_are_counted_not_fatal() {
        let (store, fetcher) = fixture(&[1, 2, 3, 4, 99], &[3]);
        let config = PrecomputeConfig::new().with_chunk_size(2).with_batch_size(2);
        let summary = run(&store, ColorEncoder, fetcher, &config).await.unwrap();

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.saved, 3);
        assert_eq!(summary.download_failed, 1);
        assert_eq!(summary.feature_failed, 1);
        assert_eq!(summary.embedding_failed, 0);

        let records = store.load_records().unwrap();
        let with_embedding: Vec<i64> = records
            .iter()
            .filter(|r| r.embedding.is_some())
            .map(|r| r.id)
            .collect();
        assert_eq!(with_embedding, vec![1, 2, 4]);

        // stored embeddings are unit length
        let v = records[0].embedding.as_ref().unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(store.checkpoint().unwrap(), Some(99));
    }

    #[tokio::test]
    async fn resumes_after_checkpoint() {
        let (store, fetcher) = fixture(&[1, 2, 3, 4], &[]);
        store.set_checkpoint(2).unwrap();
        let fetcher = Arc::new(fetcher);

        let summary = run(&store, ColorEncoder, Arc::clone(&fetcher), &PrecomputeConfig::new())
            .await
            .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.saved, 2);

        let mut requested = fetcher.requests.lock().unwrap().clone();
        requested.sort();
        assert_eq!(requested, vec![url(3), url(4)]);

        // restart ignores the checkpoint
        let summary = run(
            &store,
            ColorEncoder,
            Arc::clone(&fetcher),
            &PrecomputeConfig::new().with_restart(true),
        )
        .await
        .unwrap();
        assert_eq!(summary.processed, 4);
        assert_eq!(store.counts().unwrap().with_embedding, 4);
    }

    #[tokio::test]
    async fn encoder_failure_skips_the_batch() {
        let (store, fetcher) = fixture(&[1, 2], &[]);
        let summary = run(&store, BrokenEncoder, fetcher, &PrecomputeConfig::new())
            .await
            .unwrap();
        assert_eq!(summary.saved, 0);
        assert_eq!(summary.embedding_failed, 2);
        assert_eq!(store.checkpoint().unwrap(), Some(2));
    }

    #[test]
    fn config_builders_clamp() {
        let config = PrecomputeConfig::new()
            .with_chunk_size(0)
            .with_workers(0)
            .with_batch_size(0);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.workers, 1);
        assert_eq!(config.batch_size, 1);
    }
}
