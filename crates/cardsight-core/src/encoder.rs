//! # Image Encoder
//!
//! Maps an RGB image to a dense visual embedding. The production encoder is a
//! CLIP ViT-B/32 image tower run with candle; tests use lightweight stand-ins.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::RgbImage;
use image::imageops::FilterType;
use serde::Deserialize;
use tracing::info;

use crate::error::{CardsightError, Result};

/// CLIP image normalization mean (RGB).
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// CLIP image normalization standard deviation (RGB).
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Produces embeddings for card images.
pub trait Encoder: Send + Sync {
    /// Dimension of the produced embeddings.
    fn dimension(&self) -> usize;

    /// Embeds a single image.
    ///
    /// # Errors
    ///
    /// Returns `Inference` when the model fails to run.
    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>>;

    /// Embeds several images, preserving order.
    ///
    /// # Errors
    ///
    /// Returns `Inference` when the model fails to run.
    fn embed_batch(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
        images.iter().map(|image| self.embed(image)).collect()
    }
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>> {
        (**self).embed(image)
    }

    fn embed_batch(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(images)
    }
}

/// Subset of a Hugging Face `config.json` checked against the loaded preset.
#[derive(Debug, Deserialize)]
struct HfClipConfig {
    projection_dim: Option<usize>,
    vision_config: Option<HfVisionConfig>,
}

#[derive(Debug, Deserialize)]
struct HfVisionConfig {
    image_size: Option<usize>,
    patch_size: Option<usize>,
}

/// CLIP ViT-B/32 image encoder.
pub struct ClipEncoder {
    model: ClipModel,
    device: Device,
    image_size: usize,
    dimension: usize,
}

impl ClipEncoder {
    /// File holding the model weights inside a model directory.
    pub const WEIGHTS_FILE: &'static str = "model.safetensors";
    /// Optional Hugging Face configuration inside a model directory.
    pub const CONFIG_FILE: &'static str = "config.json";

    /// Loads weights from `model_dir` on the CPU.
    ///
    /// # Errors
    ///
    /// Returns `ModelLoad` if the weights are missing, `config.json` describes
    /// a different architecture, or candle cannot build the model.
    pub fn load(model_dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_on(model_dir, Device::Cpu)
    }

    /// Loads weights from `model_dir` on `device`.
    ///
    /// # Errors
    ///
    /// See [`ClipEncoder::load`].
    pub fn load_on(model_dir: impl AsRef<Path>, device: Device) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let weights = model_dir.join(Self::WEIGHTS_FILE);
        if !weights.exists() {
            return Err(CardsightError::ModelLoad(format!(
                "Model not found at {}",
                weights.display()
            )));
        }

        let config = ClipConfig::vit_base_patch32();
        let dimension = 512;
        check_config_file(&model_dir.join(Self::CONFIG_FILE), dimension, config.image_size)?;

        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights.as_path()], DType::F32, &device) }
                .map_err(|e| CardsightError::ModelLoad(e.to_string()))?;
        let model =
            ClipModel::new(vb, &config).map_err(|e| CardsightError::ModelLoad(e.to_string()))?;

        info!(path = %weights.display(), dimension, "loaded CLIP image encoder");
        Ok(Self {
            model,
            device,
            image_size: config.image_size,
            dimension,
        })
    }

    /// Resizes and normalizes images into a `[batch, 3, size, size]` tensor.
    fn pixel_values(&self, images: &[RgbImage]) -> Result<Tensor> {
        let size = self.image_size;
        let plane = size * size;
        let mut data = vec![0f32; images.len() * 3 * plane];

        for (b, image) in images.iter().enumerate() {
            let resized =
                image::imageops::resize(image, size as u32, size as u32, FilterType::Triangle);
            let base = b * 3 * plane;
            for (i, pixel) in resized.pixels().enumerate() {
                for c in 0..3 {
                    let value = f32::from(pixel[c]) / 255.0;
                    data[base + c * plane + i] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
                }
            }
        }

        Ok(Tensor::from_vec(data, (images.len(), 3, size, size), &self.device)?)
    }
}

fn check_config_file(path: &Path, dimension: usize, image_size: usize) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CardsightError::ModelLoad(format!("Failed to read config: {e}")))?;
    let config: HfClipConfig = serde_json::from_str(&raw)
        .map_err(|e| CardsightError::ModelLoad(format!("Failed to parse config: {e}")))?;

    if let Some(projection_dim) = config.projection_dim {
        if projection_dim != dimension {
            return Err(CardsightError::ModelLoad(format!(
                "unsupported projection_dim {projection_dim}, expected {dimension}"
            )));
        }
    }
    if let Some(vision) = config.vision_config {
        let wrong_size = vision.image_size.is_some_and(|s| s != image_size);
        let wrong_patch = vision.patch_size.is_some_and(|p| p != 32);
        if wrong_size || wrong_patch {
            return Err(CardsightError::ModelLoad(
                "config.json does not describe a ViT-B/32 vision tower".into(),
            ));
        }
    }
    Ok(())
}

impl Encoder for ClipEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(std::slice::from_ref(image))?;
        batch
            .pop()
            .ok_or_else(|| CardsightError::Inference("encoder returned no embedding".into()))
    }

    fn embed_batch(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let pixels = self.pixel_values(images)?;
        let features = self
            .model
            .get_image_features(&pixels)
            .map_err(|e| CardsightError::Inference(e.to_string()))?;
        Ok(features.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }
}

impl std::fmt::Debug for ClipEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipEncoder")
            .field("device", &self.device)
            .field("image_size", &self.image_size)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}
