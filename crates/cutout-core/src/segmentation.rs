//! Segmentation model collaborators.
//!
//! A [`ModelLoader`] produces a [`SegmentationModel`] once per segment
//! worker. The default loader downloads an ONNX model from HuggingFace
//! and runs it with tract.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::Cache;
use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbaImage};
use tract_onnx::prelude::*;

use crate::config::ModelConfig;

/// Load progress callback, called with a fraction in `0.0..=1.0`.
pub type LoadProgress = Arc<dyn Fn(f32) + Send + Sync>;

/// Share of the reported progress spent downloading; the rest is graph
/// optimization.
const DOWNLOAD_SHARE: f32 = 0.9;

/// A loaded model producing a foreground mask for a raster.
///
/// The returned mask must have the raster's dimensions; 255 is foreground.
pub trait SegmentationModel: Send + Sync {
    fn infer(&self, raster: &RgbaImage) -> Result<GrayImage>;
}

/// Loads a segmentation model, reporting progress along the way.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, progress: LoadProgress) -> Result<Arc<dyn SegmentationModel>>;
}

/// Downloads (or reuses) an ONNX model from the HuggingFace cache.
pub struct HubModelLoader {
    config: ModelConfig,
}

impl HubModelLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    async fn fetch_weights(&self, progress: &LoadProgress) -> Result<std::path::PathBuf> {
        let cache = Cache::new(self.config.cache_dir.clone());
        if let Some(path) = cache
            .model(self.config.repo_id.clone())
            .get(&self.config.filename)
        {
            tracing::info!(repo = %self.config.repo_id, "Using cached segmentation model");
            progress(DOWNLOAD_SHARE);
            return Ok(path);
        }

        tracing::info!(
            repo = %self.config.repo_id,
            file = %self.config.filename,
            "Downloading segmentation model"
        );
        let api = ApiBuilder::new()
            .with_cache_dir(cache.path().clone())
            .with_progress(false)
            .build()
            .context("Failed to create HuggingFace API client")?;

        api.model(self.config.repo_id.clone())
            .download_with_progress(&self.config.filename, DownloadTracker::new(progress.clone()))
            .await
            .with_context(|| format!("Failed to download {}", self.config.filename))
    }
}

#[async_trait]
impl ModelLoader for HubModelLoader {
    async fn load(&self, progress: LoadProgress) -> Result<Arc<dyn SegmentationModel>> {
        progress(0.0);
        let path = self.fetch_weights(&progress).await?;

        let config = self.config.clone();
        let model = tokio::task::spawn_blocking(move || OnnxSegmenter::from_path(&path, &config))
            .await
            .context("Model initialization task failed")??;

        progress(1.0);
        tracing::info!(repo = %self.config.repo_id, "Segmentation model ready");
        Ok(Arc::new(model))
    }
}

/// Forwards hf-hub download progress as a fraction of [`DOWNLOAD_SHARE`].
///
/// hf-hub clones the tracker for parallel chunk downloads, so counters
/// live behind an Arc.
#[derive(Clone)]
struct DownloadTracker {
    downloaded: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    progress: LoadProgress,
}

impl DownloadTracker {
    fn new(progress: LoadProgress) -> Self {
        Self {
            downloaded: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
            progress,
        }
    }

    fn report(&self) {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return;
        }
        let downloaded = self.downloaded.load(Ordering::SeqCst).min(total);
        (self.progress)(DOWNLOAD_SHARE * downloaded as f32 / total as f32);
    }
}

impl hf_hub::api::tokio::Progress for DownloadTracker {
    async fn init(&mut self, size: usize, _filename: &str) {
        self.total.store(size as u64, Ordering::SeqCst);
        self.downloaded.store(0, Ordering::SeqCst);
        self.report();
    }

    async fn update(&mut self, size: usize) {
        self.downloaded.fetch_add(size as u64, Ordering::SeqCst);
        self.report();
    }

    async fn finish(&mut self) {
        (self.progress)(DOWNLOAD_SHARE);
    }
}

/// ONNX segmentation model executed with tract.
///
/// Expects a `[1, 3, N, N]` float input and produces a `[1, 1, N, N]`
/// saliency map, which is min-max normalized into the mask.
pub struct OnnxSegmenter {
    plan: TypedRunnableModel<TypedModel>,
    input_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl OnnxSegmenter {
    pub fn from_path(path: &Path, config: &ModelConfig) -> Result<Self> {
        let size = config.input_size as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("Failed to read ONNX model {}", path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()?;

        Ok(Self {
            plan,
            input_size: config.input_size,
            mean: config.mean,
            std: config.std,
        })
    }
}

impl SegmentationModel for OnnxSegmenter {
    fn infer(&self, raster: &RgbaImage) -> Result<GrayImage> {
        let size = self.input_size;
        let resized = image::imageops::resize(raster, size, size, FilterType::Triangle);

        let input: Tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| {
                let value = resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0;
                (value - self.mean[c]) / self.std[c]
            },
        )
        .into();

        let outputs = self.plan.run(tvec!(input.into()))?;
        let view = outputs[0].to_array_view::<f32>()?;
        let values: Vec<f32> = view.iter().copied().collect();
        ensure!(
            values.len() == (size * size) as usize,
            "Unexpected model output shape {:?}",
            view.shape()
        );

        let (min, max) = values
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        let range = (max - min).max(f32::EPSILON);

        let small = GrayImage::from_fn(size, size, |x, y| {
            let v = (values[(y * size + x) as usize] - min) / range;
            Luma([(v * 255.0).round().clamp(0.0, 255.0) as u8])
        });

        Ok(image::imageops::resize(
            &small,
            raster.width(),
            raster.height(),
            FilterType::Triangle,
        ))
    }
}
