//! Shared fixtures for pipeline integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cutout_core::{
    BatchSnapshot, LoadProgress, ModelLoader, PipelineConfig, PipelineEvent, PngCompositor,
    SegmentationModel, Services, SourceFetcher, StandardDecoder,
};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgba, RgbaImage};
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub const TIMEOUT: Duration = Duration::from_secs(20);

/// Encode a `width`x`height` opaque gradient as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

pub fn config(preprocess: usize, segment: usize, postprocess: usize) -> PipelineConfig {
    PipelineConfig {
        progress_interval_ms: 5,
        ..PipelineConfig::default().with_pool_sizes(preprocess, segment, postprocess)
    }
}

/// Real decoder and compositor, in-memory fetcher, the given loader.
pub fn services(loader: Arc<dyn ModelLoader>) -> Services {
    Services {
        fetcher: Arc::new(StaticFetcher::default()),
        decoder: Arc::new(StandardDecoder::new(None)),
        loader,
        compositor: Arc::new(PngCompositor),
    }
}

// ============================================================================
// Models
// ============================================================================

/// Left half foreground, right half background.
pub struct HalfMask;

impl SegmentationModel for HalfMask {
    fn infer(&self, raster: &RgbaImage) -> Result<GrayImage> {
        let half = raster.width() / 2;
        Ok(GrayImage::from_fn(raster.width(), raster.height(), |x, _| {
            Luma([if x < half { 255 } else { 0 }])
        }))
    }
}

/// Sleeps `width` milliseconds per job, then behaves like [`HalfMask`].
pub struct WidthDelayModel;

impl SegmentationModel for WidthDelayModel {
    fn infer(&self, raster: &RgbaImage) -> Result<GrayImage> {
        std::thread::sleep(Duration::from_millis(raster.width() as u64));
        HalfMask.infer(raster)
    }
}

/// Panics on the first `panics` calls, then behaves like [`HalfMask`].
pub struct PanickingModel {
    remaining: AtomicUsize,
}

impl PanickingModel {
    pub fn new(panics: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(panics),
        })
    }
}

impl SegmentationModel for PanickingModel {
    fn infer(&self, raster: &RgbaImage) -> Result<GrayImage> {
        let left = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if left.is_ok() {
            panic!("segmentation runtime aborted");
        }
        HalfMask.infer(raster)
    }
}

/// Blocks each inference until the test releases it.
pub struct GatedModel {
    gate: Mutex<std_mpsc::Receiver<()>>,
}

impl GatedModel {
    pub fn new() -> (Arc<Self>, std_mpsc::Sender<()>) {
        let (tx, rx) = std_mpsc::channel();
        (
            Arc::new(Self {
                gate: Mutex::new(rx),
            }),
            tx,
        )
    }
}

impl SegmentationModel for GatedModel {
    fn infer(&self, raster: &RgbaImage) -> Result<GrayImage> {
        self.gate.lock().recv()?;
        HalfMask.infer(raster)
    }
}

// ============================================================================
// Loaders and fetchers
// ============================================================================

/// Counts loads, reporting progress in four steps; fails the first
/// `failures` attempts.
pub struct CountingLoader {
    loads: AtomicUsize,
    failures: usize,
    delay: Duration,
    model: Arc<dyn SegmentationModel>,
}

impl CountingLoader {
    pub fn new(model: Arc<dyn SegmentationModel>) -> Arc<Self> {
        Self::build(model, 0, Duration::ZERO)
    }

    pub fn failing_first(failures: usize, model: Arc<dyn SegmentationModel>) -> Arc<Self> {
        Self::build(model, failures, Duration::ZERO)
    }

    pub fn slow(delay: Duration, model: Arc<dyn SegmentationModel>) -> Arc<Self> {
        Self::build(model, 0, delay)
    }

    fn build(model: Arc<dyn SegmentationModel>, failures: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            failures,
            delay,
            model,
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for CountingLoader {
    async fn load(&self, progress: LoadProgress) -> Result<Arc<dyn SegmentationModel>> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
        for step in 1..=4 {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay / 4).await;
            }
            progress(step as f32 * 0.2);
        }
        if attempt < self.failures {
            anyhow::bail!("weights corrupted");
        }
        Ok(self.model.clone())
    }
}

/// Serves registered URLs from memory.
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, Bytes>,
}

impl StaticFetcher {
    pub fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.pages.insert(url.to_string(), Bytes::from(bytes));
        self
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        match self.pages.get(url) {
            Some(bytes) => Ok(bytes.clone()),
            None => anyhow::bail!("404 Not Found: {}", url),
        }
    }
}

// ============================================================================
// Observation helpers
// ============================================================================

/// Wait for the first event matching `pred`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<PipelineEvent>,
    mut pred: impl FnMut(&PipelineEvent) -> bool,
) -> PipelineEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Every event currently buffered.
pub fn buffered(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub async fn drained(pipeline: &cutout_core::Pipeline) -> BatchSnapshot {
    tokio::time::timeout(TIMEOUT, pipeline.drained())
        .await
        .expect("timed out waiting for the batch to drain")
        .unwrap()
}
