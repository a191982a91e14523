//! Image collaborators: fetching, decoding and compositing.
//!
//! The pipeline treats these as opaque services. Defaults are provided
//! for the `image` crate and `reqwest`; tests and embedders can swap any
//! of them out.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};
use serde::Serialize;

/// Final composited image with an alpha channel.
#[derive(Debug, Clone, Serialize)]
pub struct OutputImage {
    pub width: u32,
    pub height: u32,
    /// Encoded bytes (PNG)
    #[serde(skip)]
    pub bytes: Bytes,
}

/// Fetches source bytes for URL inputs.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// HTTP(S) fetcher backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        tracing::debug!(url, "Fetching source image");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?
            .error_for_status()
            .with_context(|| format!("Bad response for {}", url))?;

        response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {}", url))
    }
}

/// Decodes raw bytes into the pipeline's uniform raster encoding (RGBA8).
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<RgbaImage>;
}

/// Decoder for every format the `image` crate was built with.
#[derive(Debug, Clone, Default)]
pub struct StandardDecoder {
    /// Optional cap on the long edge; larger images are downscaled
    max_dimension: Option<u32>,
}

impl StandardDecoder {
    pub fn new(max_dimension: Option<u32>) -> Self {
        Self { max_dimension }
    }
}

impl ImageDecoder for StandardDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<RgbaImage> {
        ensure!(!bytes.is_empty(), "Source is empty");

        let image = image::load_from_memory(bytes).context("Unsupported or corrupt image")?;
        if image.width() == 0 || image.height() == 0 {
            bail!("Image has no pixels");
        }

        let image = match self.max_dimension {
            Some(max) if image.width().max(image.height()) > max => {
                tracing::debug!(
                    width = image.width(),
                    height = image.height(),
                    max,
                    "Downscaling source"
                );
                // resize() keeps the aspect ratio within the bounding box
                image.resize(max, max, FilterType::Triangle)
            }
            _ => image,
        };

        Ok(image.into_rgba8())
    }
}

/// Combines a raster with its mask into the final output.
pub trait Compositor: Send + Sync {
    fn composite(&self, raster: &RgbaImage, mask: &GrayImage) -> Result<OutputImage>;
}

/// Writes the mask into the alpha channel and encodes PNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngCompositor;

impl Compositor for PngCompositor {
    fn composite(&self, raster: &RgbaImage, mask: &GrayImage) -> Result<OutputImage> {
        if raster.dimensions() != mask.dimensions() {
            bail!(
                "Mask is {}x{} but image is {}x{}",
                mask.width(),
                mask.height(),
                raster.width(),
                raster.height()
            );
        }

        let mut output = raster.clone();
        for (pixel, alpha) in output.pixels_mut().zip(mask.pixels()) {
            pixel.0[3] = alpha.0[0];
        }

        let (width, height) = output.dimensions();
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(output)
            .write_to(&mut buf, ImageFormat::Png)
            .context("Failed to encode PNG")?;

        Ok(OutputImage {
            width,
            height,
            bytes: Bytes::from(buf.into_inner()),
        })
    }
}
