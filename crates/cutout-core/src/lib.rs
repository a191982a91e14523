//! Cutout Core - client-side image background removal
//!
//! This crate contains the whole pipeline:
//! - Job/worker-pool orchestration with per-stage queues
//! - Stage workers: preprocess (fetch + decode), segment (ONNX model),
//!   postprocess (alpha composite + PNG)
//! - Per-worker model lifecycle with throttled load progress
//! - Configuration and error types

pub mod config;
pub mod error;
pub mod imaging;
pub mod pipeline;
pub mod segmentation;

pub use config::{ModelConfig, PipelineConfig};
pub use error::{PipelineError, StageError};
pub use imaging::{
    Compositor, HttpFetcher, ImageDecoder, OutputImage, PngCompositor, SourceFetcher,
    StandardDecoder,
};
pub use pipeline::{
    BatchSnapshot, JobId, JobReport, JobStatus, ModelProgress, ModelState, Pipeline,
    PipelineEvent, PoolSnapshot, Services, SourceInput, Stage, StageProgress, WorkerId,
    WorkerSnapshot, WorkerState,
};
pub use segmentation::{HubModelLoader, LoadProgress, ModelLoader, OnnxSegmenter, SegmentationModel};
