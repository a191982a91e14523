//! Error types for the background-removal pipeline.
//!
//! Stage errors serialize as `{"kind": "...", "message": "..."}` so an
//! observer can render the failure kind without parsing strings.

use serde::{Deserialize, Serialize};

/// Failure attached to exactly one job.
///
/// Each variant is one kind from the pipeline's error taxonomy. A stage
/// error never affects sibling jobs or the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StageError {
    /// Bad, unreadable or unsupported input.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The segmentation model failed to download or initialize.
    #[error("model load failed: {0}")]
    Load(String),
    /// The model ran but failed on this input.
    #[error("inference failed: {0}")]
    Inference(String),
    /// Segment output incompatible with the preprocessed image.
    #[error("composite failed: {0}")]
    Composite(String),
    /// The worker's execution context terminated unexpectedly.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
    /// Caller requested cancellation.
    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    pub fn decode(err: anyhow::Error) -> Self {
        Self::Decode(format!("{:#}", err))
    }

    pub fn inference(err: anyhow::Error) -> Self {
        Self::Inference(format!("{:#}", err))
    }

    pub fn composite(err: anyhow::Error) -> Self {
        Self::Composite(format!("{:#}", err))
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::WorkerCrashed(message.into())
    }
}

/// Errors returned by the pipeline's caller-facing API.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The pipeline has been shut down and accepts no more work.
    #[error("pipeline is closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal bookkeeping disagrees with itself.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}
