//! Pipeline types: stages, identities and the job/worker state machines.

use std::fmt;

use bytes::Bytes;
use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::imaging::OutputImage;

/// Processing stage in the pipeline. Also the role of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preprocess,
    Segment,
    Postprocess,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Preprocess, Stage::Segment, Stage::Postprocess];

    pub(crate) fn index(self) -> usize {
        match self {
            Stage::Preprocess => 0,
            Stage::Segment => 1,
            Stage::Postprocess => 2,
        }
    }

    /// The stage a job moves to after this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Preprocess => Some(Stage::Segment),
            Stage::Segment => Some(Stage::Postprocess),
            Stage::Postprocess => None,
        }
    }

    /// Job status while a worker of this stage holds the job.
    pub fn active_status(self) -> JobStatus {
        match self {
            Stage::Preprocess => JobStatus::Preprocessing,
            Stage::Segment => JobStatus::Segmenting,
            Stage::Postprocess => JobStatus::Postprocessing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Preprocess => write!(f, "preprocess"),
            Stage::Segment => write!(f, "segment"),
            Stage::Postprocess => write!(f, "postprocess"),
        }
    }
}

/// Opaque job identifier, assigned at submission and stable for the
/// job's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job status.
///
/// `Queued` records which stage's queue holds the job, so a job waiting
/// between stages is never counted as active in either of them. Every
/// transition moves strictly forward:
///
/// ```text
/// Queued(preprocess) → Preprocessing → Queued(segment) → Segmenting
///     → Queued(postprocess) → Postprocessing → Completed
/// any non-terminal status → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum JobStatus {
    Queued { stage: Stage },
    Preprocessing,
    Segmenting,
    Postprocessing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Stage whose worker currently holds the job.
    pub fn active_stage(self) -> Option<Stage> {
        match self {
            JobStatus::Preprocessing => Some(Stage::Preprocess),
            JobStatus::Segmenting => Some(Stage::Segment),
            JobStatus::Postprocessing => Some(Stage::Postprocess),
            _ => None,
        }
    }

    /// Stage whose queue holds the job.
    pub fn queued_stage(self) -> Option<Stage> {
        match self {
            JobStatus::Queued { stage } => Some(stage),
            _ => None,
        }
    }

    /// The single non-failure successor of this status.
    fn successor(self) -> Option<JobStatus> {
        match self {
            JobStatus::Queued { stage } => Some(stage.active_status()),
            JobStatus::Preprocessing => Some(JobStatus::Queued {
                stage: Stage::Segment,
            }),
            JobStatus::Segmenting => Some(JobStatus::Queued {
                stage: Stage::Postprocess,
            }),
            JobStatus::Postprocessing => Some(JobStatus::Completed),
            JobStatus::Completed | JobStatus::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match next {
            JobStatus::Failed => !self.is_terminal(),
            _ => self.successor() == Some(next),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued { stage } => write!(f, "queued({})", stage),
            JobStatus::Preprocessing => write!(f, "preprocessing"),
            JobStatus::Segmenting => write!(f, "segmenting"),
            JobStatus::Postprocessing => write!(f, "postprocessing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A slot in a stage's worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    pub stage: Stage,
    pub index: usize,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stage, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Worker spawned, role-specific setup not finished yet
    Initializing,
    Idle,
    Busy,
    /// Execution context terminated; slot awaiting respawn or given up
    Crashed,
}

/// Lifecycle of the model owned by a segment worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    NotLoaded,
    Loading,
    Ready,
    LoadFailed,
}

/// Source image supplied by the caller.
///
/// Bytes are reference-counted, so the pipeline holds a handle to the
/// caller's buffer without copying or mutating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceInput {
    Bytes(Bytes),
    Url(String),
}

impl SourceInput {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }
}

impl From<Bytes> for SourceInput {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for SourceInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

/// Intermediate data handed from one stage to the next.
///
/// Ownership moves into the worker on dispatch and back with the result,
/// so at most one artifact is live per job.
#[derive(Debug)]
pub(crate) enum Artifact {
    /// Input to preprocess
    Source(SourceInput),
    /// Normalized raster, input to segment
    Raster(RgbaImage),
    /// Raster plus its mask, input to postprocess
    Segmented { raster: RgbaImage, mask: GrayImage },
    /// Final output
    Output(OutputImage),
}

impl Artifact {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Artifact::Source(_) => "source",
            Artifact::Raster(_) => "raster",
            Artifact::Segmented { .. } => "segmented",
            Artifact::Output(_) => "output",
        }
    }
}
