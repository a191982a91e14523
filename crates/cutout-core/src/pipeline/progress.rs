//! Progress reporting: batch snapshots, pipeline events and throttling.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::types::{JobId, JobStatus, ModelState, Stage, WorkerId, WorkerState};
use crate::error::StageError;

/// Rate limiter for model-load progress.
///
/// Emits at most one update per interval, never goes backwards, and
/// always lets the terminal 100% through exactly once.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_value: Option<u8>,
    finished: bool,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_value: None,
            finished: false,
        }
    }

    /// Offer a percentage; returns the value to emit, if any.
    pub fn offer(&mut self, percent: u8, now: Instant) -> Option<u8> {
        if self.finished {
            return None;
        }
        let value = percent.min(100).max(self.last_value.unwrap_or(0));

        if value == 100 {
            self.finished = true;
        } else {
            if self.last_value == Some(value) {
                return None;
            }
            if let Some(last) = self.last_emit {
                if now.saturating_duration_since(last) < self.interval {
                    return None;
                }
            }
        }

        self.last_emit = Some(now);
        self.last_value = Some(value);
        Some(value)
    }

    /// Last emitted value (0 before the first emission).
    pub fn last(&self) -> u8 {
        self.last_value.unwrap_or(0)
    }
}

/// Counts for a single stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Jobs waiting in the stage's queue
    pub queued: usize,
    /// Jobs held by a worker of the stage
    pub active: usize,
}

/// Model state of a segment worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProgress {
    pub state: ModelState,
    /// Load progress, 0-100
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker: WorkerId,
    pub state: WorkerState,
    pub job_id: Option<JobId>,
    /// Only present for segment workers
    pub model: Option<ModelProgress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub stage: Stage,
    pub size: usize,
    /// Workers not in `Crashed`
    pub live: usize,
    pub busy: usize,
    /// At least one slot crashed and could not be respawned
    pub degraded: bool,
}

/// Read-only aggregate of the batch for observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub is_active: bool,
    /// Jobs currently held in the batch
    pub total: usize,
    /// Jobs not yet completed or failed
    pub remaining: usize,
    pub completed: usize,
    pub failed: usize,
    pub preprocess: StageProgress,
    pub segment: StageProgress,
    pub postprocess: StageProgress,
    pub pools: Vec<PoolSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
}

impl BatchSnapshot {
    pub fn stage(&self, stage: Stage) -> &StageProgress {
        match stage {
            Stage::Preprocess => &self.preprocess,
            Stage::Segment => &self.segment,
            Stage::Postprocess => &self.postprocess,
        }
    }

    pub(crate) fn stage_mut(&mut self, stage: Stage) -> &mut StageProgress {
        match stage {
            Stage::Preprocess => &mut self.preprocess,
            Stage::Segment => &mut self.segment,
            Stage::Postprocess => &mut self.postprocess,
        }
    }

    /// Every job in the batch has reached a terminal status.
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }

    /// Segment workers currently loading their model, with progress.
    pub fn loading_models(&self) -> Vec<(WorkerId, u8)> {
        self.workers
            .iter()
            .filter_map(|w| match w.model {
                Some(ModelProgress {
                    state: ModelState::Loading,
                    progress,
                }) => Some((w.worker, progress)),
                _ => None,
            })
            .collect()
    }

    /// Overall model download progress across loading workers (for a
    /// single progress bar). `None` when nothing is loading.
    pub fn model_download_progress(&self) -> Option<u8> {
        let loading = self.loading_models();
        if loading.is_empty() {
            return None;
        }
        let sum: usize = loading.iter().map(|(_, p)| *p as usize).sum();
        Some((sum / loading.len()) as u8)
    }
}

/// Discrete events for observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobStatusChanged {
        job_id: JobId,
        status: JobStatus,
    },
    JobCompleted {
        job_id: JobId,
        width: u32,
        height: u32,
    },
    JobFailed {
        job_id: JobId,
        error: StageError,
    },
    ModelProgress {
        worker: WorkerId,
        state: ModelState,
        progress: u8,
    },
    WorkerRespawned {
        worker: WorkerId,
        generation: u32,
    },
    /// A pool lost a worker for good
    PoolDegraded {
        stage: Stage,
        live: usize,
    },
    BatchDrained {
        completed: usize,
        failed: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_throttle_first_update_passes() {
        let mut throttle = ProgressThrottle::new(ms(100));
        assert_eq!(throttle.offer(0, Instant::now()), Some(0));
    }

    #[test]
    fn test_throttle_suppresses_within_interval() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(ms(100));

        assert_eq!(throttle.offer(10, start), Some(10));
        assert_eq!(throttle.offer(20, start + ms(10)), None);
        assert_eq!(throttle.offer(30, start + ms(99)), None);
        assert_eq!(throttle.offer(40, start + ms(100)), Some(40));
        assert_eq!(throttle.last(), 40);
    }

    #[test]
    fn test_throttle_never_goes_backwards() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(ms(10));

        assert_eq!(throttle.offer(50, start), Some(50));
        // Lower values are clamped up to the last emitted value and dropped
        assert_eq!(throttle.offer(20, start + ms(50)), None);
        assert_eq!(throttle.offer(60, start + ms(100)), Some(60));
    }

    #[test]
    fn test_throttle_always_emits_terminal_once() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(ms(1000));

        assert_eq!(throttle.offer(10, start), Some(10));
        assert_eq!(throttle.offer(100, start + ms(1)), Some(100));
        assert_eq!(throttle.offer(100, start + ms(5000)), None);
        assert_eq!(throttle.offer(120, start + ms(6000)), None);
    }

    #[test]
    fn test_snapshot_model_progress() {
        let worker = |index| WorkerId {
            stage: Stage::Segment,
            index,
        };
        let snapshot = BatchSnapshot {
            workers: vec![
                WorkerSnapshot {
                    worker: worker(0),
                    state: WorkerState::Busy,
                    job_id: None,
                    model: Some(ModelProgress {
                        state: ModelState::Loading,
                        progress: 20,
                    }),
                },
                WorkerSnapshot {
                    worker: worker(1),
                    state: WorkerState::Busy,
                    job_id: None,
                    model: Some(ModelProgress {
                        state: ModelState::Loading,
                        progress: 60,
                    }),
                },
                WorkerSnapshot {
                    worker: worker(2),
                    state: WorkerState::Idle,
                    job_id: None,
                    model: Some(ModelProgress {
                        state: ModelState::Ready,
                        progress: 100,
                    }),
                },
            ],
            ..Default::default()
        };

        assert_eq!(snapshot.loading_models().len(), 2);
        assert_eq!(snapshot.model_download_progress(), Some(40));
        assert_eq!(BatchSnapshot::default().model_download_progress(), None);
    }
}
