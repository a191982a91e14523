//! Job records, the batch that holds them, and the per-stage queues.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{Artifact, JobId, JobStatus, SourceInput, Stage};
use crate::error::StageError;
use crate::imaging::OutputImage;

/// The unit of work: one source image moving through the stages.
#[derive(Debug)]
pub(crate) struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub source: SourceInput,
    /// Current stage's input; `None` while a worker owns it
    artifact: Option<Artifact>,
    pub result: Option<OutputImage>,
    pub error: Option<StageError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Cancelled while held by a worker; the result is dropped on delivery
    pub cancel_requested: bool,
    /// Remove from the batch as soon as the job is terminal
    pub evict_on_finish: bool,
}

impl Job {
    pub fn new(id: JobId, source: SourceInput) -> Self {
        Self {
            id,
            status: JobStatus::Queued {
                stage: Stage::Preprocess,
            },
            artifact: Some(Artifact::Source(source.clone())),
            source,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            cancel_requested: false,
            evict_on_finish: false,
        }
    }

    /// Move to `next` if the transition is legal.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::error!(
                job_id = %self.id,
                from = %self.status,
                to = %next,
                "Rejected illegal job transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn take_artifact(&mut self) -> Option<Artifact> {
        self.artifact.take()
    }

    /// Store the next stage's input, releasing the previous artifact.
    pub fn store_artifact(&mut self, artifact: Artifact) {
        self.artifact = Some(artifact);
    }

    pub fn has_artifact(&self) -> bool {
        self.artifact.is_some()
    }

    pub fn complete(&mut self, output: OutputImage) -> bool {
        if !self.advance(JobStatus::Completed) {
            return false;
        }
        self.artifact = None;
        self.result = Some(output);
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self, error: StageError) -> bool {
        if !self.advance(JobStatus::Failed) {
            return false;
        }
        self.artifact = None;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            id: self.id,
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// What the caller gets back for a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub status: JobStatus,
    /// Set only when `Completed`
    pub result: Option<OutputImage>,
    /// Set only when `Failed`
    pub error: Option<StageError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Jobs in submission order.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
    pub is_active: bool,
}

impl Batch {
    pub fn insert(&mut self, job: Job) {
        self.order.push(job.id);
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn remove(&mut self, id: &JobId) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.order.retain(|j| j != id);
        Some(job)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    /// Jobs in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn remaining(&self) -> usize {
        self.jobs.values().filter(|j| !j.status.is_terminal()).count()
    }
}

/// FIFO queue per stage.
#[derive(Debug, Default)]
pub(crate) struct StageQueues {
    queues: [VecDeque<JobId>; 3],
}

impl StageQueues {
    pub fn push(&mut self, stage: Stage, id: JobId) {
        self.queues[stage.index()].push_back(id);
    }

    /// Put a job back at the head, keeping its place in line.
    pub fn push_front(&mut self, stage: Stage, id: JobId) {
        self.queues[stage.index()].push_front(id);
    }

    pub fn pop(&mut self, stage: Stage) -> Option<JobId> {
        self.queues[stage.index()].pop_front()
    }

    pub fn remove(&mut self, stage: Stage, id: &JobId) -> bool {
        let queue = &mut self.queues[stage.index()];
        match queue.iter().position(|j| j == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn drain(&mut self, stage: Stage) -> Vec<JobId> {
        self.queues[stage.index()].drain(..).collect()
    }

    pub fn contains(&self, stage: Stage, id: &JobId) -> bool {
        self.queues[stage.index()].contains(id)
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.queues[stage.index()].len()
    }

    pub fn is_empty(&self, stage: Stage) -> bool {
        self.queues[stage.index()].is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobId::new(), SourceInput::from(vec![1, 2, 3]))
    }

    #[test]
    fn test_new_job_is_queued_for_preprocess() {
        let job = job();
        assert_eq!(
            job.status,
            JobStatus::Queued {
                stage: Stage::Preprocess
            }
        );
        assert!(job.has_artifact());
        assert!(job.result.is_none() && job.error.is_none());
    }

    #[test]
    fn test_fail_releases_artifact_and_is_final() {
        let mut job = job();
        assert!(job.fail(StageError::Cancelled));
        assert!(!job.has_artifact());
        assert!(job.completed_at.is_some());

        // Terminal: no further transitions
        assert!(!job.fail(StageError::Decode("late".into())));
        assert_eq!(job.error, Some(StageError::Cancelled));
        assert!(!job.advance(JobStatus::Preprocessing));
    }

    #[test]
    fn test_complete_requires_postprocessing() {
        let mut job = job();
        let output = OutputImage {
            width: 1,
            height: 1,
            bytes: Default::default(),
        };
        assert!(!job.complete(output));
        assert_eq!(
            job.status,
            JobStatus::Queued {
                stage: Stage::Preprocess
            }
        );
    }

    #[test]
    fn test_batch_keeps_submission_order() {
        let mut batch = Batch::default();
        let jobs: Vec<Job> = (0..4).map(|_| job()).collect();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        for j in jobs {
            batch.insert(j);
        }

        assert_eq!(batch.ids(), ids);
        batch.remove(&ids[1]);
        assert_eq!(batch.ids(), vec![ids[0], ids[2], ids[3]]);
        assert_eq!(batch.remaining(), 3);

        batch.get_mut(&ids[0]).unwrap().fail(StageError::Cancelled);
        assert_eq!(batch.remaining(), 2);
    }

    #[test]
    fn test_queues_are_fifo_per_stage() {
        let mut queues = StageQueues::default();
        let a = JobId::new();
        let b = JobId::new();
        let c = JobId::new();

        queues.push(Stage::Segment, a);
        queues.push(Stage::Segment, b);
        queues.push(Stage::Preprocess, c);

        assert_eq!(queues.pop(Stage::Segment), Some(a));
        queues.push_front(Stage::Segment, a);
        assert_eq!(queues.pop(Stage::Segment), Some(a));
        assert_eq!(queues.pop(Stage::Segment), Some(b));
        assert_eq!(queues.pop(Stage::Segment), None);
        assert_eq!(queues.len(Stage::Preprocess), 1);
    }

    #[test]
    fn test_queue_remove() {
        let mut queues = StageQueues::default();
        let a = JobId::new();
        let b = JobId::new();
        queues.push(Stage::Postprocess, a);
        queues.push(Stage::Postprocess, b);

        assert!(queues.remove(Stage::Postprocess, &a));
        assert!(!queues.remove(Stage::Postprocess, &a));
        assert!(!queues.contains(Stage::Postprocess, &a));
        assert_eq!(queues.drain(Stage::Postprocess), vec![b]);
        assert!(queues.is_empty(Stage::Postprocess));
    }
}
