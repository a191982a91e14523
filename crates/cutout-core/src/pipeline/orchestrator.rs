//! The pipeline orchestrator.
//!
//! A single task owns the batch, the per-stage queues and the three
//! worker pools. It reacts to caller commands and worker events one at a
//! time, never awaits while handling one, and publishes a snapshot after
//! each.
//!
//! Dispatch is pull-based: whenever a worker may have become idle or a
//! job was queued, the stage's queue head goes to the lowest-index idle
//! worker. A stage's concurrency is therefore capped at its pool size,
//! while queues are allowed to grow.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::job::{Batch, Job, JobReport, StageQueues};
use super::pool::{DispatchError, SpawnWorker, WorkerPool};
use super::progress::{BatchSnapshot, ModelProgress, PipelineEvent, PoolSnapshot, WorkerSnapshot};
use super::types::{Artifact, JobId, JobStatus, ModelState, SourceInput, Stage, WorkerId, WorkerState};
use super::workers::{WorkerEvent, WorkerRequest};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::imaging::OutputImage;

/// Requests from the [`Pipeline`](super::Pipeline) handle.
pub(crate) enum Command {
    Submit {
        job_id: JobId,
        source: SourceInput,
    },
    StartBatch,
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Collect {
        job_id: JobId,
        reply: oneshot::Sender<Option<JobReport>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    /// Barrier: answered once every earlier command has been handled
    Sync {
        reply: oneshot::Sender<()>,
    },
    Verify {
        reply: oneshot::Sender<Result<(), PipelineError>>,
    },
}

/// Jobs finished since the batch was last started.
#[derive(Debug, Default)]
struct DrainCounts {
    completed: usize,
    failed: usize,
}

pub(crate) struct Orchestrator {
    batch: Batch,
    queues: StageQueues,
    /// Indexed by [`Stage::index`]
    pools: [WorkerPool; 3],
    spawner: Arc<dyn SpawnWorker>,
    finished: DrainCounts,
    snapshots: watch::Sender<BatchSnapshot>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Orchestrator {
    /// Create the pools, spawning every worker.
    pub fn new(
        config: &PipelineConfig,
        spawner: Arc<dyn SpawnWorker>,
        snapshots: watch::Sender<BatchSnapshot>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        let pools = Stage::ALL.map(|stage| {
            WorkerPool::new(
                stage,
                config.pool_size(stage),
                config.max_respawns,
                spawner.as_ref(),
            )
        });

        Self {
            batch: Batch::default(),
            queues: StageQueues::default(),
            pools,
            spawner,
            finished: DrainCounts::default(),
            snapshots,
            events,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        cancel: CancellationToken,
    ) {
        tracing::info!(
            preprocess_workers = self.pools[0].size(),
            segment_workers = self.pools[1].size(),
            postprocess_workers = self.pools[2].size(),
            "Pipeline started"
        );
        self.publish();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = events.recv() => self.handle_event(event),
                else => break,
            }
            self.publish();
        }

        // Submissions already sent are failed below, not lost
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::StartBatch => {}
                command => self.handle_command(command),
            }
        }

        self.shutdown();
        tracing::info!("Pipeline stopped");
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { job_id, source } => self.submit(job_id, source),
            Command::StartBatch => self.start_batch(),
            Command::Cancel { job_id, reply } => {
                let accepted = self.cancel(job_id);
                self.settle();
                let _ = reply.send(accepted);
            }
            Command::Collect { job_id, reply } => {
                let report = self.collect(job_id);
                self.settle();
                let _ = reply.send(report);
            }
            Command::Clear { reply } => {
                self.clear();
                self.settle();
                let _ = reply.send(());
            }
            Command::Sync { reply } => {
                let _ = reply.send(());
            }
            Command::Verify { reply } => {
                let _ = reply.send(self.verify_invariants());
            }
        }
        self.check_drained();
    }

    pub fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker, generation } => self.on_ready(worker, generation),
            WorkerEvent::Finished {
                worker,
                generation,
                job_id,
                outcome,
            } => self.on_finished(worker, generation, job_id, outcome),
            WorkerEvent::Model {
                worker,
                generation,
                state,
                progress,
            } => self.on_model_state(worker, generation, state, progress),
            WorkerEvent::Exited {
                worker,
                generation,
                panicked,
            } => self.on_worker_exited(worker, generation, panicked),
        }
        self.check_drained();
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub fn submit(&mut self, job_id: JobId, source: SourceInput) {
        let status = JobStatus::Queued {
            stage: Stage::Preprocess,
        };
        self.batch.insert(Job::new(job_id, source));
        self.queues.push(Stage::Preprocess, job_id);
        tracing::debug!(job_id = %job_id, active = self.batch.is_active, "Job submitted");

        self.emit(PipelineEvent::JobStatusChanged { job_id, status });
        self.dispatch(Stage::Preprocess);
    }

    /// Begin dispatching. Idempotent while the batch is active.
    pub fn start_batch(&mut self) {
        if !self.batch.is_active {
            self.batch.is_active = true;
            self.finished = DrainCounts::default();
            tracing::info!(jobs = self.batch.remaining(), "Batch started");
        }
        for stage in Stage::ALL {
            self.dispatch(stage);
        }
    }

    /// Cancel a job.
    ///
    /// A queued job fails with `Cancelled` right away. A job held by a
    /// worker keeps running; its result is discarded when the worker
    /// reports. Returns false for unknown, finished or already cancelled
    /// jobs.
    pub fn cancel(&mut self, job_id: JobId) -> bool {
        let Some(job) = self.batch.get_mut(&job_id) else {
            return false;
        };
        if job.status.is_terminal() || job.cancel_requested {
            return false;
        }

        match job.status.queued_stage() {
            Some(stage) => {
                self.queues.remove(stage, &job_id);
                self.fail_job(job_id, StageError::Cancelled);
            }
            None => {
                job.cancel_requested = true;
                tracing::info!(
                    job_id = %job_id,
                    status = %job.status,
                    "Cancellation requested for in-flight job"
                );
            }
        }
        true
    }

    /// Remove a finished job from the batch and hand back its report.
    pub fn collect(&mut self, job_id: JobId) -> Option<JobReport> {
        if !self.batch.get(&job_id)?.status.is_terminal() {
            return None;
        }
        self.batch.remove(&job_id).map(|job| job.report())
    }

    /// Cancel every unfinished job and drop every finished one.
    ///
    /// Jobs held by a worker are evicted as soon as the worker reports.
    pub fn clear(&mut self) {
        let mut in_flight = 0;
        for job_id in self.batch.ids() {
            let Some(job) = self.batch.get_mut(&job_id) else {
                continue;
            };
            if job.status.is_terminal() {
                self.batch.remove(&job_id);
                continue;
            }

            job.evict_on_finish = true;
            match job.status.queued_stage() {
                Some(stage) => {
                    self.queues.remove(stage, &job_id);
                    self.fail_job(job_id, StageError::Cancelled);
                }
                None => {
                    job.cancel_requested = true;
                    in_flight += 1;
                }
            }
        }
        tracing::info!(in_flight, "Batch cleared");
    }

    // ========================================================================
    // Worker events
    // ========================================================================

    fn on_ready(&mut self, worker: WorkerId, generation: u32) {
        if self.pools[worker.stage.index()].on_ready(worker, generation) {
            tracing::debug!(worker = %worker, generation, "Worker ready");
            self.dispatch(worker.stage);
        }
    }

    fn on_finished(
        &mut self,
        worker: WorkerId,
        generation: u32,
        job_id: JobId,
        outcome: Result<Artifact, StageError>,
    ) {
        let stage = worker.stage;
        if !self.pools[stage.index()].on_worker_finished(worker, generation, job_id) {
            tracing::debug!(worker = %worker, job_id = %job_id, "Ignoring stale worker report");
            return;
        }

        match self.batch.get(&job_id).map(|job| job.cancel_requested) {
            None => tracing::warn!(job_id = %job_id, "Worker reported an unknown job"),
            Some(true) => {
                tracing::warn!(worker = %worker, job_id = %job_id, "Discarding result of cancelled job");
                self.fail_job(job_id, StageError::Cancelled);
            }
            Some(false) => match outcome {
                Ok(artifact) => self.on_stage_result(stage, job_id, artifact),
                Err(error) => self.on_stage_error(job_id, error),
            },
        }

        self.dispatch(stage);
    }

    /// Move the job to the next stage's queue, or complete it.
    fn on_stage_result(&mut self, stage: Stage, job_id: JobId, artifact: Artifact) {
        match (stage.next(), artifact) {
            (Some(next), artifact) => {
                let status = JobStatus::Queued { stage: next };
                let Some(job) = self.batch.get_mut(&job_id) else {
                    return;
                };
                if !job.advance(status) {
                    return;
                }
                job.store_artifact(artifact);
                self.queues.push(next, job_id);
                tracing::debug!(job_id = %job_id, stage = %next, "Job queued");

                self.emit(PipelineEvent::JobStatusChanged { job_id, status });
                self.dispatch(next);
            }
            (None, Artifact::Output(output)) => self.complete_job(job_id, output),
            (None, other) => self.fail_job(
                job_id,
                StageError::Composite(format!("Final stage produced {}", other.kind())),
            ),
        }
    }

    fn on_stage_error(&mut self, job_id: JobId, error: StageError) {
        self.fail_job(job_id, error);
    }

    fn on_model_state(&mut self, worker: WorkerId, generation: u32, state: ModelState, progress: u8) {
        if self.pools[worker.stage.index()].on_model_state(worker, generation, state, progress) {
            self.emit(PipelineEvent::ModelProgress {
                worker,
                state,
                progress,
            });
        }
    }

    fn on_worker_exited(&mut self, worker: WorkerId, generation: u32, panicked: bool) {
        if self.handle_exit(worker, generation, panicked) {
            self.dispatch(worker.stage);
        }
    }

    /// Fail the lost job and respawn or retire the slot. Returns false for
    /// stale exits.
    fn handle_exit(&mut self, worker: WorkerId, generation: u32, panicked: bool) -> bool {
        let stage = worker.stage;
        let Some(outcome) =
            self.pools[stage.index()].on_worker_exited(worker, generation, self.spawner.as_ref())
        else {
            return false;
        };
        tracing::error!(worker = %worker, generation, panicked, "Worker crashed");

        if let Some(job_id) = outcome.lost_job {
            let cancelled = self
                .batch
                .get(&job_id)
                .is_some_and(|job| job.cancel_requested);
            let error = if cancelled {
                StageError::Cancelled
            } else {
                StageError::crashed(format!("Worker {} terminated while processing", worker))
            };
            self.fail_job(job_id, error);
        }

        if let Some(generation) = outcome.respawned {
            tracing::warn!(worker = %worker, generation, "Worker respawned");
            self.emit(PipelineEvent::WorkerRespawned { worker, generation });
        }

        if outcome.gave_up {
            let live = self.pools[stage.index()].live();
            tracing::error!(stage = %stage, live, "Worker pool degraded");
            self.emit(PipelineEvent::PoolDegraded { stage, live });
        }
        true
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Hand queued jobs to idle workers of `stage` until one runs out.
    fn dispatch(&mut self, stage: Stage) {
        loop {
            let pool = &self.pools[stage.index()];
            if pool.live() == 0 {
                self.fail_stranded(stage);
                return;
            }
            if !self.batch.is_active || !pool.has_idle() {
                return;
            }
            let Some(job_id) = self.queues.pop(stage) else {
                return;
            };

            let Some(input) = self.batch.get_mut(&job_id).and_then(Job::take_artifact) else {
                tracing::error!(job_id = %job_id, stage = %stage, "Queued job has no input");
                self.fail_job(job_id, StageError::crashed("Job input was lost"));
                continue;
            };

            match self.pools[stage.index()].dispatch(WorkerRequest { job_id, input }) {
                Ok(worker) => {
                    let status = stage.active_status();
                    if let Some(job) = self.batch.get_mut(&job_id) {
                        job.advance(status);
                    }
                    tracing::debug!(job_id = %job_id, worker = %worker, "Job dispatched");
                    self.emit(PipelineEvent::JobStatusChanged { job_id, status });
                }
                Err(DispatchError::NoIdleWorker(request)) => {
                    self.requeue(stage, request);
                    return;
                }
                Err(DispatchError::Disconnected { worker, request }) => {
                    self.requeue(stage, request);
                    let generation = self.pools[stage.index()].slots()[worker.index].generation;
                    tracing::warn!(worker = %worker, "Worker inbox closed");
                    self.handle_exit(worker, generation, false);
                }
            }
        }
    }

    /// Put an undelivered request back at the head of its queue.
    fn requeue(&mut self, stage: Stage, request: WorkerRequest) {
        if let Some(job) = self.batch.get_mut(&request.job_id) {
            job.store_artifact(request.input);
        }
        self.queues.push_front(stage, request.job_id);
    }

    /// Fail everything queued for a stage that has no live workers left.
    fn fail_stranded(&mut self, stage: Stage) {
        for job_id in self.queues.drain(stage) {
            self.fail_job(
                job_id,
                StageError::crashed(format!("No live {} workers", stage)),
            );
        }
    }

    // ========================================================================
    // Terminal transitions
    // ========================================================================

    fn complete_job(&mut self, job_id: JobId, output: OutputImage) {
        let (width, height) = (output.width, output.height);
        let Some(job) = self.batch.get_mut(&job_id) else {
            return;
        };
        if !job.complete(output) {
            return;
        }
        let evict = job.evict_on_finish;

        tracing::info!(job_id = %job_id, width, height, "Job completed");
        self.finished.completed += 1;
        self.emit(PipelineEvent::JobCompleted {
            job_id,
            width,
            height,
        });
        if evict {
            self.batch.remove(&job_id);
        }
    }

    fn fail_job(&mut self, job_id: JobId, error: StageError) {
        let Some(job) = self.batch.get_mut(&job_id) else {
            return;
        };
        if !job.fail(error.clone()) {
            return;
        }
        let evict = job.evict_on_finish;

        match &error {
            StageError::Cancelled => tracing::warn!(job_id = %job_id, "Job cancelled"),
            e => tracing::error!(job_id = %job_id, error = %e, "Job failed"),
        }
        self.finished.failed += 1;
        self.emit(PipelineEvent::JobFailed { job_id, error });
        if evict {
            self.batch.remove(&job_id);
        }
    }

    /// Deactivate the batch once every job in it has finished.
    fn check_drained(&mut self) {
        let finished = self.finished.completed + self.finished.failed;
        if !self.batch.is_active || finished == 0 || self.batch.remaining() > 0 {
            return;
        }

        self.batch.is_active = false;
        let DrainCounts { completed, failed } = std::mem::take(&mut self.finished);
        tracing::info!(completed, failed, "Batch drained");
        self.emit(PipelineEvent::BatchDrained { completed, failed });
    }

    // ========================================================================
    // Observation
    // ========================================================================

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn settle(&mut self) {
        self.check_drained();
        self.publish();
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let mut snapshot = BatchSnapshot {
            is_active: self.batch.is_active,
            total: self.batch.len(),
            remaining: self.batch.remaining(),
            ..Default::default()
        };

        for job in self.batch.iter() {
            match job.status {
                JobStatus::Completed => snapshot.completed += 1,
                JobStatus::Failed => snapshot.failed += 1,
                JobStatus::Queued { stage } => snapshot.stage_mut(stage).queued += 1,
                status => {
                    if let Some(stage) = status.active_stage() {
                        snapshot.stage_mut(stage).active += 1;
                    }
                }
            }
        }

        for pool in &self.pools {
            snapshot.pools.push(PoolSnapshot {
                stage: pool.stage(),
                size: pool.size(),
                live: pool.live(),
                busy: pool.busy(),
                degraded: pool.is_degraded(),
            });
            snapshot
                .workers
                .extend(pool.slots().iter().map(|slot| WorkerSnapshot {
                    worker: slot.id,
                    state: slot.state,
                    job_id: slot.current_job,
                    model: slot
                        .model
                        .map(|(state, progress)| ModelProgress { state, progress }),
                }));
        }

        snapshot
    }

    /// Publish the current snapshot if it changed.
    pub fn publish(&self) {
        if cfg!(debug_assertions) {
            if let Err(e) = self.verify_invariants() {
                tracing::error!(error = %e, "Pipeline invariant violated");
            }
        }
        self.send_snapshot();
    }

    fn send_snapshot(&self) {
        let snapshot = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    /// Check the slot/job bookkeeping:
    ///
    /// - a busy slot holds exactly one job, whose status is its stage's
    ///   active status, and no job is held by two slots
    /// - every active job is held by a slot of its stage
    /// - every queued job sits in its stage's queue with its input
    /// - no stage has more active jobs than workers
    pub fn verify_invariants(&self) -> Result<(), PipelineError> {
        let violation = |message: String| -> Result<(), PipelineError> {
            Err(PipelineError::InvariantViolated(message))
        };

        let mut held = HashSet::new();
        for pool in &self.pools {
            for slot in pool.slots() {
                match (slot.state, slot.current_job) {
                    (WorkerState::Busy, Some(job_id)) => {
                        if !held.insert(job_id) {
                            return violation(format!("Job {} is held by two workers", job_id));
                        }
                        let Some(job) = self.batch.get(&job_id) else {
                            return violation(format!("{} holds unknown job {}", slot.id, job_id));
                        };
                        if job.status.active_stage() != Some(pool.stage()) {
                            return violation(format!(
                                "{} holds job {} in status {}",
                                slot.id, job_id, job.status
                            ));
                        }
                    }
                    (WorkerState::Busy, None) => {
                        return violation(format!("{} is busy without a job", slot.id));
                    }
                    (state, Some(job_id)) => {
                        return violation(format!(
                            "{} is {:?} but holds job {}",
                            slot.id, state, job_id
                        ));
                    }
                    (_, None) => {}
                }
            }
        }

        let mut active = [0usize; 3];
        for job in self.batch.iter() {
            if let Some(stage) = job.status.active_stage() {
                active[stage.index()] += 1;
                if !held.contains(&job.id) {
                    return violation(format!(
                        "Job {} is {} but no worker holds it",
                        job.id, job.status
                    ));
                }
            }
            if let Some(stage) = job.status.queued_stage() {
                if !self.queues.contains(stage, &job.id) || !job.has_artifact() {
                    return violation(format!(
                        "Job {} is {} but not waiting in that queue",
                        job.id, job.status
                    ));
                }
            }
        }

        for stage in Stage::ALL {
            let size = self.pools[stage.index()].size();
            if active[stage.index()] > size {
                return violation(format!(
                    "{} active {} jobs exceed pool size {}",
                    active[stage.index()],
                    stage,
                    size
                ));
            }
        }

        Ok(())
    }

    /// Close worker inboxes and fail whatever has not finished.
    fn shutdown(&mut self) {
        for pool in &mut self.pools {
            pool.shutdown();
        }

        let pending: Vec<JobId> = self
            .batch
            .iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.id)
            .collect();
        for job_id in pending {
            for stage in Stage::ALL {
                self.queues.remove(stage, &job_id);
            }
            self.fail_job(job_id, StageError::Cancelled);
        }

        self.batch.is_active = false;
        // Busy slots still point at the failed jobs, so skip verification
        self.send_snapshot();
    }
}
