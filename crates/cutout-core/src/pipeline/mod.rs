//! Background-removal pipeline.
//!
//! # Architecture
//!
//! Jobs move through three stages, each served by a fixed pool of worker
//! tasks. A single orchestrator task owns every job, queue and worker
//! slot; workers only ever see the artifact they are working on.
//!
//! ```text
//!   submit()                                   status() / snapshots()
//!      │                                              ▲
//!      ▼                                              │
//! ┌──────────────────────── ORCHESTRATOR ─────────────┴──────────┐
//! │  queue(preprocess)     queue(segment)     queue(postprocess) │
//! └─────┬──────▲──────────────┬──────▲──────────────┬──────▲─────┘
//!       │      │              │      │              │      │
//!       ▼      │ raster       ▼      │ mask         ▼      │ png
//!  Preprocess(2)          Segment(4)          Postprocess(2)
//!  fetch + decode         model + infer       composite + encode
//! ```
//!
//! Dispatch only hands a job to an idle worker, so each stage runs at
//! most its pool size of jobs at once. A failure is attached to its job
//! and never touches siblings. Crashed workers are respawned a bounded
//! number of times.

mod job;
mod model;
mod orchestrator;
mod pool;
mod progress;
mod types;
mod workers;

pub use job::JobReport;
pub use progress::{
    BatchSnapshot, ModelProgress, PipelineEvent, PoolSnapshot, StageProgress, WorkerSnapshot,
};
pub use types::{JobId, JobStatus, ModelState, SourceInput, Stage, WorkerId, WorkerState};
pub use workers::Services;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::PipelineError;

use orchestrator::{Command, Orchestrator};
use workers::WorkerSpawner;

/// Capacity of the event broadcast; slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 1024;

/// Handle to a running pipeline.
///
/// Dropping the handle stops the orchestrator and its workers.
pub struct Pipeline {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<BatchSnapshot>,
    events: broadcast::Sender<PipelineEvent>,
    closed: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Validate `config`, spawn every worker pool and the orchestrator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: PipelineConfig, services: Services) -> Result<Self, PipelineError> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(BatchSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let spawner = Arc::new(WorkerSpawner::new(services, event_tx, &config));
        let orchestrator = Orchestrator::new(&config, spawner, snapshot_tx, events.clone());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(orchestrator.run(command_rx, event_rx, cancel.clone()));

        Ok(Self {
            commands: command_tx,
            snapshots,
            events,
            closed: AtomicBool::new(false),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    fn send(&self, command: Command) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Closed);
        }
        self.commands.send(command).map_err(|_| PipelineError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| PipelineError::Closed)
    }

    /// Queue a source image. Never blocks.
    ///
    /// The job is dispatched right away if the batch is active, otherwise
    /// on the next [`start_batch`](Self::start_batch).
    pub fn submit(&self, source: impl Into<SourceInput>) -> Result<JobId, PipelineError> {
        let job_id = JobId::new();
        self.send(Command::Submit {
            job_id,
            source: source.into(),
        })?;
        Ok(job_id)
    }

    /// Begin draining the batch. Idempotent while active.
    pub fn start_batch(&self) -> Result<(), PipelineError> {
        self.send(Command::StartBatch)
    }

    /// Cancel a job.
    ///
    /// A queued job fails with `Cancelled` at once. A job already held by
    /// a worker fails with `Cancelled` when the worker reports; its result
    /// is dropped. Returns false if the job is unknown, finished or
    /// already cancelled.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, PipelineError> {
        self.request(|reply| Command::Cancel { job_id, reply }).await
    }

    /// Latest published snapshot.
    pub fn status(&self) -> BatchSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Watch channel receiving every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<BatchSnapshot> {
        self.snapshots.clone()
    }

    /// Snapshots as a stream, starting with the current one.
    pub fn snapshots(&self) -> WatchStream<BatchSnapshot> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Discrete pipeline events from now on.
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Remove a finished job and return its report.
    ///
    /// Returns `None` for unknown or unfinished jobs.
    pub async fn collect(&self, job_id: JobId) -> Result<Option<JobReport>, PipelineError> {
        self.request(|reply| Command::Collect { job_id, reply }).await
    }

    /// Cancel every unfinished job and drop every finished one.
    pub async fn clear(&self) -> Result<(), PipelineError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    /// Wait until no job in the batch is left unfinished.
    ///
    /// Sees every submission made before the call.
    pub async fn drained(&self) -> Result<BatchSnapshot, PipelineError> {
        self.request(|reply| Command::Sync { reply }).await?;

        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| s.remaining == 0)
            .await
            .map_err(|_| PipelineError::Closed)?
            .clone();
        Ok(snapshot)
    }

    /// Check the orchestrator's job/slot bookkeeping.
    pub async fn verify_invariants(&self) -> Result<(), PipelineError> {
        self.request(|reply| Command::Verify { reply }).await?
    }

    /// Stop accepting work, fail unfinished jobs as cancelled and stop
    /// every worker.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Orchestrator task failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
