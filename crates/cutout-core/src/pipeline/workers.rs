//! Stage workers.
//!
//! Each worker is a tokio task with its own single-slot inbox. It
//! processes one request at a time and reports back to the orchestrator
//! over a shared event channel. CPU-bound work runs on the blocking pool;
//! a panic there is re-raised in the worker task so the task dies and the
//! monitor reports the slot as crashed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::model::{ModelLifecycle, ModelReporter};
use super::pool::SpawnWorker;
use super::types::{Artifact, JobId, ModelState, SourceInput, Stage, WorkerId};
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::imaging::{
    Compositor, HttpFetcher, ImageDecoder, PngCompositor, SourceFetcher, StandardDecoder,
};
use crate::segmentation::{HubModelLoader, ModelLoader};

/// External collaborators used by the stage workers.
#[derive(Clone)]
pub struct Services {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub loader: Arc<dyn ModelLoader>,
    pub compositor: Arc<dyn Compositor>,
}

impl Services {
    /// reqwest fetcher, `image` decoder, HuggingFace ONNX model and PNG
    /// compositor, configured from `config`.
    pub fn defaults(config: &PipelineConfig) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new(config.fetch_timeout())?),
            decoder: Arc::new(StandardDecoder::new(config.max_dimension)),
            loader: Arc::new(HubModelLoader::new(config.model.clone())),
            compositor: Arc::new(PngCompositor),
        })
    }
}

/// One job handed to a worker. The artifact moves into the worker.
#[derive(Debug)]
pub(crate) struct WorkerRequest {
    pub job_id: JobId,
    pub input: Artifact,
}

/// Messages from workers (and their monitors) to the orchestrator.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Setup finished; the worker accepts requests
    Ready { worker: WorkerId, generation: u32 },
    Finished {
        worker: WorkerId,
        generation: u32,
        job_id: JobId,
        outcome: Result<Artifact, StageError>,
    },
    Model {
        worker: WorkerId,
        generation: u32,
        state: ModelState,
        progress: u8,
    },
    /// The worker task ended
    Exited {
        worker: WorkerId,
        generation: u32,
        panicked: bool,
    },
}

/// Spawns real worker tasks.
pub(crate) struct WorkerSpawner {
    services: Services,
    events: mpsc::UnboundedSender<WorkerEvent>,
    progress_interval: Duration,
    preload_model: bool,
}

impl WorkerSpawner {
    pub fn new(
        services: Services,
        events: mpsc::UnboundedSender<WorkerEvent>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            services,
            events,
            progress_interval: config.progress_interval(),
            preload_model: config.preload_model,
        }
    }

    fn processor(&self, worker: WorkerId, generation: u32) -> StageProcessor {
        match worker.stage {
            Stage::Preprocess => StageProcessor::Preprocess {
                fetcher: self.services.fetcher.clone(),
                decoder: self.services.decoder.clone(),
            },
            Stage::Segment => {
                let events = self.events.clone();
                let reporter: ModelReporter = Arc::new(move |state: ModelState, progress: u8| {
                    let _ = events.send(WorkerEvent::Model {
                        worker,
                        generation,
                        state,
                        progress,
                    });
                });
                StageProcessor::Segment {
                    model: ModelLifecycle::new(
                        self.services.loader.clone(),
                        reporter,
                        self.progress_interval,
                    ),
                    preload: self.preload_model,
                }
            }
            Stage::Postprocess => StageProcessor::Postprocess {
                compositor: self.services.compositor.clone(),
            },
        }
    }
}

impl SpawnWorker for WorkerSpawner {
    fn spawn(&self, worker: WorkerId, generation: u32) -> mpsc::Sender<WorkerRequest> {
        let (tx, rx) = mpsc::channel(1);
        let processor = self.processor(worker, generation);
        let handle = tokio::spawn(run_worker(
            worker,
            generation,
            processor,
            rx,
            self.events.clone(),
        ));

        // Monitor: report the task's end, however it happened
        let events = self.events.clone();
        tokio::spawn(async move {
            let panicked = match handle.await {
                Ok(()) => false,
                Err(e) if e.is_panic() => {
                    tracing::error!(worker = %worker, generation, "Worker panicked");
                    true
                }
                Err(_) => false,
            };
            let _ = events.send(WorkerEvent::Exited {
                worker,
                generation,
                panicked,
            });
        });

        tx
    }
}

/// Role-specific processing for one stage.
enum StageProcessor {
    Preprocess {
        fetcher: Arc<dyn SourceFetcher>,
        decoder: Arc<dyn ImageDecoder>,
    },
    Segment {
        model: ModelLifecycle,
        preload: bool,
    },
    Postprocess {
        compositor: Arc<dyn Compositor>,
    },
}

impl StageProcessor {
    /// Setup before the worker reports ready.
    async fn prepare(&self, worker: WorkerId) {
        if let StageProcessor::Segment {
            model,
            preload: true,
        } = self
        {
            // A failed preload is retried by the first job
            if let Err(e) = model.ensure_loaded().await {
                tracing::warn!(worker = %worker, error = %e, "Model preload failed");
            }
        }
    }

    async fn process(&self, input: Artifact) -> Result<Artifact, StageError> {
        match self {
            StageProcessor::Preprocess { fetcher, decoder } => {
                let bytes = match input {
                    Artifact::Source(SourceInput::Bytes(bytes)) => bytes,
                    Artifact::Source(SourceInput::Url(url)) => {
                        fetcher.fetch(&url).await.map_err(StageError::decode)?
                    }
                    other => {
                        return Err(StageError::Decode(format!(
                            "Expected source input, got {}",
                            other.kind()
                        )))
                    }
                };

                let decoder = decoder.clone();
                let raster = run_blocking(move || decoder.decode(&bytes))
                    .await?
                    .map_err(StageError::decode)?;
                Ok(Artifact::Raster(raster))
            }
            StageProcessor::Segment { model, .. } => {
                let raster = match input {
                    Artifact::Raster(raster) => raster,
                    other => {
                        return Err(StageError::Inference(format!(
                            "Expected raster input, got {}",
                            other.kind()
                        )))
                    }
                };

                let model = model.ensure_loaded().await.map_err(StageError::Load)?;
                let (raster, mask) = run_blocking(move || {
                    let mask = model.infer(&raster)?;
                    Ok::<_, anyhow::Error>((raster, mask))
                })
                .await?
                .map_err(StageError::inference)?;
                Ok(Artifact::Segmented { raster, mask })
            }
            StageProcessor::Postprocess { compositor } => {
                let (raster, mask) = match input {
                    Artifact::Segmented { raster, mask } => (raster, mask),
                    other => {
                        return Err(StageError::Composite(format!(
                            "Expected raster and mask, got {}",
                            other.kind()
                        )))
                    }
                };

                let compositor = compositor.clone();
                let output = run_blocking(move || compositor.composite(&raster, &mask))
                    .await?
                    .map_err(StageError::composite)?;
                Ok(Artifact::Output(output))
            }
        }
    }
}

/// Run CPU-bound work on the blocking pool.
///
/// A panic is resumed on the calling task, taking the worker down with it.
async fn run_blocking<F, T>(f: F) -> Result<T, StageError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(StageError::crashed(e.to_string())),
    }
}

async fn run_worker(
    worker: WorkerId,
    generation: u32,
    processor: StageProcessor,
    mut inbox: mpsc::Receiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    tracing::debug!(worker = %worker, generation, "Worker started");
    processor.prepare(worker).await;

    if events
        .send(WorkerEvent::Ready { worker, generation })
        .is_err()
    {
        return;
    }

    while let Some(WorkerRequest { job_id, input }) = inbox.recv().await {
        let start = Instant::now();
        let outcome = processor.process(input).await;

        match &outcome {
            Ok(_) => tracing::debug!(
                worker = %worker,
                job_id = %job_id,
                elapsed_ms = start.elapsed().as_millis(),
                "Stage finished"
            ),
            Err(e) => tracing::debug!(
                worker = %worker,
                job_id = %job_id,
                error = %e,
                "Stage failed"
            ),
        }

        let finished = WorkerEvent::Finished {
            worker,
            generation,
            job_id,
            outcome,
        };
        if events.send(finished).is_err() {
            break;
        }
    }

    tracing::debug!(worker = %worker, generation, "Worker stopped");
}
