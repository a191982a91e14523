//! Model lifecycle for segment workers.
//!
//! Each segment worker owns one [`ModelLifecycle`]. The model is loaded
//! lazily, at most once per worker unless a load fails, and concurrent
//! callers during a load all await the same in-flight future.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::progress::ProgressThrottle;
use super::types::ModelState;
use crate::segmentation::{LoadProgress, ModelLoader, SegmentationModel};

type LoadResult = Result<Arc<dyn SegmentationModel>, String>;
type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

/// Receives model state changes with load progress (0-100).
pub(crate) type ModelReporter = Arc<dyn Fn(ModelState, u8) + Send + Sync>;

enum LoadSlot {
    NotLoaded,
    Loading { attempt: u64, future: LoadFuture },
    Ready(Arc<dyn SegmentationModel>),
    LoadFailed(String),
}

pub(crate) struct ModelLifecycle {
    loader: Arc<dyn ModelLoader>,
    reporter: ModelReporter,
    interval: Duration,
    slot: Mutex<LoadSlot>,
    attempts: Mutex<u64>,
}

impl ModelLifecycle {
    pub fn new(loader: Arc<dyn ModelLoader>, reporter: ModelReporter, interval: Duration) -> Self {
        Self {
            loader,
            reporter,
            interval,
            slot: Mutex::new(LoadSlot::NotLoaded),
            attempts: Mutex::new(0),
        }
    }

    pub fn state(&self) -> ModelState {
        match &*self.slot.lock() {
            LoadSlot::NotLoaded => ModelState::NotLoaded,
            LoadSlot::Loading { .. } => ModelState::Loading,
            LoadSlot::Ready(_) => ModelState::Ready,
            LoadSlot::LoadFailed(_) => ModelState::LoadFailed,
        }
    }

    /// Number of load attempts started so far.
    pub fn attempts(&self) -> u64 {
        *self.attempts.lock()
    }

    /// Resolve to the loaded model, starting a load if needed.
    ///
    /// `Ready` resolves immediately. `Loading` joins the in-flight load.
    /// `NotLoaded` and `LoadFailed` start a fresh attempt.
    pub async fn ensure_loaded(&self) -> LoadResult {
        let (attempt, future) = {
            let mut slot = self.slot.lock();
            let in_flight = match &*slot {
                LoadSlot::Ready(model) => return Ok(model.clone()),
                LoadSlot::Loading { attempt, future } => Some((*attempt, future.clone())),
                LoadSlot::NotLoaded | LoadSlot::LoadFailed(_) => None,
            };
            match in_flight {
                Some(joined) => joined,
                None => {
                    let attempt = {
                        let mut attempts = self.attempts.lock();
                        *attempts += 1;
                        *attempts
                    };
                    let future = self.begin_load(attempt);
                    *slot = LoadSlot::Loading {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                }
            }
        };

        let result = future.await;

        let mut slot = self.slot.lock();
        if matches!(&*slot, LoadSlot::Loading { attempt: current, .. } if *current == attempt) {
            *slot = match &result {
                Ok(model) => LoadSlot::Ready(model.clone()),
                Err(e) => LoadSlot::LoadFailed(e.clone()),
            };
        }
        result
    }

    /// The loaded model, if `Ready`.
    pub fn model(&self) -> Option<Arc<dyn SegmentationModel>> {
        match &*self.slot.lock() {
            LoadSlot::Ready(model) => Some(model.clone()),
            _ => None,
        }
    }

    fn begin_load(&self, attempt: u64) -> LoadFuture {
        let loader = self.loader.clone();
        let reporter = self.reporter.clone();
        let throttle = Arc::new(Mutex::new(ProgressThrottle::new(self.interval)));

        async move {
            tracing::info!(attempt, "Loading segmentation model");
            if let Some(pct) = throttle.lock().offer(0, Instant::now()) {
                reporter(ModelState::Loading, pct);
            }

            let progress: LoadProgress = {
                let reporter = reporter.clone();
                let throttle = throttle.clone();
                Arc::new(move |fraction: f32| {
                    let pct = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
                    let emit = throttle.lock().offer(pct, Instant::now());
                    if let Some(pct) = emit {
                        reporter(ModelState::Loading, pct);
                    }
                })
            };

            let start = Instant::now();
            let result = loader.load(progress).await;
            let last = throttle.lock().last();

            match result {
                Ok(model) => {
                    let emit = throttle.lock().offer(100, Instant::now());
                    if let Some(pct) = emit {
                        reporter(ModelState::Loading, pct);
                    }
                    tracing::info!(
                        attempt,
                        elapsed_ms = start.elapsed().as_millis(),
                        "Segmentation model loaded"
                    );
                    reporter(ModelState::Ready, 100);
                    Ok(model)
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    tracing::error!(attempt, error = %message, "Segmentation model failed to load");
                    reporter(ModelState::LoadFailed, last);
                    Err(message)
                }
            }
        }
        .boxed()
        .shared()
    }
}
