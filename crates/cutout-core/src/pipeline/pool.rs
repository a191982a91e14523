//! Fixed-size worker pools with an owned slot table.
//!
//! A pool never runs anything itself. It tracks which worker slot is
//! idle, busy or crashed, hands requests to idle workers, and respawns
//! crashed workers through a [`SpawnWorker`] implementation.

use tokio::sync::mpsc;

use super::types::{JobId, ModelState, Stage, WorkerId, WorkerState};
use super::workers::WorkerRequest;

/// Starts the execution context behind a worker slot.
///
/// Returns the worker's request inbox. Abstracted so pools can be tested
/// without real workers.
pub(crate) trait SpawnWorker: Send + Sync {
    fn spawn(&self, worker: WorkerId, generation: u32) -> mpsc::Sender<WorkerRequest>;
}

#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_job: Option<JobId>,
    /// Incremented on every respawn; events from older generations are stale
    pub generation: u32,
    pub respawns: u32,
    /// Segment workers only
    pub model: Option<(ModelState, u8)>,
    inbox: Option<mpsc::Sender<WorkerRequest>>,
}

impl WorkerSlot {
    fn matches(&self, worker: WorkerId, generation: u32) -> bool {
        self.id == worker && self.generation == generation
    }
}

/// Why a request could not be handed to a worker.
#[derive(Debug)]
pub(crate) enum DispatchError {
    /// No slot is idle; the caller keeps the job queued
    NoIdleWorker(WorkerRequest),
    /// The chosen worker's context is gone
    Disconnected {
        worker: WorkerId,
        request: WorkerRequest,
    },
}

/// Result of a worker context terminating.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ExitOutcome {
    /// Job the worker was holding, now lost
    pub lost_job: Option<JobId>,
    /// New generation if the slot was respawned
    pub respawned: Option<u32>,
    /// Slot stays crashed for good
    pub gave_up: bool,
}

pub(crate) struct WorkerPool {
    stage: Stage,
    slots: Vec<WorkerSlot>,
    max_respawns: u32,
}

impl WorkerPool {
    /// Create `size` slots and spawn a worker in each.
    pub fn new(stage: Stage, size: usize, max_respawns: u32, spawner: &dyn SpawnWorker) -> Self {
        let slots = (0..size)
            .map(|index| {
                let id = WorkerId { stage, index };
                WorkerSlot {
                    id,
                    state: WorkerState::Initializing,
                    current_job: None,
                    generation: 0,
                    respawns: 0,
                    model: (stage == Stage::Segment).then_some((ModelState::NotLoaded, 0)),
                    inbox: Some(spawner.spawn(id, 0)),
                }
            })
            .collect();

        Self {
            stage,
            slots,
            max_respawns,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn has_idle(&self) -> bool {
        self.slots.iter().any(|s| s.state == WorkerState::Idle)
    }

    pub fn busy(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == WorkerState::Busy)
            .count()
    }

    /// Slots that are not crashed.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != WorkerState::Crashed)
            .count()
    }

    pub fn is_degraded(&self) -> bool {
        self.live() < self.slots.len()
    }

    fn slot_mut(&mut self, worker: WorkerId, generation: u32) -> Option<&mut WorkerSlot> {
        if worker.stage != self.stage {
            return None;
        }
        self.slots
            .get_mut(worker.index)
            .filter(|s| s.matches(worker, generation))
    }

    /// Hand the request to the lowest-index idle worker.
    pub fn dispatch(&mut self, request: WorkerRequest) -> Result<WorkerId, DispatchError> {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.state == WorkerState::Idle)
        else {
            return Err(DispatchError::NoIdleWorker(request));
        };

        let job_id = request.job_id;
        let sent = match &slot.inbox {
            Some(inbox) => inbox.try_send(request).map_err(|e| match e {
                mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
            }),
            None => Err(request),
        };

        match sent {
            Ok(()) => {
                slot.state = WorkerState::Busy;
                slot.current_job = Some(job_id);
                Ok(slot.id)
            }
            Err(request) => Err(DispatchError::Disconnected {
                worker: slot.id,
                request,
            }),
        }
    }

    /// `Initializing → Idle` once the worker has finished its setup.
    pub fn on_ready(&mut self, worker: WorkerId, generation: u32) -> bool {
        match self.slot_mut(worker, generation) {
            Some(slot) if slot.state == WorkerState::Initializing => {
                slot.state = WorkerState::Idle;
                true
            }
            _ => false,
        }
    }

    /// `Busy → Idle` when the worker reports back for `job_id`.
    ///
    /// Returns false for stale or duplicate reports, so a slot is freed
    /// exactly once per dispatch.
    pub fn on_worker_finished(&mut self, worker: WorkerId, generation: u32, job_id: JobId) -> bool {
        match self.slot_mut(worker, generation) {
            Some(slot) if slot.state == WorkerState::Busy && slot.current_job == Some(job_id) => {
                slot.state = WorkerState::Idle;
                slot.current_job = None;
                true
            }
            _ => false,
        }
    }

    pub fn on_model_state(
        &mut self,
        worker: WorkerId,
        generation: u32,
        state: ModelState,
        progress: u8,
    ) -> bool {
        match self.slot_mut(worker, generation) {
            Some(slot) if slot.model.is_some() => {
                slot.model = Some((state, progress));
                true
            }
            _ => false,
        }
    }

    /// Handle a worker context terminating.
    ///
    /// The slot is marked crashed, any held job is reported lost, and the
    /// slot is respawned if it has respawns left.
    pub fn on_worker_exited(
        &mut self,
        worker: WorkerId,
        generation: u32,
        spawner: &dyn SpawnWorker,
    ) -> Option<ExitOutcome> {
        let max_respawns = self.max_respawns;
        let slot = self.slot_mut(worker, generation)?;
        if slot.state == WorkerState::Crashed {
            return None;
        }

        let mut outcome = ExitOutcome {
            lost_job: slot.current_job.take(),
            ..Default::default()
        };
        slot.state = WorkerState::Crashed;
        slot.inbox = None;

        if slot.respawns < max_respawns {
            slot.respawns += 1;
            slot.generation += 1;
            slot.state = WorkerState::Initializing;
            if slot.model.is_some() {
                slot.model = Some((ModelState::NotLoaded, 0));
            }
            slot.inbox = Some(spawner.spawn(slot.id, slot.generation));
            outcome.respawned = Some(slot.generation);
        } else {
            outcome.gave_up = true;
        }

        Some(outcome)
    }

    /// Close every inbox so workers exit.
    pub fn shutdown(&mut self) {
        for slot in &mut self.slots {
            slot.inbox = None;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::types::{Artifact, SourceInput};
    use parking_lot::Mutex;

    /// Spawner handing out plain channels; the test plays the worker.
    #[derive(Default)]
    pub(crate) struct FakeSpawner {
        pub inboxes: Mutex<Vec<(WorkerId, u32, mpsc::Receiver<WorkerRequest>)>>,
    }

    impl SpawnWorker for FakeSpawner {
        fn spawn(&self, worker: WorkerId, generation: u32) -> mpsc::Sender<WorkerRequest> {
            let (tx, rx) = mpsc::channel(1);
            self.inboxes.lock().push((worker, generation, rx));
            tx
        }
    }

    impl FakeSpawner {
        pub fn spawned(&self) -> usize {
            self.inboxes.lock().len()
        }

        /// Drop the receiving end of a worker, as if its context died.
        pub fn kill(&self, worker: WorkerId, generation: u32) {
            self.inboxes
                .lock()
                .retain(|(w, g, _)| !(*w == worker && *g == generation));
        }
    }

    fn request() -> WorkerRequest {
        WorkerRequest {
            job_id: JobId::new(),
            input: Artifact::Source(SourceInput::from(vec![0])),
        }
    }

    fn ready_pool(size: usize, spawner: &FakeSpawner) -> WorkerPool {
        let mut pool = WorkerPool::new(Stage::Preprocess, size, 1, spawner);
        for index in 0..size {
            let id = WorkerId {
                stage: Stage::Preprocess,
                index,
            };
            assert!(pool.on_ready(id, 0));
        }
        pool
    }

    #[test]
    fn test_new_pool_is_initializing() {
        let spawner = FakeSpawner::default();
        let pool = WorkerPool::new(Stage::Segment, 3, 1, &spawner);

        assert_eq!(spawner.spawned(), 3);
        assert!(!pool.has_idle());
        assert!(pool
            .slots()
            .iter()
            .all(|s| s.state == WorkerState::Initializing
                && s.model == Some((ModelState::NotLoaded, 0))));
    }

    #[test]
    fn test_dispatch_only_to_idle_workers() {
        let spawner = FakeSpawner::default();
        let mut pool = ready_pool(2, &spawner);

        let first = pool.dispatch(request()).unwrap();
        let second = pool.dispatch(request()).unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.busy(), 2);

        match pool.dispatch(request()) {
            Err(DispatchError::NoIdleWorker(_)) => {}
            other => panic!("expected NoIdleWorker, got {:?}", other),
        }
    }

    #[test]
    fn test_finished_frees_slot_exactly_once() {
        let spawner = FakeSpawner::default();
        let mut pool = ready_pool(1, &spawner);

        let req = request();
        let job_id = req.job_id;
        let worker = pool.dispatch(req).unwrap();

        assert!(pool.on_worker_finished(worker, 0, job_id));
        assert!(!pool.on_worker_finished(worker, 0, job_id));
        assert!(pool.has_idle());
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn test_finished_for_wrong_job_is_ignored() {
        let spawner = FakeSpawner::default();
        let mut pool = ready_pool(1, &spawner);
        let worker = pool.dispatch(request()).unwrap();

        assert!(!pool.on_worker_finished(worker, 0, JobId::new()));
        assert_eq!(pool.busy(), 1);
    }

    #[test]
    fn test_dispatch_to_dead_worker_returns_request() {
        let spawner = FakeSpawner::default();
        let mut pool = ready_pool(1, &spawner);
        let worker = WorkerId {
            stage: Stage::Preprocess,
            index: 0,
        };
        spawner.kill(worker, 0);

        let req = request();
        let job_id = req.job_id;
        match pool.dispatch(req) {
            Err(DispatchError::Disconnected { worker: w, request }) => {
                assert_eq!(w, worker);
                assert_eq!(request.job_id, job_id);
            }
            other => panic!("expected Disconnected, got {:?}", other),
        }
        // Slot was never marked busy
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn test_crash_respawns_then_gives_up() {
        let spawner = FakeSpawner::default();
        let mut pool = ready_pool(1, &spawner);
        let req = request();
        let job_id = req.job_id;
        let worker = pool.dispatch(req).unwrap();

        let outcome = pool.on_worker_exited(worker, 0, &spawner).unwrap();
        assert_eq!(outcome.lost_job, Some(job_id));
        assert_eq!(outcome.respawned, Some(1));
        assert_eq!(spawner.spawned(), 2);
        assert_eq!(pool.slots()[0].state, WorkerState::Initializing);

        // Stale events from generation 0 are ignored
        assert!(!pool.on_ready(worker, 0));
        assert!(pool.on_worker_exited(worker, 0, &spawner).is_none());

        assert!(pool.on_ready(worker, 1));
        let outcome = pool.on_worker_exited(worker, 1, &spawner).unwrap();
        assert_eq!(outcome.lost_job, None);
        assert!(outcome.gave_up);
        assert_eq!(pool.live(), 0);
        assert!(pool.is_degraded());
        assert!(!pool.has_idle());
    }

    #[test]
    fn test_model_state_only_for_segment_slots() {
        let spawner = FakeSpawner::default();
        let mut pool = ready_pool(1, &spawner);
        let worker = pool.slots()[0].id;
        assert!(!pool.on_model_state(worker, 0, ModelState::Loading, 5));

        let mut segment = WorkerPool::new(Stage::Segment, 1, 1, &spawner);
        let worker = segment.slots()[0].id;
        assert!(segment.on_model_state(worker, 0, ModelState::Loading, 5));
        assert_eq!(segment.slots()[0].model, Some((ModelState::Loading, 5)));
    }
}
