//! Continuous-batching scheduler.
//!
//! One [`SchedulerState`] exists per phase-group. Each pass rebuilds every
//! admission worker's batch in a fixed priority order:
//!
//! 1. carry-over of still-decoding requests from the carry source,
//! 2. the decode backlog (own `idle_decode`, then other workers', then
//!    requests handed over from the prefill group),
//! 3. the next chunk of partially dispatched prefills,
//! 4. brand-new arrivals,
//!
//! until the worker's credit runs out. Non-admission ring stages replay their
//! predecessor's previous batch. Every non-empty batch is turned into an
//! instruction stream.

use crate::config::{GroupLayout, SimConfig};
use crate::credit::CreditLedger;
use crate::pipeline::{strategy_by_name, AssignmentStrategy};
use crate::request::{Phase, PhaseTransition, RegistryError, RequestId, RequestRegistry};
use crate::worker::{GroupKind, Stage, WorkerSlotTable};
use pdsim_grid::{
    start_payload_bytes, BatchEntry, GridError, InstructionGenerator, InstructionStream,
    ModelShape, SimTime, WorkerId,
};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Instruction generation failed: {0}")]
    Generation(#[from] GridError),
    #[error("Unknown assignment strategy '{0}'")]
    UnknownStrategy(String),
    #[error("Worker {0} does not belong to this group")]
    UnknownWorker(WorkerId),
    #[error("Request {request} assigned to both worker {first} and worker {second} in one pass")]
    DoubleAssignment {
        request: RequestId,
        first: WorkerId,
        second: WorkerId,
    },
    #[error("Worker {worker} reported {got} EOF bits for a batch of {expected}")]
    EofMismatch {
        worker: WorkerId,
        expected: usize,
        got: usize,
    },
}

/// A stream ready to go out to one worker.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub worker: WorkerId,
    pub stream: InstructionStream,
    /// Input activations the worker waits for; zero when none.
    pub start_payload_bytes: u64,
}

#[derive(Debug)]
pub enum PassOutcome {
    /// The previous iteration has not finished yet.
    Busy,
    /// Nothing to run; no state was dispatched.
    Idle,
    Dispatched(Vec<Dispatch>),
}

/// What a worker's DONE changed in the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FoldOutcome {
    /// Requests whose final prefill chunk just completed.
    pub entered_decode: Vec<RequestId>,
    pub finished: Vec<RequestId>,
}

/// Everything one phase-group's scheduler owns.
pub struct SchedulerState {
    pub kind: GroupKind,
    pub slots: WorkerSlotTable,
    strategy: Box<dyn AssignmentStrategy>,
    ledger: CreditLedger,
    admission: Vec<WorkerId>,
    idle_decode: HashMap<WorkerId, VecDeque<RequestId>>,
    unfinished_prefill: HashMap<WorkerId, VecDeque<RequestId>>,
    decode_ready: VecDeque<RequestId>,
    /// Iterations dispatched so far.
    pub iteration: u64,
}

impl SchedulerState {
    pub fn new(
        kind: GroupKind,
        slots: WorkerSlotTable,
        strategy: Box<dyn AssignmentStrategy>,
        ledger: CreditLedger,
    ) -> Self {
        let admission = strategy.stage_map().admission_workers();
        Self {
            kind,
            slots,
            strategy,
            ledger,
            admission,
            idle_decode: HashMap::new(),
            unfinished_prefill: HashMap::new(),
            decode_ready: VecDeque::new(),
            iteration: 0,
        }
    }

    /// Build the state for one group of a validated config.
    pub fn from_layout(layout: &GroupLayout, config: &SimConfig) -> Result<Self, SchedulerError> {
        let strategy = strategy_by_name(
            &config.scheduler.assignment,
            layout.workers.clone(),
            layout.stages,
        )
        .ok_or_else(|| SchedulerError::UnknownStrategy(config.scheduler.assignment.clone()))?;
        let slots = WorkerSlotTable::new(layout.workers.clone(), layout.kind.role())
            .with_tensor_parallel(layout.tp_size);
        let ledger = CreditLedger::new(config.scheduler.core_credit, config.scheduler.pd_ratio);
        Ok(Self::new(layout.kind, slots, strategy, ledger))
    }

    pub fn strategy(&self) -> &dyn AssignmentStrategy {
        self.strategy.as_ref()
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// Queue a request the prefill group handed over.
    pub fn push_ready(&mut self, id: RequestId) {
        self.decode_ready.push_back(id);
    }

    pub fn idle_decode(&self, worker: WorkerId) -> Vec<RequestId> {
        self.idle_decode
            .get(&worker)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn unfinished_prefill(&self, worker: WorkerId) -> Vec<RequestId> {
        self.unfinished_prefill
            .get(&worker)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn decode_ready_len(&self) -> usize {
        self.decode_ready.len()
    }

    fn pop_decode_backlog(&mut self, worker: WorkerId) -> Option<RequestId> {
        if let Some(id) = self.idle_decode.get_mut(&worker).and_then(|q| q.pop_front()) {
            return Some(id);
        }
        for other in &self.admission {
            if *other == worker {
                continue;
            }
            if let Some(id) = self.idle_decode.get_mut(other).and_then(|q| q.pop_front()) {
                return Some(id);
            }
        }
        self.decode_ready.pop_front()
    }

    /// Build the next batch of one admission worker.
    fn fill(
        &mut self,
        worker: WorkerId,
        carried: &[Stage],
        registry: &mut RequestRegistry,
        now: SimTime,
    ) -> Result<Vec<Stage>, SchedulerError> {
        let role = self.kind.role();
        let mut budget = self.ledger.budget();
        let mut batch = Vec::new();

        if role.decodes() {
            for stage in carried.iter().filter(|s| s.phase == Phase::Decode) {
                if budget.try_charge(Phase::Decode) {
                    batch.push(Stage::decode(stage.request_id));
                } else {
                    self.idle_decode
                        .entry(worker)
                        .or_default()
                        .push_back(stage.request_id);
                }
            }
            while budget.admits(Phase::Decode) {
                let Some(id) = self.pop_decode_backlog(worker) else {
                    break;
                };
                budget.try_charge(Phase::Decode);
                batch.push(Stage::decode(id));
            }
        }

        if role.prefills() {
            let queue = self.unfinished_prefill.entry(worker).or_default();
            // Visit each queued request at most once per pass.
            for _ in 0..queue.len() {
                if !budget.admits(Phase::Prefill) {
                    break;
                }
                let Some(id) = queue.pop_front() else {
                    break;
                };
                let tokens = registry.dispatch_chunk(id)?;
                budget.try_charge(Phase::Prefill);
                batch.push(Stage::prefill(id, tokens));
                if registry.get(id).is_some_and(|r| r.has_undispatched_chunks()) {
                    queue.push_back(id);
                }
            }
            while budget.admits(Phase::Prefill) {
                let Some(id) = registry.next_arrival(now) else {
                    break;
                };
                let tokens = registry.start_prefill(id)?;
                budget.try_charge(Phase::Prefill);
                batch.push(Stage::prefill(id, tokens));
                if registry.get(id).is_some_and(|r| r.has_undispatched_chunks()) {
                    queue.push_back(id);
                }
            }
        }

        debug_assert!(budget.committed() <= self.ledger.core_credit);
        Ok(batch)
    }

    /// Fold a worker's DONE into the registry.
    ///
    /// Workers that do not fold results (non-final ring stages) are a no-op.
    /// The folded batch is updated in place: prefills that produced their
    /// first token become 1-token decode stages, finished requests become
    /// `Done` and are dropped at the next carry-over.
    pub fn fold(
        &mut self,
        worker: WorkerId,
        eof: &[bool],
        registry: &mut RequestRegistry,
        now: SimTime,
    ) -> Result<FoldOutcome, SchedulerError> {
        let mut outcome = FoldOutcome::default();
        if !self.strategy.folds_results(worker) {
            return Ok(outcome);
        }
        let slot = self
            .slots
            .get_mut(worker)
            .ok_or(SchedulerError::UnknownWorker(worker))?;
        if eof.len() != slot.current_batch.len() {
            return Err(SchedulerError::EofMismatch {
                worker,
                expected: slot.current_batch.len(),
                got: eof.len(),
            });
        }
        for (stage, &eof) in slot.current_batch.iter_mut().zip(eof) {
            match stage.phase {
                Phase::Prefill => {
                    if registry.advance_prefill(stage.request_id, now)?
                        == PhaseTransition::EnteredDecode
                    {
                        stage.phase = Phase::Decode;
                        stage.token_count = 1;
                        outcome.entered_decode.push(stage.request_id);
                    }
                }
                Phase::Decode => {
                    if registry.advance_decode(stage.request_id, eof, now)?
                        == PhaseTransition::Finished
                    {
                        stage.phase = Phase::Done;
                        outcome.finished.push(stage.request_id);
                    }
                }
                Phase::Untouched | Phase::Done => {}
            }
        }
        Ok(outcome)
    }
}

/// Runs scheduling passes and turns batches into instruction streams.
pub struct BatchScheduler {
    generator: Box<dyn InstructionGenerator>,
    shape: ModelShape,
}

impl BatchScheduler {
    pub fn new(generator: Box<dyn InstructionGenerator>, shape: ModelShape) -> Self {
        Self { generator, shape }
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    /// One scheduling pass over a group.
    pub fn schedule(
        &self,
        state: &mut SchedulerState,
        registry: &mut RequestRegistry,
        now: SimTime,
    ) -> Result<PassOutcome, SchedulerError> {
        if state.slots.any_busy() {
            return Ok(PassOutcome::Busy);
        }

        let previous = state.slots.snapshot();
        let mut next: Vec<Vec<Stage>> = vec![Vec::new(); previous.len()];
        let mut assigned: HashMap<RequestId, WorkerId> = HashMap::new();
        let local = |slots: &WorkerSlotTable, worker: WorkerId| {
            slots
                .index_of(worker)
                .ok_or(SchedulerError::UnknownWorker(worker))
        };

        let admission = state.admission.clone();
        for worker in admission {
            let source = local(&state.slots, state.strategy.carry_source(worker))?;
            let batch = state.fill(worker, &previous[source], registry, now)?;
            for stage in &batch {
                if let Some(first) = assigned.insert(stage.request_id, worker) {
                    return Err(SchedulerError::DoubleAssignment {
                        request: stage.request_id,
                        first,
                        second: worker,
                    });
                }
            }
            next[local(&state.slots, worker)?] = batch;
        }
        for worker in state.slots.workers() {
            if let Some(source) = state.strategy.copy_source(worker) {
                let from = local(&state.slots, source)?;
                next[local(&state.slots, worker)?] = previous[from].clone();
            }
        }
        state.slots.install(next);

        if state.slots.all_empty() {
            trace!(group = ?state.kind, now, "idle pass");
            return Ok(PassOutcome::Idle);
        }

        state.iteration += 1;
        let map = state.strategy.stage_map();
        let mut dispatches = Vec::new();
        for slot in state.slots.iter().filter(|s| !s.current_batch.is_empty()) {
            let entries: Vec<BatchEntry> = slot.current_batch.iter().map(Stage::to_entry).collect();
            let placement = map.placement(slot.id);
            let stream = self
                .generator
                .generate(slot.id, &entries, &placement, &self.shape)?;
            let start_payload_bytes = if placement.admits() {
                start_payload_bytes(&entries, &self.shape)
            } else {
                0
            };
            debug!(
                group = ?state.kind,
                iteration = state.iteration,
                worker = slot.id,
                batch = ?slot.current_batch.iter().map(|s| (s.request_id, s.token_count)).collect::<Vec<_>>(),
                "assigned"
            );
            dispatches.push(Dispatch {
                worker: slot.id,
                stream,
                start_payload_bytes,
            });
        }
        for d in &dispatches {
            state.slots.set_busy(d.worker, true);
        }
        Ok(PassOutcome::Dispatched(dispatches))
    }
}
