//! Phase-group actor.
//!
//! A [`Group`] owns everything one phase-group needs: its scheduler state,
//! its view of the request registry, the iteration barrier and the transport
//! towards its workers. It is driven one message at a time, so a group's
//! pass, dispatch and barrier never interleave.
//!
//! [`GroupHandle::spawn`] moves a group onto a tokio task fed by an unbounded
//! mpsc channel. Every command carries a oneshot sender for the reply.

use crate::barrier::{BarrierError, IterationBarrier};
use crate::config::{GroupLayout, SimConfig};
use crate::metrics::GroupStats;
use crate::request::{PhaseRules, RegistryError, RequestId, RequestRegistry, TraceRequest};
use crate::scheduler::{BatchScheduler, PassOutcome, SchedulerError, SchedulerState};
use crate::worker::GroupKind;
use pdsim_grid::{
    generator_by_name, GridError, Scheduled, SimTime, SimulatedGrid, Transport, WorkerEvent,
    WorkerId,
};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum GroupError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Barrier violation: {0}")]
    Barrier(#[from] BarrierError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Grid failure: {0}")]
    Grid(#[from] GridError),
    #[error("Unknown instruction generator '{0}'")]
    UnknownGenerator(String),
    #[error("{0:?} group stopped responding")]
    ChannelClosed(GroupKind),
}

/// What handling one message produced.
#[derive(Debug, Default)]
pub struct GroupReply {
    /// Worker signals to fire later.
    pub scheduled: Vec<Scheduled>,
    /// Requests whose prefill finished here, with their first-token time.
    pub handoffs: Vec<(RequestId, SimTime)>,
    pub finished: Vec<RequestId>,
}

impl GroupReply {
    fn absorb(&mut self, other: GroupReply) {
        self.scheduled.extend(other.scheduled);
        self.handoffs.extend(other.handoffs);
        self.finished.extend(other.finished);
    }
}

/// Final state handed back when a group shuts down.
#[derive(Debug)]
pub struct GroupSummary {
    pub stats: GroupStats,
    pub registry: RequestRegistry,
}

pub struct Group {
    kind: GroupKind,
    scheduler: BatchScheduler,
    state: SchedulerState,
    registry: RequestRegistry,
    barrier: IterationBarrier,
    transport: Box<dyn Transport>,
    /// Start-data bytes owed to the leader cores of admission workers in the
    /// open iteration.
    start_payloads: HashMap<WorkerId, u64>,
    stats: GroupStats,
}

impl Group {
    pub fn new(
        scheduler: BatchScheduler,
        state: SchedulerState,
        registry: RequestRegistry,
        transport: Box<dyn Transport>,
    ) -> Self {
        let kind = state.kind;
        let mut stats =
            GroupStats::new(kind, state.slots.len(), state.strategy().stage_map().stages());
        stats.tp_size = state.slots.tp_size();
        Self {
            kind,
            scheduler,
            state,
            registry,
            barrier: IterationBarrier::new(),
            transport,
            start_payloads: HashMap::new(),
            stats,
        }
    }

    /// Build a group for `layout`, backed by a [`SimulatedGrid`] seeded with
    /// `seed`.
    pub fn from_layout(
        layout: &GroupLayout,
        config: &SimConfig,
        trace: &[TraceRequest],
        seed: u64,
    ) -> Result<Self, GroupError> {
        let generator = generator_by_name(&config.grid.generator)
            .ok_or_else(|| GroupError::UnknownGenerator(config.grid.generator.clone()))?;
        let scheduler = BatchScheduler::new(generator, config.model.shape());
        let state = SchedulerState::from_layout(layout, config)?;
        let registry = RequestRegistry::from_trace(PhaseRules::from_config(config), trace)?;
        let grid = SimulatedGrid::new(
            config.grid.timing.clone().into(),
            config.model.eof_chance,
            seed,
        );
        Ok(Self::new(scheduler, state, registry, Box::new(grid)))
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &GroupStats {
        &self.stats
    }

    pub fn barrier(&self) -> &IterationBarrier {
        &self.barrier
    }

    /// Run a scheduling pass if no iteration is in flight.
    pub fn trigger(&mut self, now: SimTime) -> Result<GroupReply, GroupError> {
        let mut reply = GroupReply::default();
        if !self.barrier.is_idle() {
            self.stats.busy_triggers += 1;
            return Ok(reply);
        }
        let dispatches = match self
            .scheduler
            .schedule(&mut self.state, &mut self.registry, now)?
        {
            PassOutcome::Busy => {
                self.stats.busy_triggers += 1;
                return Ok(reply);
            }
            PassOutcome::Idle => {
                self.stats.idle_passes += 1;
                return Ok(reply);
            }
            PassOutcome::Dispatched(d) => d,
        };

        let slots = &self.state.slots;
        self.barrier
            .dispatch(dispatches.iter().flat_map(|d| slots.cores_of(d.worker)))?;
        self.stats.iterations += 1;
        debug!(
            group = ?self.kind,
            iteration = self.barrier.iteration(),
            workers = dispatches.len(),
            tp_size = slots.tp_size(),
            now,
            "dispatched"
        );
        self.start_payloads.clear();
        for d in dispatches {
            let cores = self.state.slots.cores_of(d.worker);
            if d.start_payload_bytes > 0 {
                self.start_payloads.insert(cores.start, d.start_payload_bytes);
            }
            for core in cores {
                let mut stream = d.stream.clone();
                stream.worker = core;
                reply
                    .scheduled
                    .extend(self.transport.deliver(now, core, stream)?);
            }
        }
        Ok(reply)
    }

    pub fn on_worker_event(
        &mut self,
        now: SimTime,
        event: WorkerEvent,
    ) -> Result<GroupReply, GroupError> {
        match event {
            WorkerEvent::Ack { worker } => self.ack(now, worker),
            WorkerEvent::Done { worker, eof } => self.done(now, worker, &eof),
        }
    }

    /// Count a core's ACK; the last one sends start data and releases every
    /// core.
    pub fn ack(&mut self, now: SimTime, core: WorkerId) -> Result<GroupReply, GroupError> {
        let mut reply = GroupReply::default();
        if !self.barrier.ack(core)? {
            return Ok(reply);
        }
        let cores: Vec<WorkerId> = self.barrier.expected().collect();
        for &c in &cores {
            if let Some(bytes) = self.start_payloads.remove(&c) {
                let landed = self.transport.deliver_start_data(now, c, bytes);
                trace!(core = c, bytes, landed, "start data sent");
            }
        }
        for &c in &cores {
            reply.scheduled.extend(self.transport.release(now, c)?);
        }
        self.barrier.begin_execution()?;
        debug!(group = ?self.kind, iteration = self.barrier.iteration(), now, "all acked, executing");
        Ok(reply)
    }

    /// Count a core's DONE. A leader core's DONE folds its worker's batch;
    /// the last DONE closes the barrier and re-triggers.
    pub fn done(
        &mut self,
        now: SimTime,
        core: WorkerId,
        eof: &[bool],
    ) -> Result<GroupReply, GroupError> {
        let mut reply = GroupReply::default();
        let closed = self.barrier.done(core)?;

        if self.state.slots.is_leader(core) {
            let worker = self
                .state
                .slots
                .slot_of(core)
                .ok_or(SchedulerError::UnknownWorker(core))?;
            self.state.slots.set_busy(worker, false);

            let outcome = self.state.fold(worker, eof, &mut self.registry, now)?;
            if self.kind == GroupKind::Prefill {
                reply.handoffs = outcome
                    .entered_decode
                    .iter()
                    .map(|&id| (id, now))
                    .collect();
            }
            reply.finished = outcome.finished;
        }

        if closed {
            debug!(group = ?self.kind, iteration = self.barrier.iteration(), now, "iteration closed");
            let next = self.trigger(now)?;
            reply.absorb(next);
        }
        Ok(reply)
    }

    /// Take over a request whose prefill ran in the prefill group.
    pub fn handoff(
        &mut self,
        now: SimTime,
        request_id: RequestId,
        first_token_at: SimTime,
    ) -> Result<GroupReply, GroupError> {
        self.registry.accept_handoff(request_id, first_token_at)?;
        self.state.push_ready(request_id);
        self.stats.handoffs_received += 1;
        self.trigger(now)
    }

    pub fn into_summary(self) -> GroupSummary {
        GroupSummary {
            stats: self.stats,
            registry: self.registry,
        }
    }
}

type Reply = oneshot::Sender<Result<GroupReply, GroupError>>;

enum GroupCommand {
    Trigger {
        now: SimTime,
        reply: Reply,
    },
    Signal {
        now: SimTime,
        event: WorkerEvent,
        reply: Reply,
    },
    Handoff {
        now: SimTime,
        request_id: RequestId,
        first_token_at: SimTime,
        reply: Reply,
    },
    Finish {
        reply: oneshot::Sender<GroupSummary>,
    },
}

/// Sending side of a running group actor.
#[derive(Clone)]
pub struct GroupHandle {
    kind: GroupKind,
    tx: mpsc::UnboundedSender<GroupCommand>,
}

impl GroupHandle {
    /// Move `group` onto its own task. Must be called inside a tokio runtime.
    pub fn spawn(group: Group) -> Self {
        let kind = group.kind();
        let (tx, mut rx) = mpsc::unbounded_channel::<GroupCommand>();
        tokio::spawn(async move {
            let mut group = group;
            trace!(group = ?kind, "group task started");
            while let Some(cmd) = rx.recv().await {
                let (result, reply) = match cmd {
                    GroupCommand::Trigger { now, reply } => (group.trigger(now), reply),
                    GroupCommand::Signal { now, event, reply } => {
                        (group.on_worker_event(now, event), reply)
                    }
                    GroupCommand::Handoff {
                        now,
                        request_id,
                        first_token_at,
                        reply,
                    } => (group.handoff(now, request_id, first_token_at), reply),
                    GroupCommand::Finish { reply } => {
                        if reply.send(group.into_summary()).is_err() {
                            trace!(group = ?kind, "summary receiver dropped");
                        }
                        return;
                    }
                };
                if reply.send(result).is_err() {
                    trace!(group = ?kind, "failed to send reply");
                }
            }
            trace!(group = ?kind, "group task shutting down");
        });
        Self { kind, tx }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> GroupCommand,
    ) -> Result<GroupReply, GroupError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| GroupError::ChannelClosed(self.kind))?;
        rx.await.map_err(|_| GroupError::ChannelClosed(self.kind))?
    }

    pub async fn trigger(&self, now: SimTime) -> Result<GroupReply, GroupError> {
        self.request(|reply| GroupCommand::Trigger { now, reply })
            .await
    }

    pub async fn signal(&self, now: SimTime, event: WorkerEvent) -> Result<GroupReply, GroupError> {
        self.request(|reply| GroupCommand::Signal { now, event, reply })
            .await
    }

    pub async fn handoff(
        &self,
        now: SimTime,
        request_id: RequestId,
        first_token_at: SimTime,
    ) -> Result<GroupReply, GroupError> {
        self.request(|reply| GroupCommand::Handoff {
            now,
            request_id,
            first_token_at,
            reply,
        })
        .await
    }

    /// Stop the actor and take back its final state.
    pub async fn finish(self) -> Result<GroupSummary, GroupError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GroupCommand::Finish { reply })
            .map_err(|_| GroupError::ChannelClosed(self.kind))?;
        rx.await.map_err(|_| GroupError::ChannelClosed(self.kind))
    }
}
