//! Discrete-event simulation engine.
//!
//! The engine keeps a priority queue of [`SimEvent`]s sorted by simulated
//! time. Each step pops the next event, advances the clock, forwards the
//! event to the owning group actor and awaits its reply, which may schedule
//! further events. One event is in flight at a time, so a run is fully
//! determined by its config, trace and seed.

use crate::clock::SimClock;
use crate::config::{ConfigError, SimConfig};
use crate::group::{Group, GroupError, GroupHandle, GroupReply};
use crate::metrics::{RequestRecord, RunReport};
use crate::request::{Request, RequestId, TraceRequest};
use crate::trace::TraceError;
use crate::worker::GroupKind;
use pdsim_grid::{SimTime, WorkerEvent, WorkerId};
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("{kind:?} group: {source}")]
    Group {
        kind: GroupKind,
        #[source]
        source: GroupError,
    },
    #[error("Signal from worker {0}, which belongs to no group")]
    UnknownWorker(WorkerId),
    #[error("Handoff of request {0} but no decode group exists")]
    NoDecodeGroup(RequestId),
    #[error("Simulation stalled at {at}ns with {finished}/{total} requests finished")]
    Stalled {
        finished: usize,
        total: usize,
        at: SimTime,
    },
    #[error("Failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Events in the discrete-event simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// A trace request becomes visible to the admitting group.
    Arrival { request_id: RequestId },
    /// ACK or DONE from a worker.
    Worker(WorkerEvent),
    /// A request finished prefill in the prefill group.
    Handoff {
        request_id: RequestId,
        first_token_at: SimTime,
    },
}

/// A timestamped event for the priority queue.
#[derive(Debug, Clone)]
struct TimedEvent {
    time_ns: SimTime,
    sequence: u64,
    event: SimEvent,
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time_ns == other.time_ns && self.sequence == other.sequence
    }
}

impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want min-heap
        other
            .time_ns
            .cmp(&self.time_ns)
            .then(other.sequence.cmp(&self.sequence))
    }
}

/// The main simulation engine.
pub struct SimulationEngine {
    pub clock: SimClock,
    event_queue: BinaryHeap<TimedEvent>,
    sequence: u64,
    /// Groups not yet moved onto their tasks.
    groups: Vec<Group>,
    kinds: Vec<GroupKind>,
    /// Core id -> index into `kinds`.
    owners: HashMap<WorkerId, usize>,
    trace: Vec<TraceRequest>,
    finished: usize,
    pub events_processed: u64,
    config: SimConfig,
}

impl SimulationEngine {
    /// Validate `config` and build one group per layout. Group `i` samples
    /// EOF bits with seed `seed + i`.
    pub fn new(config: SimConfig, mut trace: Vec<TraceRequest>) -> Result<Self, SimError> {
        config.validate()?;
        trace.sort_by_key(|r| r.arrival_ns);

        let mut groups = Vec::new();
        let mut kinds = Vec::new();
        let mut owners = HashMap::new();
        for (index, layout) in config.group_layouts().iter().enumerate() {
            let seed = config.simulation.seed.wrapping_add(index as u64);
            let group = Group::from_layout(layout, &config, &trace, seed).map_err(|source| {
                SimError::Group {
                    kind: layout.kind,
                    source,
                }
            })?;
            for core in layout.cores() {
                owners.insert(core, index);
            }
            kinds.push(layout.kind);
            groups.push(group);
        }

        Ok(Self {
            clock: SimClock::new(),
            event_queue: BinaryHeap::new(),
            sequence: 0,
            groups,
            kinds,
            owners,
            trace,
            finished: 0,
            events_processed: 0,
            config,
        })
    }

    /// Schedule an event at a given time.
    pub fn schedule_event(&mut self, time_ns: SimTime, event: SimEvent) {
        self.event_queue.push(TimedEvent {
            time_ns,
            sequence: self.sequence,
            event,
        });
        self.sequence += 1;
    }

    fn group_index(&self, kind: GroupKind) -> Option<usize> {
        self.kinds.iter().position(|k| *k == kind)
    }

    /// The group that admits new arrivals.
    fn admitting_group(&self) -> usize {
        self.group_index(GroupKind::Prefill).unwrap_or(0)
    }

    fn absorb(&mut self, reply: GroupReply) {
        for s in reply.scheduled {
            self.schedule_event(s.at, SimEvent::Worker(s.event));
        }
        for (request_id, first_token_at) in reply.handoffs {
            self.schedule_event(
                first_token_at,
                SimEvent::Handoff {
                    request_id,
                    first_token_at,
                },
            );
        }
        self.finished += reply.finished.len();
    }

    /// Run until every request is done. Must be called inside a tokio
    /// runtime.
    pub async fn run(mut self) -> Result<RunReport, SimError> {
        let total = self.trace.len();
        let handles: Vec<GroupHandle> = std::mem::take(&mut self.groups)
            .into_iter()
            .map(GroupHandle::spawn)
            .collect();
        info!(
            name = %self.config.simulation.name,
            requests = total,
            groups = handles.len(),
            "simulation started"
        );

        let arrivals: Vec<SimTime> = self.trace.iter().map(|r| r.arrival_ns).collect();
        for (request_id, at) in arrivals.into_iter().enumerate() {
            self.schedule_event(at, SimEvent::Arrival { request_id });
        }

        let admit = self.admitting_group();
        let decode = self.group_index(GroupKind::Decode);

        while self.finished < total {
            let Some(timed) = self.event_queue.pop() else {
                break;
            };
            self.clock.advance_to_ns(timed.time_ns);
            self.events_processed += 1;
            let now = timed.time_ns;

            let (index, reply) = match timed.event {
                SimEvent::Arrival { request_id } => {
                    debug!(request_id, now, "arrival");
                    (admit, handles[admit].trigger(now).await)
                }
                SimEvent::Worker(event) => {
                    let worker = event.worker();
                    let index = *self
                        .owners
                        .get(&worker)
                        .ok_or(SimError::UnknownWorker(worker))?;
                    (index, handles[index].signal(now, event).await)
                }
                SimEvent::Handoff {
                    request_id,
                    first_token_at,
                } => {
                    let index = decode.ok_or(SimError::NoDecodeGroup(request_id))?;
                    debug!(request_id, now, "handoff to decode group");
                    (
                        index,
                        handles[index]
                            .handoff(now, request_id, first_token_at)
                            .await,
                    )
                }
            };
            let reply = reply.map_err(|source| SimError::Group {
                kind: self.kinds[index],
                source,
            })?;
            self.absorb(reply);
        }

        let final_time = self.clock.now_ns();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let kind = handle.kind();
            summaries.push(
                handle
                    .finish()
                    .await
                    .map_err(|source| SimError::Group { kind, source })?,
            );
        }

        if self.finished < total {
            warn!(
                finished = self.finished,
                total,
                at = final_time,
                "event queue drained with unfinished requests"
            );
            return Err(SimError::Stalled {
                finished: self.finished,
                total,
                at: final_time,
            });
        }

        // Each request's most advanced record across groups is authoritative.
        let mut latest: Vec<Option<&Request>> = vec![None; total];
        for summary in &summaries {
            for req in summary.registry.iter() {
                let slot = &mut latest[req.id];
                if slot.map_or(true, |cur| req.phase > cur.phase) {
                    *slot = Some(req);
                }
            }
        }
        let records: Vec<RequestRecord> = latest
            .into_iter()
            .flatten()
            .filter_map(RequestRecord::from_request)
            .collect();
        let stats = summaries.iter().map(|s| s.stats.clone()).collect();

        let report = RunReport::build(
            &self.config.simulation.name,
            final_time,
            total,
            records,
            stats,
        );
        info!(
            final_time_ns = report.final_time_ns,
            iterations = report.iterations(),
            events = self.events_processed,
            "simulation finished"
        );
        Ok(report)
    }
}
