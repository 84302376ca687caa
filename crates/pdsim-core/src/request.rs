//! Request lifecycle and the arena-backed [`RequestRegistry`].
//!
//! Every request walks `Untouched -> Prefill -> Decode -> Done`, never
//! backwards. Requests are stored in arrival order and addressed by their
//! index, so ids double as arrival rank.

use crate::config::SimConfig;
use pdsim_grid::SimTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Arena index of a request.
pub type RequestId = usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown request {0}")]
    UnknownRequest(RequestId),
    #[error("Request {0} is already done")]
    AlreadyDone(RequestId),
    #[error("Request {id} is in {phase:?}, expected {expected:?}")]
    WrongPhase {
        id: RequestId,
        phase: Phase,
        expected: Phase,
    },
    #[error("Request {id} completed more chunks than dispatched ({dispatched})")]
    ChunkOverrun { id: RequestId, dispatched: u32 },
    #[error("Request {id} has no prefill chunk left to dispatch ({total} total)")]
    NoChunkLeft { id: RequestId, total: u32 },
    #[error("Request arriving at {arrival}ns admitted after one arriving at {previous}ns")]
    OutOfOrder { arrival: SimTime, previous: SimTime },
    #[error("Request has zero sequence length")]
    EmptySequence,
}

/// Lifecycle phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Untouched,
    Prefill,
    Decode,
    Done,
}

/// Result of folding one completed unit of work into a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    /// Still in the same phase.
    Stayed,
    /// Final prefill chunk completed; the first token exists.
    EnteredDecode,
    /// Request reached `Done`.
    Finished,
}

/// A request as it appears in a trace, before the simulator touches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRequest {
    /// Arrival time in simulation nanoseconds.
    pub arrival_ns: SimTime,
    /// Prompt length in tokens.
    pub sequence_length: u32,
}

impl TraceRequest {
    pub fn new(arrival_ns: SimTime, sequence_length: u32) -> Self {
        Self {
            arrival_ns,
            sequence_length,
        }
    }
}

/// A request tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub sequence_length: u32,
    pub arrival_time: SimTime,
    pub prefill_iteration_count: u32,
    pub phase: Phase,
    pub prefill_completed_count: u32,
    pub prefill_dispatched_count: u32,
    pub decode_step_count: u32,
    /// Time the first token was produced.
    pub first_token_at: Option<SimTime>,
    /// One timestamp per produced token, first token included.
    pub token_times: Vec<SimTime>,
    pub finished_at: Option<SimTime>,
}

impl Request {
    /// Tokens carried by each prefill chunk.
    pub fn chunk_tokens(&self) -> u32 {
        self.sequence_length.div_ceil(self.prefill_iteration_count)
    }

    pub fn has_undispatched_chunks(&self) -> bool {
        self.prefill_dispatched_count < self.prefill_iteration_count
    }
}

/// Constants that govern phase progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseRules {
    pub attention_heads: u32,
    pub max_prefill_workload: u32,
    /// Fixed chunk count overriding the workload rule.
    pub prefill_iterations: Option<u32>,
    /// Decode steps after which a request is forced to finish.
    pub decode_cap: u32,
}

impl PhaseRules {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            attention_heads: config.model.attention_heads,
            max_prefill_workload: config.model.max_prefill_workload,
            prefill_iterations: config.model.prefill_iterations,
            decode_cap: config.decode_cap(),
        }
    }

    /// `ceil(sequence_length * heads / max_prefill_workload)`, at least 1.
    pub fn prefill_iterations_for(&self, sequence_length: u32) -> u32 {
        if let Some(fixed) = self.prefill_iterations {
            return fixed.max(1);
        }
        let work = sequence_length as u64 * self.attention_heads as u64;
        let chunks = work.div_ceil(self.max_prefill_workload.max(1) as u64);
        chunks.clamp(1, u32::MAX as u64) as u32
    }
}

/// Owns every request record and its phase state machine.
#[derive(Debug, Clone)]
pub struct RequestRegistry {
    requests: Vec<Request>,
    rules: PhaseRules,
    done: usize,
    /// Every request before this index has left `Untouched`.
    arrival_cursor: usize,
}

impl RequestRegistry {
    pub fn new(rules: PhaseRules) -> Self {
        Self {
            requests: Vec::new(),
            rules,
            done: 0,
            arrival_cursor: 0,
        }
    }

    /// Build a registry from a trace, sorting it by arrival first.
    pub fn from_trace(rules: PhaseRules, trace: &[TraceRequest]) -> Result<Self, RegistryError> {
        let mut sorted = trace.to_vec();
        sorted.sort_by_key(|r| r.arrival_ns);
        let mut registry = Self::new(rules);
        for entry in &sorted {
            registry.admit(entry)?;
        }
        Ok(registry)
    }

    /// Register a trace request in phase `Untouched`. Requests must be
    /// admitted in non-decreasing arrival order.
    pub fn admit(&mut self, trace: &TraceRequest) -> Result<RequestId, RegistryError> {
        if trace.sequence_length == 0 {
            return Err(RegistryError::EmptySequence);
        }
        if let Some(last) = self.requests.last() {
            if trace.arrival_ns < last.arrival_time {
                return Err(RegistryError::OutOfOrder {
                    arrival: trace.arrival_ns,
                    previous: last.arrival_time,
                });
            }
        }
        let id = self.requests.len();
        self.requests.push(Request {
            id,
            sequence_length: trace.sequence_length,
            arrival_time: trace.arrival_ns,
            prefill_iteration_count: self.rules.prefill_iterations_for(trace.sequence_length),
            phase: Phase::Untouched,
            prefill_completed_count: 0,
            prefill_dispatched_count: 0,
            decode_step_count: 0,
            first_token_at: None,
            token_times: Vec::new(),
            finished_at: None,
        });
        Ok(id)
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(id)
    }

    fn get_mut(&mut self, id: RequestId) -> Result<&mut Request, RegistryError> {
        self.requests
            .get_mut(id)
            .ok_or(RegistryError::UnknownRequest(id))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn rules(&self) -> &PhaseRules {
        &self.rules
    }

    pub fn done_count(&self) -> usize {
        self.done
    }

    pub fn all_done(&self) -> bool {
        self.done == self.requests.len()
    }

    /// First untouched request that has arrived by `now`, in arrival order.
    pub fn next_arrival(&mut self, now: SimTime) -> Option<RequestId> {
        while self.arrival_cursor < self.requests.len()
            && self.requests[self.arrival_cursor].phase != Phase::Untouched
        {
            self.arrival_cursor += 1;
        }
        self.requests[self.arrival_cursor..]
            .iter()
            .take_while(|r| r.arrival_time <= now)
            .find(|r| r.phase == Phase::Untouched)
            .map(|r| r.id)
    }

    /// Move an arrived request into `Prefill` and dispatch its first chunk.
    /// Returns the chunk size in tokens.
    pub fn start_prefill(&mut self, id: RequestId) -> Result<u32, RegistryError> {
        let req = self.get_mut(id)?;
        expect_phase(req, Phase::Untouched)?;
        req.phase = Phase::Prefill;
        req.prefill_dispatched_count = 1;
        Ok(req.chunk_tokens())
    }

    /// Dispatch the next chunk of a request already in `Prefill`.
    pub fn dispatch_chunk(&mut self, id: RequestId) -> Result<u32, RegistryError> {
        let req = self.get_mut(id)?;
        expect_phase(req, Phase::Prefill)?;
        if !req.has_undispatched_chunks() {
            return Err(RegistryError::NoChunkLeft {
                id,
                total: req.prefill_iteration_count,
            });
        }
        req.prefill_dispatched_count += 1;
        Ok(req.chunk_tokens())
    }

    /// Fold in one completed prefill chunk.
    pub fn advance_prefill(
        &mut self,
        id: RequestId,
        now: SimTime,
    ) -> Result<PhaseTransition, RegistryError> {
        let req = self.get_mut(id)?;
        expect_phase(req, Phase::Prefill)?;
        if req.prefill_completed_count >= req.prefill_dispatched_count {
            return Err(RegistryError::ChunkOverrun {
                id,
                dispatched: req.prefill_dispatched_count,
            });
        }
        req.prefill_completed_count += 1;
        if req.prefill_completed_count < req.prefill_iteration_count {
            return Ok(PhaseTransition::Stayed);
        }
        req.phase = Phase::Decode;
        req.first_token_at = Some(now);
        req.token_times.push(now);
        Ok(PhaseTransition::EnteredDecode)
    }

    /// Fold in one completed decode step.
    pub fn advance_decode(
        &mut self,
        id: RequestId,
        eof: bool,
        now: SimTime,
    ) -> Result<PhaseTransition, RegistryError> {
        let cap = self.rules.decode_cap;
        let req = self.get_mut(id)?;
        expect_phase(req, Phase::Decode)?;
        req.decode_step_count += 1;
        req.token_times.push(now);
        if !eof && req.decode_step_count < cap {
            return Ok(PhaseTransition::Stayed);
        }
        req.phase = Phase::Done;
        req.finished_at = Some(now);
        self.done += 1;
        Ok(PhaseTransition::Finished)
    }

    /// Take over a request whose prefill ran in another group.
    pub fn accept_handoff(
        &mut self,
        id: RequestId,
        first_token_at: SimTime,
    ) -> Result<(), RegistryError> {
        let req = self.get_mut(id)?;
        if req.phase == Phase::Done {
            return Err(RegistryError::AlreadyDone(id));
        }
        if req.phase == Phase::Decode {
            return Err(RegistryError::WrongPhase {
                id,
                phase: req.phase,
                expected: Phase::Untouched,
            });
        }
        req.phase = Phase::Decode;
        req.prefill_dispatched_count = req.prefill_iteration_count;
        req.prefill_completed_count = req.prefill_iteration_count;
        req.first_token_at = Some(first_token_at);
        req.token_times = vec![first_token_at];
        Ok(())
    }
}

fn expect_phase(req: &Request, expected: Phase) -> Result<(), RegistryError> {
    if req.phase == Phase::Done {
        return Err(RegistryError::AlreadyDone(req.id));
    }
    if req.phase != expected {
        return Err(RegistryError::WrongPhase {
            id: req.id,
            phase: req.phase,
            expected,
        });
    }
    Ok(())
}
