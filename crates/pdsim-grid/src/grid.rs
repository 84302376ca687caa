//! Simulated worker grid.
//!
//! A deliberately simple stand-in for the NoC and the compute cores: fixed
//! link latency, a bandwidth term for start data, and a linear per-token
//! compute cost. End-of-sequence tokens are drawn from a seeded
//! [`ChaCha8Rng`] so runs replay exactly.

use crate::instructions::InstructionStream;
use crate::traits::{EntryKind, GridError, Scheduled, SimTime, Transport, WorkerEvent, WorkerId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// Timing constants of the simulated grid, all in nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridTiming {
    /// One-way latency of any message between scheduler and worker.
    pub link_latency_ns: u64,
    /// Parse cost per delivered instruction.
    pub instruction_ns: u64,
    /// Start-data throughput.
    pub bytes_per_ns: u64,
    /// Compute cost per prefill token.
    pub prefill_token_ns: u64,
    /// Compute cost per decoding request.
    pub decode_token_ns: u64,
    /// Fixed cost of running an iteration at all.
    pub iteration_overhead_ns: u64,
}

impl Default for GridTiming {
    fn default() -> Self {
        Self {
            link_latency_ns: 200,
            instruction_ns: 5,
            bytes_per_ns: 64,
            prefill_token_ns: 40,
            decode_token_ns: 300,
            iteration_overhead_ns: 1_000,
        }
    }
}

#[derive(Debug)]
struct WorkerState {
    stream: Option<InstructionStream>,
    data_ready_at: SimTime,
}

/// Linear-cost grid model implementing [`Transport`].
pub struct SimulatedGrid {
    timing: GridTiming,
    eof_chance: f64,
    rng: ChaCha8Rng,
    workers: HashMap<WorkerId, WorkerState>,
    /// Total streams delivered.
    pub streams_delivered: u64,
    /// Total start-data bytes pushed.
    pub start_bytes_delivered: u64,
}

impl SimulatedGrid {
    /// `eof_chance` must lie in (0, 1].
    pub fn new(timing: GridTiming, eof_chance: f64, seed: u64) -> Self {
        Self {
            timing,
            eof_chance: eof_chance.clamp(0.0, 1.0),
            rng: ChaCha8Rng::seed_from_u64(seed),
            workers: HashMap::new(),
            streams_delivered: 0,
            start_bytes_delivered: 0,
        }
    }

    /// Execution time of a stream once its inputs are present.
    pub fn compute_ns(&self, stream: &InstructionStream) -> u64 {
        let per_entry: u64 = stream
            .batch()
            .iter()
            .map(|e| match e.kind {
                EntryKind::Prefill => e.tokens as u64 * self.timing.prefill_token_ns,
                EntryKind::Decode => self.timing.decode_token_ns,
            })
            .sum();
        self.timing.iteration_overhead_ns + per_entry
    }

    fn worker(&mut self, worker: WorkerId) -> &mut WorkerState {
        self.workers.entry(worker).or_insert(WorkerState {
            stream: None,
            data_ready_at: 0,
        })
    }
}

impl Transport for SimulatedGrid {
    fn deliver(
        &mut self,
        now: SimTime,
        worker: WorkerId,
        stream: InstructionStream,
    ) -> Result<Vec<Scheduled>, GridError> {
        let parse_ns = stream.len() as u64 * self.timing.instruction_ns;
        let link = self.timing.link_latency_ns;
        let state = self.worker(worker);
        if state.stream.is_some() {
            return Err(GridError::StreamInFlight { worker });
        }
        state.stream = Some(stream);
        self.streams_delivered += 1;

        // Stream travels out, gets parsed, the ACK travels back.
        let at = now + 2 * link + parse_ns;
        trace!(worker, at, "stream delivered");
        Ok(vec![Scheduled {
            at,
            event: WorkerEvent::Ack { worker },
        }])
    }

    fn deliver_start_data(&mut self, now: SimTime, worker: WorkerId, payload_bytes: u64) -> SimTime {
        let bw = self.timing.bytes_per_ns.max(1);
        let landed = now + self.timing.link_latency_ns + payload_bytes.div_ceil(bw);
        self.start_bytes_delivered += payload_bytes;
        let state = self.worker(worker);
        state.data_ready_at = state.data_ready_at.max(landed);
        landed
    }

    fn release(&mut self, now: SimTime, worker: WorkerId) -> Result<Vec<Scheduled>, GridError> {
        let link = self.timing.link_latency_ns;
        let state = self.worker(worker);
        let stream = state.stream.take().ok_or(GridError::NoStream(worker))?;
        let start = (now + link).max(state.data_ready_at);

        let compute = self.compute_ns(&stream);
        let eof: Vec<bool> = stream
            .batch()
            .iter()
            .map(|e| e.kind == EntryKind::Decode && self.rng.gen_bool(self.eof_chance))
            .collect();

        let at = start + compute + link;
        trace!(worker, at, entries = eof.len(), "worker released");
        Ok(vec![Scheduled {
            at,
            event: WorkerEvent::Done { worker, eof },
        }])
    }
}
