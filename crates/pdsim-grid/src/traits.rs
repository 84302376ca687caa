//! Collaborator trait definitions.
//!
//! The scheduler never talks to worker cores directly. It hands each worker's
//! batch to an [`InstructionGenerator`] and pushes the resulting stream
//! through a [`Transport`], which answers with timed [`WorkerEvent`]s.

use crate::instructions::InstructionStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Global index of a worker core on the grid.
pub type WorkerId = usize;

/// Simulated time in nanoseconds.
pub type SimTime = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("Refusing to generate instructions for an empty batch on worker {0}")]
    EmptyBatch(WorkerId),
    #[error("Worker {0} was released without a delivered instruction stream")]
    NoStream(WorkerId),
    #[error("Worker {worker} already holds an undelivered stream for iteration")]
    StreamInFlight { worker: WorkerId },
}

/// Work kind of a batch entry, as seen by the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Prefill,
    Decode,
}

/// One request's share of a worker's batch for a single iteration.
///
/// This is the grid's view of a scheduler stage: it carries only what the
/// instruction templates need to size their operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub request_id: usize,
    pub kind: EntryKind,
    pub tokens: u32,
}

impl BatchEntry {
    pub fn prefill(request_id: usize, tokens: u32) -> Self {
        Self {
            request_id,
            kind: EntryKind::Prefill,
            tokens,
        }
    }

    pub fn decode(request_id: usize) -> Self {
        Self {
            request_id,
            kind: EntryKind::Decode,
            tokens: 1,
        }
    }
}

/// Where a worker sits in its ring pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Zero-based position inside the ring; position 0 admits work.
    pub ring_position: usize,
    /// Number of stages in the ring.
    pub ring_length: usize,
    /// Worker feeding this one, if any.
    pub previous: Option<WorkerId>,
    /// Worker this one forwards activations to, if any.
    pub next: Option<WorkerId>,
}

impl Placement {
    /// Placement of a worker that forms a ring on its own.
    pub fn standalone() -> Self {
        Self {
            ring_position: 0,
            ring_length: 1,
            previous: None,
            next: None,
        }
    }

    pub fn admits(&self) -> bool {
        self.ring_position == 0
    }
}

/// Model dimensions the instruction templates are sized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub attention_heads: u32,
    pub head_size: u32,
    pub kv_heads: u32,
}

impl ModelShape {
    /// Hidden width: heads x head size.
    pub fn hidden(&self) -> u64 {
        self.attention_heads as u64 * self.head_size as u64
    }

    /// Bytes of fp32 activations for `tokens` tokens.
    pub fn activation_bytes(&self, tokens: u64) -> u64 {
        tokens * self.hidden() * 4
    }
}

/// Builds the per-worker instruction stream for one iteration.
///
/// Implementations must be deterministic: the same inputs always produce the
/// same stream.
pub trait InstructionGenerator: Send {
    /// Human-readable generator name.
    fn name(&self) -> &str;

    /// Produce the stream for `worker` executing `batch`.
    fn generate(
        &self,
        worker: WorkerId,
        batch: &[BatchEntry],
        placement: &Placement,
        shape: &ModelShape,
    ) -> Result<InstructionStream, GridError>;
}

/// Signal raised by a worker core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker received and parsed its instruction stream.
    Ack { worker: WorkerId },
    /// The worker finished its iteration. `eof` carries one bit per batch
    /// entry, set when that entry emitted an end-of-sequence token.
    Done { worker: WorkerId, eof: Vec<bool> },
}

impl WorkerEvent {
    pub fn worker(&self) -> WorkerId {
        match self {
            WorkerEvent::Ack { worker } | WorkerEvent::Done { worker, .. } => *worker,
        }
    }
}

/// A worker event together with the simulated time it fires at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduled {
    pub at: SimTime,
    pub event: WorkerEvent,
}

/// Moves instruction streams and start data to workers and reports back.
pub trait Transport: Send {
    /// Deliver a stream; returns the resulting ACK.
    fn deliver(
        &mut self,
        now: SimTime,
        worker: WorkerId,
        stream: InstructionStream,
    ) -> Result<Vec<Scheduled>, GridError>;

    /// Push the input activations of an admission worker. Returns the time
    /// the payload has fully landed.
    fn deliver_start_data(&mut self, now: SimTime, worker: WorkerId, payload_bytes: u64)
        -> SimTime;

    /// Signal the worker to begin executing; returns the resulting DONE.
    fn release(&mut self, now: SimTime, worker: WorkerId) -> Result<Vec<Scheduled>, GridError>;
}
