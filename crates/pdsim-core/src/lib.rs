//! PDSim: continuous-batching prefill/decode scheduler for a simulated
//! accelerator grid.
//!
//! Requests from a trace are split into prefill chunks and decode steps and
//! packed every iteration into per-worker batches under a credit budget.
//! Each phase-group runs as its own actor, paced by an ACK/DONE barrier.
//! Primitive generation and transport come from `pdsim-grid`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────┐     ┌──────────────┐
//! │  Trace   │────▶│  Engine   │────▶│   RunReport  │
//! │ Ingestion│     │ (Events)  │     │              │
//! └──────────┘     └─────┬─────┘     └──────────────┘
//!                        │ mpsc / oneshot
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//!   ┌──────────────┐  handoff   ┌──────────────┐
//!   │ Prefill or   │───────────▶│ Decode group │
//!   │ Unified group│            │ (dual mode)  │
//!   └──────┬───────┘            └──────┬───────┘
//!          │ BatchScheduler            │
//!          │ IterationBarrier          │
//!          ▼                           ▼
//!   ┌──────────────────────────────────────────┐
//!   │      Transport + InstructionGenerator    │
//!   │     (ring stages of worker cores)        │
//!   └──────────────────────────────────────────┘
//! ```

pub mod barrier;
pub mod clock;
pub mod config;
pub mod credit;
pub mod engine;
pub mod group;
pub mod metrics;
pub mod pipeline;
pub mod request;
pub mod scheduler;
pub mod trace;
pub mod worker;

// Re-export key types for convenience.
pub use barrier::{BarrierError, BarrierState, IterationBarrier};
pub use clock::SimClock;
pub use config::{ConcurrencyMode, ConfigError, SimConfig};
pub use credit::CreditLedger;
pub use engine::{SimError, SimEvent, SimulationEngine};
pub use group::{Group, GroupHandle};
pub use metrics::{format_table, RequestRecord, RunReport};
pub use pipeline::{AssignmentStrategy, PipelineStageMap, PipelinedStages, UnifiedCore};
pub use request::{Phase, RequestId, RequestRegistry, TraceRequest};
pub use scheduler::{BatchScheduler, SchedulerState};
pub use trace::{load_trace, SyntheticTrace};
pub use worker::{GroupKind, Stage, WorkerRole, WorkerSlotTable};

/// Run a complete simulation. Must be awaited inside a tokio runtime.
pub async fn run_simulation(
    config: SimConfig,
    requests: Vec<TraceRequest>,
) -> Result<RunReport, SimError> {
    SimulationEngine::new(config, requests)?.run().await
}

/// Run a complete simulation on a fresh single-threaded runtime.
pub fn run_simulation_blocking(
    config: SimConfig,
    requests: Vec<TraceRequest>,
) -> Result<RunReport, SimError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_simulation(config, requests))
}
