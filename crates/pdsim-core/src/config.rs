//! TOML configuration parsing for PDSim.
//!
//! Defines the configuration schema for a run: scheduler policy, model
//! shape, grid partitioning and timing, and the trace source.

use crate::pipeline::available_strategies;
use crate::worker::GroupKind;
use pdsim_grid::{available_generators, GridTiming, ModelShape, WorkerId};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub grid: GridSection,
    #[serde(default)]
    pub trace: TraceSection,
}

/// General simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Human-readable name for this simulation.
    #[serde(default = "default_sim_name")]
    pub name: String,
    /// Seed for EOF sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_sim_name() -> String {
    "simulation".to_string()
}

fn default_seed() -> u64 {
    42
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            seed: default_seed(),
        }
    }
}

/// How the groups are laid out over the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// One group does both phases.
    #[default]
    Single,
    /// Disaggregated prefill and decode groups.
    Dual,
}

/// Batching policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Worker assignment strategy: "unified" or "pipelined".
    #[serde(default = "default_assignment")]
    pub assignment: String,
    #[serde(default)]
    pub concurrency: ConcurrencyMode,
    /// Credit units each admission worker may commit per iteration.
    #[serde(default = "default_core_credit")]
    pub core_credit: u32,
    /// Credit cost of a prefill chunk relative to a decode step.
    #[serde(default = "default_pd_ratio")]
    pub pd_ratio: u32,
    /// Decode length cap is `ceil(decode_cap_factor / eof_chance)` steps.
    #[serde(default = "default_decode_cap_factor")]
    pub decode_cap_factor: f64,
}

fn default_assignment() -> String {
    "unified".to_string()
}
fn default_core_credit() -> u32 {
    4
}
fn default_pd_ratio() -> u32 {
    4
}
fn default_decode_cap_factor() -> f64 {
    1.5
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            assignment: default_assignment(),
            concurrency: ConcurrencyMode::default(),
            core_credit: default_core_credit(),
            pd_ratio: default_pd_ratio(),
            decode_cap_factor: default_decode_cap_factor(),
        }
    }
}

/// Model shape and workload constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_heads")]
    pub attention_heads: u32,
    #[serde(default = "default_head_size")]
    pub head_size: u32,
    #[serde(default = "default_heads")]
    pub kv_heads: u32,
    /// Token-heads one prefill chunk may carry.
    #[serde(default = "default_max_prefill_workload")]
    pub max_prefill_workload: u32,
    /// Per-step probability that a decoding request emits EOF.
    #[serde(default = "default_eof_chance")]
    pub eof_chance: f64,
    /// Fixed chunk count for every request, overriding the workload rule.
    #[serde(default)]
    pub prefill_iterations: Option<u32>,
}

fn default_heads() -> u32 {
    8
}
fn default_head_size() -> u32 {
    64
}
fn default_max_prefill_workload() -> u32 {
    384
}
fn default_eof_chance() -> f64 {
    0.1
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            attention_heads: default_heads(),
            head_size: default_head_size(),
            kv_heads: default_heads(),
            max_prefill_workload: default_max_prefill_workload(),
            eof_chance: default_eof_chance(),
            prefill_iterations: None,
        }
    }
}

impl ModelSection {
    pub fn shape(&self) -> ModelShape {
        ModelShape {
            attention_heads: self.attention_heads,
            head_size: self.head_size,
            kv_heads: self.kv_heads,
        }
    }
}

/// Grid partitioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSection {
    /// Workers of the single group.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Ring length of the single group.
    #[serde(default = "default_stages")]
    pub stages: usize,
    /// Dual mode: prefill group size.
    #[serde(default)]
    pub prefill_workers: usize,
    /// Dual mode: decode group size.
    #[serde(default)]
    pub decode_workers: usize,
    #[serde(default = "default_stages")]
    pub prefill_stages: usize,
    #[serde(default = "default_stages")]
    pub decode_stages: usize,
    /// Physical cores behind every scheduled worker. All cores of a
    /// tensor-parallel worker run the same batch.
    #[serde(default = "default_tp_size")]
    pub tp_size: usize,
    /// Instruction generator name.
    #[serde(default = "default_generator")]
    pub generator: String,
    #[serde(default)]
    pub timing: TimingSection,
}

fn default_workers() -> usize {
    4
}
fn default_stages() -> usize {
    1
}
fn default_tp_size() -> usize {
    1
}
fn default_generator() -> String {
    "template".to_string()
}

impl Default for GridSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            stages: default_stages(),
            prefill_workers: 0,
            decode_workers: 0,
            prefill_stages: default_stages(),
            decode_stages: default_stages(),
            tp_size: default_tp_size(),
            generator: default_generator(),
            timing: TimingSection::default(),
        }
    }
}

/// Simulated grid timing, nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSection {
    #[serde(default = "default_link_latency")]
    pub link_latency_ns: u64,
    #[serde(default = "default_instruction_ns")]
    pub instruction_ns: u64,
    #[serde(default = "default_bytes_per_ns")]
    pub bytes_per_ns: u64,
    #[serde(default = "default_prefill_token_ns")]
    pub prefill_token_ns: u64,
    #[serde(default = "default_decode_token_ns")]
    pub decode_token_ns: u64,
    #[serde(default = "default_iteration_overhead")]
    pub iteration_overhead_ns: u64,
}

fn default_link_latency() -> u64 {
    200
}
fn default_instruction_ns() -> u64 {
    5
}
fn default_bytes_per_ns() -> u64 {
    64
}
fn default_prefill_token_ns() -> u64 {
    40
}
fn default_decode_token_ns() -> u64 {
    300
}
fn default_iteration_overhead() -> u64 {
    1_000
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            link_latency_ns: default_link_latency(),
            instruction_ns: default_instruction_ns(),
            bytes_per_ns: default_bytes_per_ns(),
            prefill_token_ns: default_prefill_token_ns(),
            decode_token_ns: default_decode_token_ns(),
            iteration_overhead_ns: default_iteration_overhead(),
        }
    }
}

impl From<TimingSection> for GridTiming {
    fn from(s: TimingSection) -> Self {
        GridTiming {
            link_latency_ns: s.link_latency_ns,
            instruction_ns: s.instruction_ns,
            bytes_per_ns: s.bytes_per_ns,
            prefill_token_ns: s.prefill_token_ns,
            decode_token_ns: s.decode_token_ns,
            iteration_overhead_ns: s.iteration_overhead_ns,
        }
    }
}

/// Trace source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSection {
    /// Format: "compact_jsonl" or "requests_json".
    #[serde(default = "default_trace_format")]
    pub format: String,
    /// Path to the trace file.
    pub path: Option<String>,
}

fn default_trace_format() -> String {
    "compact_jsonl".to_string()
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            format: default_trace_format(),
            path: None,
        }
    }
}

/// One phase-group's share of the grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLayout {
    pub kind: GroupKind,
    pub workers: Range<WorkerId>,
    pub stages: usize,
    pub tp_size: usize,
}

impl GroupLayout {
    /// Physical core ids behind this group's workers. Worker `w` owns cores
    /// `w * tp_size .. (w + 1) * tp_size`.
    pub fn cores(&self) -> Range<WorkerId> {
        self.workers.start * self.tp_size..self.workers.end * self.tp_size
    }
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sched = &self.scheduler;
        if sched.pd_ratio <= 1 {
            return Err(ConfigError::Validation(format!(
                "pd_ratio must be > 1, got {}",
                sched.pd_ratio
            )));
        }
        if sched.core_credit < sched.pd_ratio {
            return Err(ConfigError::Validation(format!(
                "core_credit ({}) must be >= pd_ratio ({}) or no prefill can ever be admitted",
                sched.core_credit, sched.pd_ratio
            )));
        }
        if sched.decode_cap_factor.is_nan() || sched.decode_cap_factor <= 0.0 {
            return Err(ConfigError::Validation(
                "decode_cap_factor must be > 0".to_string(),
            ));
        }
        if !available_strategies().contains(&sched.assignment.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Unknown assignment '{}'. Available: {:?}",
                sched.assignment,
                available_strategies()
            )));
        }

        let model = &self.model;
        if model.eof_chance.is_nan() || model.eof_chance <= 0.0 || model.eof_chance > 1.0 {
            return Err(ConfigError::Validation(format!(
                "eof_chance must lie in (0, 1], got {}",
                model.eof_chance
            )));
        }
        if model.attention_heads == 0 || model.head_size == 0 || model.kv_heads == 0 {
            return Err(ConfigError::Validation(
                "attention_heads, head_size and kv_heads must be > 0".to_string(),
            ));
        }
        if model.max_prefill_workload == 0 {
            return Err(ConfigError::Validation(
                "max_prefill_workload must be > 0".to_string(),
            ));
        }
        if model.prefill_iterations == Some(0) {
            return Err(ConfigError::Validation(
                "prefill_iterations must be > 0 when set".to_string(),
            ));
        }

        if !available_generators().contains(&self.grid.generator.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Unknown generator '{}'. Available: {:?}",
                self.grid.generator,
                available_generators()
            )));
        }
        if self.grid.tp_size == 0 {
            return Err(ConfigError::Validation("tp_size must be > 0".to_string()));
        }
        if self.grid.timing.bytes_per_ns == 0 {
            return Err(ConfigError::Validation(
                "bytes_per_ns must be > 0".to_string(),
            ));
        }

        for layout in self.group_layouts() {
            let count = layout.workers.len();
            if count == 0 {
                return Err(ConfigError::Validation(format!(
                    "{:?} group has no workers",
                    layout.kind
                )));
            }
            if layout.stages == 0 || count % layout.stages != 0 {
                return Err(ConfigError::Validation(format!(
                    "{:?} group: {} workers cannot be split into rings of {} stages",
                    layout.kind, count, layout.stages
                )));
            }
            if layout.stages > 1 && sched.assignment != "pipelined" {
                return Err(ConfigError::Validation(format!(
                    "{:?} group has {} stages but assignment is '{}'; use 'pipelined'",
                    layout.kind, layout.stages, sched.assignment
                )));
            }
        }
        Ok(())
    }

    /// Partition the grid into phase-groups. Worker ids are global and
    /// contiguous: in dual mode the prefill group comes first.
    pub fn group_layouts(&self) -> Vec<GroupLayout> {
        match self.scheduler.concurrency {
            ConcurrencyMode::Single => vec![GroupLayout {
                kind: GroupKind::Unified,
                workers: 0..self.grid.workers,
                stages: self.grid.stages,
                tp_size: self.grid.tp_size,
            }],
            ConcurrencyMode::Dual => {
                let p = self.grid.prefill_workers;
                let d = self.grid.decode_workers;
                vec![
                    GroupLayout {
                        kind: GroupKind::Prefill,
                        workers: 0..p,
                        stages: self.grid.prefill_stages,
                        tp_size: self.grid.tp_size,
                    },
                    GroupLayout {
                        kind: GroupKind::Decode,
                        workers: p..p + d,
                        stages: self.grid.decode_stages,
                        tp_size: self.grid.tp_size,
                    },
                ]
            }
        }
    }

    /// Maximum decode steps before a request is forced to finish.
    pub fn decode_cap(&self) -> u32 {
        let cap = (self.scheduler.decode_cap_factor / self.model.eof_chance).ceil();
        (cap as u32).max(1)
    }
}
