/// Integration tests for the batch scheduler, driven through the public API
/// without the engine.
use pdsim_core::config::SimConfig;
use pdsim_core::request::{Phase, PhaseRules, RequestRegistry, TraceRequest};
use pdsim_core::scheduler::{BatchScheduler, PassOutcome, SchedulerState};
use pdsim_core::worker::Stage;
use pdsim_grid::{generator_by_name, WorkerId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

struct Driver {
    scheduler: BatchScheduler,
    state: SchedulerState,
    registry: RequestRegistry,
    now: u64,
}

impl Driver {
    fn new(toml: &str, trace: &[TraceRequest]) -> Self {
        Self::for_group(toml, trace, 0)
    }

    /// Drive the `index`-th group of the layout.
    fn for_group(toml: &str, trace: &[TraceRequest], index: usize) -> Self {
        let config = SimConfig::from_str(toml).unwrap();
        let layout = config.group_layouts().remove(index);
        Self {
            scheduler: BatchScheduler::new(
                generator_by_name(&config.grid.generator).unwrap(),
                config.model.shape(),
            ),
            state: SchedulerState::from_layout(&layout, &config).unwrap(),
            registry: RequestRegistry::from_trace(PhaseRules::from_config(&config), trace)
                .unwrap(),
            now: 0,
        }
    }

    fn pass(&mut self) -> PassOutcome {
        self.now += 10;
        self.scheduler
            .schedule(&mut self.state, &mut self.registry, self.now)
            .unwrap()
    }

    /// Fold every busy worker with EOF bits chosen by `eof`.
    fn complete(&mut self, mut eof: impl FnMut() -> bool) {
        self.now += 5;
        let busy: Vec<WorkerId> = self
            .state
            .slots
            .iter()
            .filter(|s| s.busy)
            .map(|s| s.id)
            .collect();
        for w in busy {
            let bits: Vec<bool> = self.state.slots.batch(w).iter().map(|_| eof()).collect();
            self.state
                .fold(w, &bits, &mut self.registry, self.now)
                .unwrap();
            self.state.slots.set_busy(w, false);
        }
    }

    fn batch(&self, w: WorkerId) -> Vec<Stage> {
        self.state.slots.batch(w).to_vec()
    }

    fn phases(&self) -> Vec<Phase> {
        self.registry.iter().map(|r| r.phase).collect()
    }
}

#[test]
fn test_full_credit_single_chunk_prefill() {
    let mut d = Driver::new(
        "[scheduler]\ncore_credit = 4\npd_ratio = 4\n[grid]\nworkers = 1\n",
        &[TraceRequest::new(0, 40)],
    );
    assert!(matches!(d.pass(), PassOutcome::Dispatched(_)));
    assert_eq!(d.batch(0), vec![Stage::prefill(0, 40)]);
    d.complete(|| false);
    assert_eq!(d.registry.get(0).unwrap().phase, Phase::Decode);
    assert_eq!(d.batch(0), vec![Stage::decode(0)]);
}

#[test]
fn test_second_prefill_waits_for_decode_credit() {
    // The carried decode costs 1 of 2 credits, leaving too little for a prefill.
    let mut d = Driver::new(
        "[scheduler]\ncore_credit = 2\npd_ratio = 2\n[model]\neof_chance = 1.0\n[grid]\nworkers = 1\n",
        &[TraceRequest::new(0, 8), TraceRequest::new(0, 8)],
    );
    d.pass();
    assert_eq!(d.batch(0), vec![Stage::prefill(0, 8)]);
    d.complete(|| true);
    d.pass();
    assert_eq!(d.batch(0), vec![Stage::decode(0)]);
    d.complete(|| true);
    d.pass();
    assert_eq!(d.batch(0), vec![Stage::prefill(1, 8)]);
}

#[test]
fn test_three_chunk_prefill_resumes_first() {
    let mut d = Driver::new(
        "[model]\nprefill_iterations = 3\n[grid]\nworkers = 1\n",
        &[TraceRequest::new(0, 12), TraceRequest::new(0, 12)],
    );
    d.pass();
    d.complete(|| false);
    d.pass();
    d.complete(|| false);
    assert_eq!(d.state.unfinished_prefill(0), vec![0]);
    d.pass();
    assert_eq!(d.batch(0), vec![Stage::prefill(0, 4)]);
    assert_eq!(d.registry.get(1).unwrap().phase, Phase::Untouched);
}

#[test]
fn test_three_stage_ring_replays_unmodified() {
    let mut d = Driver::new(
        "[scheduler]\nassignment = \"pipelined\"\n[grid]\nworkers = 3\nstages = 3\n",
        &[TraceRequest::new(0, 8), TraceRequest::new(0, 16)],
    );
    d.pass();
    let stage1 = d.batch(0);
    assert_eq!(stage1, vec![Stage::prefill(0, 8)]);
    d.complete(|| false);

    d.pass();
    assert_eq!(d.batch(1), stage1);
    let stage1_next = d.batch(0);
    d.complete(|| false);

    d.pass();
    assert_eq!(d.batch(2), stage1);
    assert_eq!(d.batch(1), stage1_next);
}

#[test]
fn test_three_stage_decode_ring_replays_unmodified() {
    let toml = r#"
[scheduler]
assignment = "pipelined"
concurrency = "dual"
[grid]
prefill_workers = 1
decode_workers = 3
decode_stages = 3
"#;
    let mut d = Driver::for_group(toml, &[TraceRequest::new(0, 8)], 1);
    d.registry.accept_handoff(0, 0).unwrap();
    d.state.push_ready(0);

    // decode workers are 1..4: stage 1 admits, stages 2 and 3 replay
    d.pass();
    let stage1 = d.batch(1);
    assert_eq!(stage1, vec![Stage::decode(0)]);
    d.complete(|| false);

    d.pass();
    assert!(d.batch(1).is_empty());
    assert_eq!(d.batch(2), stage1);
    d.complete(|| false);

    d.pass();
    assert_eq!(d.batch(3), stage1);
    assert_eq!(d.registry.get(0).unwrap().decode_step_count, 0);
    d.complete(|| false);
    assert_eq!(d.registry.get(0).unwrap().decode_step_count, 1);
}

#[test]
fn test_invariants_hold_under_random_eof() {
    let toml = r#"
[scheduler]
core_credit = 6
pd_ratio = 3
[model]
eof_chance = 0.25
max_prefill_workload = 128
[grid]
workers = 3
"#;
    let trace: Vec<_> = (0..30)
        .map(|i| TraceRequest::new(i * 7, [4, 16, 40, 64][i as usize % 4]))
        .collect();
    let mut d = Driver::new(toml, &trace);
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let mut last = d.phases();

    for _ in 0..2_000 {
        if d.registry.all_done() {
            break;
        }
        if let PassOutcome::Dispatched(dispatches) = d.pass() {
            let ledger = *d.state.ledger();
            let mut seen = std::collections::HashSet::new();
            for dispatch in &dispatches {
                let batch = d.batch(dispatch.worker);
                let used: u32 = batch.iter().map(|s| ledger.cost(s.phase)).sum();
                assert!(used <= ledger.core_credit);
                for s in batch {
                    assert!(seen.insert(s.request_id));
                }
            }
            d.complete(|| rng.gen_bool(0.25));
        }
        let now = d.phases();
        for (before, after) in last.iter().zip(&now) {
            assert!(after >= before, "phase regressed from {:?} to {:?}", before, after);
        }
        last = now;
    }
    assert!(d.registry.all_done());
}
