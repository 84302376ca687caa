//! Ring-pipeline partitioning and worker assignment strategies.
//!
//! A group's workers are split into rings of `stages` consecutive workers.
//! Position 0 of each ring is the admission worker: it runs the batching
//! algorithm. Every later position replays, unmodified, the batch its
//! predecessor held one iteration earlier. Only the last position folds
//! results back into the registry, and its batch seeds the next carry-over
//! at position 0.
//!
//! | Strategy | Stages | Carry source | Folds results |
//! |----------|--------|--------------|---------------|
//! | [`UnifiedCore`] | 1 | itself | every worker |
//! | [`PipelinedStages`] | N | last stage of the ring | last stage only |

use pdsim_grid::{Placement, WorkerId};
use std::ops::Range;

/// Static mapping of a group's workers onto ring positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStageMap {
    workers: Range<WorkerId>,
    stages: usize,
}

impl PipelineStageMap {
    /// `workers.len()` must be a non-zero multiple of `stages`.
    pub fn new(workers: Range<WorkerId>, stages: usize) -> Self {
        Self {
            workers,
            stages: stages.max(1),
        }
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn rings(&self) -> usize {
        self.workers.len() / self.stages
    }

    fn local(&self, worker: WorkerId) -> usize {
        worker - self.workers.start
    }

    pub fn ring_of(&self, worker: WorkerId) -> usize {
        self.local(worker) / self.stages
    }

    pub fn position_of(&self, worker: WorkerId) -> usize {
        self.local(worker) % self.stages
    }

    /// The worker at `position` of `ring`.
    pub fn worker_at(&self, ring: usize, position: usize) -> WorkerId {
        self.workers.start + ring * self.stages + position
    }

    pub fn is_admission(&self, worker: WorkerId) -> bool {
        self.position_of(worker) == 0
    }

    pub fn is_last(&self, worker: WorkerId) -> bool {
        self.position_of(worker) == self.stages - 1
    }

    /// Predecessor inside the ring; `None` for admission workers.
    pub fn previous(&self, worker: WorkerId) -> Option<WorkerId> {
        let pos = self.position_of(worker);
        (pos > 0).then(|| worker - 1)
    }

    /// Successor inside the ring; `None` for the last stage.
    pub fn next(&self, worker: WorkerId) -> Option<WorkerId> {
        (!self.is_last(worker)).then(|| worker + 1)
    }

    pub fn last_of_ring(&self, worker: WorkerId) -> WorkerId {
        self.worker_at(self.ring_of(worker), self.stages - 1)
    }

    /// Admission workers in worker order.
    pub fn admission_workers(&self) -> Vec<WorkerId> {
        (0..self.rings()).map(|r| self.worker_at(r, 0)).collect()
    }

    pub fn placement(&self, worker: WorkerId) -> Placement {
        Placement {
            ring_position: self.position_of(worker),
            ring_length: self.stages,
            previous: self.previous(worker),
            next: self.next(worker),
        }
    }
}

/// Decides which workers admit work and where their inputs come from.
pub trait AssignmentStrategy: Send {
    fn name(&self) -> &str;

    fn stage_map(&self) -> &PipelineStageMap;

    /// Worker whose previous batch seeds `admission`'s carry-over.
    fn carry_source(&self, admission: WorkerId) -> WorkerId;

    /// Worker whose previous batch a non-admission worker replays.
    fn copy_source(&self, worker: WorkerId) -> Option<WorkerId>;

    /// Whether DONE results from `worker` are folded into the registry.
    fn folds_results(&self, worker: WorkerId) -> bool;
}

/// Every worker is its own single-stage ring.
#[derive(Debug, Clone)]
pub struct UnifiedCore {
    map: PipelineStageMap,
}

impl UnifiedCore {
    pub fn new(workers: Range<WorkerId>) -> Self {
        Self {
            map: PipelineStageMap::new(workers, 1),
        }
    }
}

impl AssignmentStrategy for UnifiedCore {
    fn name(&self) -> &str {
        "unified"
    }

    fn stage_map(&self) -> &PipelineStageMap {
        &self.map
    }

    fn carry_source(&self, admission: WorkerId) -> WorkerId {
        admission
    }

    fn copy_source(&self, _worker: WorkerId) -> Option<WorkerId> {
        None
    }

    fn folds_results(&self, _worker: WorkerId) -> bool {
        true
    }
}

/// Workers form rings of a fixed number of stages.
#[derive(Debug, Clone)]
pub struct PipelinedStages {
    map: PipelineStageMap,
}

impl PipelinedStages {
    pub fn new(workers: Range<WorkerId>, stages: usize) -> Self {
        Self {
            map: PipelineStageMap::new(workers, stages),
        }
    }
}

impl AssignmentStrategy for PipelinedStages {
    fn name(&self) -> &str {
        "pipelined"
    }

    fn stage_map(&self) -> &PipelineStageMap {
        &self.map
    }

    fn carry_source(&self, admission: WorkerId) -> WorkerId {
        self.map.last_of_ring(admission)
    }

    fn copy_source(&self, worker: WorkerId) -> Option<WorkerId> {
        self.map.previous(worker)
    }

    fn folds_results(&self, worker: WorkerId) -> bool {
        self.map.is_last(worker)
    }
}

/// Create an assignment strategy by name.
pub fn strategy_by_name(
    name: &str,
    workers: Range<WorkerId>,
    stages: usize,
) -> Option<Box<dyn AssignmentStrategy>> {
    match name {
        "unified" => Some(Box::new(UnifiedCore::new(workers))),
        "pipelined" => Some(Box::new(PipelinedStages::new(workers, stages))),
        _ => None,
    }
}

/// List all available strategy names.
pub fn available_strategies() -> Vec<&'static str> {
    vec!["unified", "pipelined"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_layout() {
        let map = PipelineStageMap::new(10..16, 3);
        assert_eq!(map.rings(), 2);
        assert_eq!(map.admission_workers(), vec![10, 13]);
        assert_eq!(map.ring_of(14), 1);
        assert_eq!(map.position_of(14), 1);
        assert_eq!(map.previous(14), Some(13));
        assert_eq!(map.previous(13), None);
        assert_eq!(map.next(14), Some(15));
        assert_eq!(map.next(15), None);
        assert_eq!(map.last_of_ring(13), 15);
        assert!(map.is_last(12));
        assert!(!map.is_last(11));
    }

    #[test]
    fn test_placement() {
        let map = PipelineStageMap::new(0..4, 4);
        let p = map.placement(2);
        assert_eq!(p.ring_position, 2);
        assert_eq!(p.ring_length, 4);
        assert_eq!(p.previous, Some(1));
        assert_eq!(p.next, Some(3));
        assert!(map.placement(0).admits());
    }

    #[test]
    fn test_unified_strategy() {
        let s = UnifiedCore::new(0..3);
        assert_eq!(s.stage_map().admission_workers(), vec![0, 1, 2]);
        assert_eq!(s.carry_source(1), 1);
        assert_eq!(s.copy_source(1), None);
        assert!(s.folds_results(2));
    }

    #[test]
    fn test_pipelined_strategy() {
        let s = PipelinedStages::new(0..6, 3);
        assert_eq!(s.stage_map().admission_workers(), vec![0, 3]);
        assert_eq!(s.carry_source(3), 5);
        assert_eq!(s.copy_source(4), Some(3));
        assert!(s.folds_results(2));
        assert!(!s.folds_results(1));
    }

    #[test]
    fn test_strategy_by_name() {
        for name in available_strategies() {
            let s = strategy_by_name(name, 0..4, 2)
                .unwrap_or_else(|| panic!("Missing: {}", name));
            assert_eq!(s.name(), name);
        }
        assert!(strategy_by_name("nonexistent", 0..4, 1).is_none());
    }
}
