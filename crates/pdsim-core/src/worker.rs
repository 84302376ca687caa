//! Worker slots and their per-iteration batches.

use crate::request::{Phase, RequestId};
use pdsim_grid::{BatchEntry, WorkerId};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Which phases a group serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    Unified,
    Prefill,
    Decode,
}

impl GroupKind {
    pub fn role(&self) -> WorkerRole {
        match self {
            GroupKind::Unified => WorkerRole::Unified,
            GroupKind::Prefill => WorkerRole::PrefillOnly,
            GroupKind::Decode => WorkerRole::DecodeOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRole {
    PrefillOnly,
    DecodeOnly,
    Unified,
}

impl WorkerRole {
    pub fn prefills(&self) -> bool {
        !matches!(self, WorkerRole::DecodeOnly)
    }

    pub fn decodes(&self) -> bool {
        !matches!(self, WorkerRole::PrefillOnly)
    }
}

/// One request's slice of a worker's batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub request_id: RequestId,
    pub phase: Phase,
    pub token_count: u32,
}

impl Stage {
    pub fn prefill(request_id: RequestId, token_count: u32) -> Self {
        Self {
            request_id,
            phase: Phase::Prefill,
            token_count,
        }
    }

    pub fn decode(request_id: RequestId) -> Self {
        Self {
            request_id,
            phase: Phase::Decode,
            token_count: 1,
        }
    }

    /// The grid's view of this stage.
    pub fn to_entry(&self) -> BatchEntry {
        match self.phase {
            Phase::Prefill => BatchEntry::prefill(self.request_id, self.token_count),
            _ => BatchEntry::decode(self.request_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub role: WorkerRole,
    pub current_batch: Vec<Stage>,
    pub busy: bool,
}

/// The slots of one group, addressed by global worker id.
///
/// Each slot stands for `tp_size` physical cores. Slot `w` owns cores
/// `w * tp_size .. (w + 1) * tp_size`; the first of them is the leader,
/// whose DONE carries the batch's results.
#[derive(Debug, Clone)]
pub struct WorkerSlotTable {
    workers: Range<WorkerId>,
    slots: Vec<WorkerSlot>,
    tp_size: usize,
}

impl WorkerSlotTable {
    pub fn new(workers: Range<WorkerId>, role: WorkerRole) -> Self {
        let slots = workers
            .clone()
            .map(|id| WorkerSlot {
                id,
                role,
                current_batch: Vec::new(),
                busy: false,
            })
            .collect();
        Self {
            workers,
            slots,
            tp_size: 1,
        }
    }

    /// Back every slot with `tp_size` cores.
    pub fn with_tensor_parallel(mut self, tp_size: usize) -> Self {
        self.tp_size = tp_size.max(1);
        self
    }

    pub fn tp_size(&self) -> usize {
        self.tp_size
    }

    pub fn core_count(&self) -> usize {
        self.slots.len() * self.tp_size
    }

    /// Cores behind `worker`.
    pub fn cores_of(&self, worker: WorkerId) -> Range<WorkerId> {
        worker * self.tp_size..(worker + 1) * self.tp_size
    }

    /// The slot a core belongs to, if it belongs to this table.
    pub fn slot_of(&self, core: WorkerId) -> Option<WorkerId> {
        let worker = core / self.tp_size;
        self.contains(worker).then_some(worker)
    }

    pub fn is_leader(&self, core: WorkerId) -> bool {
        core % self.tp_size == 0
    }

    pub fn workers(&self) -> Range<WorkerId> {
        self.workers.clone()
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        self.workers.contains(&worker)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, worker: WorkerId) -> Option<&WorkerSlot> {
        worker
            .checked_sub(self.workers.start)
            .and_then(|i| self.slots.get(i))
    }

    pub fn get_mut(&mut self, worker: WorkerId) -> Option<&mut WorkerSlot> {
        worker
            .checked_sub(self.workers.start)
            .and_then(|i| self.slots.get_mut(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter()
    }

    pub fn batch(&self, worker: WorkerId) -> &[Stage] {
        self.get(worker)
            .map(|s| s.current_batch.as_slice())
            .unwrap_or(&[])
    }

    /// Clone every current batch, indexed like the slots.
    pub fn snapshot(&self) -> Vec<Vec<Stage>> {
        self.slots.iter().map(|s| s.current_batch.clone()).collect()
    }

    /// Replace all batches at once; `batches` is indexed like the slots.
    pub fn install(&mut self, batches: Vec<Vec<Stage>>) {
        for (slot, batch) in self.slots.iter_mut().zip(batches) {
            slot.current_batch = batch;
        }
    }

    pub fn all_empty(&self) -> bool {
        self.slots.iter().all(|s| s.current_batch.is_empty())
    }

    pub fn any_busy(&self) -> bool {
        self.slots.iter().any(|s| s.busy)
    }

    pub fn set_busy(&mut self, worker: WorkerId, busy: bool) {
        if let Some(slot) = self.get_mut(worker) {
            slot.busy = busy;
        }
    }

    /// Local index of a worker inside this table.
    pub fn index_of(&self, worker: WorkerId) -> Option<usize> {
        self.contains(worker).then(|| worker - self.workers.start)
    }
}
