//! Per-iteration credit accounting.
//!
//! Each admission worker gets `core_credit` units per iteration. A decode
//! step costs 1 unit, a prefill chunk costs `pd_ratio` units.

use crate::request::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditLedger {
    pub core_credit: u32,
    pub pd_ratio: u32,
}

impl CreditLedger {
    pub fn new(core_credit: u32, pd_ratio: u32) -> Self {
        Self {
            core_credit,
            pd_ratio,
        }
    }

    /// Credit consumed by one unit of work in `phase`.
    pub fn cost(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Prefill => self.pd_ratio,
            Phase::Decode => 1,
            Phase::Untouched | Phase::Done => 0,
        }
    }

    pub fn remaining(&self, committed: u32) -> u32 {
        self.core_credit.saturating_sub(committed)
    }

    /// Whether one more unit of `phase` work fits on top of `committed`.
    pub fn admits(&self, committed: u32, phase: Phase) -> bool {
        self.cost(phase) <= self.remaining(committed)
    }

    /// Fresh budget for one worker's pass.
    pub fn budget(&self) -> CreditBudget {
        CreditBudget {
            ledger: *self,
            committed: 0,
        }
    }
}

/// Running total for a single worker during one pass.
#[derive(Debug, Clone, Copy)]
pub struct CreditBudget {
    ledger: CreditLedger,
    committed: u32,
}

impl CreditBudget {
    pub fn admits(&self, phase: Phase) -> bool {
        self.ledger.admits(self.committed, phase)
    }

    /// Commit one unit of `phase` work if it fits.
    pub fn try_charge(&mut self, phase: Phase) -> bool {
        if !self.admits(phase) {
            return false;
        }
        self.committed += self.ledger.cost(phase);
        true
    }

    pub fn committed(&self) -> u32 {
        self.committed
    }

    pub fn remaining(&self) -> u32 {
        self.ledger.remaining(self.committed)
    }
}
