//! ACK/DONE barrier pacing one group's iterations.
//!
//! ```text
//! IDLE --dispatch--> DISPATCHED --all ACK--> SENDING_INPUT --begin--> EXECUTING --all DONE--> IDLE
//! ```
//!
//! Any signal that does not fit the current state is a protocol violation.

use pdsim_grid::WorkerId;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Idle,
    Dispatched,
    SendingInput,
    Executing,
}

/// Inbound worker signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ack,
    Done,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Ack => write!(f, "ACK"),
            Signal::Done => write!(f, "DONE"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BarrierError {
    #[error("{signal} from worker {worker} while barrier is {state:?}")]
    WrongState {
        signal: Signal,
        worker: WorkerId,
        state: BarrierState,
    },
    #[error("{signal} from worker {worker}, which is not part of iteration {iteration}")]
    UnexpectedWorker {
        signal: Signal,
        worker: WorkerId,
        iteration: u64,
    },
    #[error("Duplicate {signal} from worker {worker} in iteration {iteration}")]
    Duplicate {
        signal: Signal,
        worker: WorkerId,
        iteration: u64,
    },
    #[error("Cannot {action} while barrier is {state:?}")]
    BadTransition {
        action: &'static str,
        state: BarrierState,
    },
    #[error("Dispatch with no workers")]
    EmptyDispatch,
}

#[derive(Debug, Clone)]
pub struct IterationBarrier {
    state: BarrierState,
    expected: BTreeSet<WorkerId>,
    acked: BTreeSet<WorkerId>,
    done: BTreeSet<WorkerId>,
    iteration: u64,
}

impl Default for IterationBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl IterationBarrier {
    pub fn new() -> Self {
        Self {
            state: BarrierState::Idle,
            expected: BTreeSet::new(),
            acked: BTreeSet::new(),
            done: BTreeSet::new(),
            iteration: 0,
        }
    }

    pub fn state(&self) -> BarrierState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == BarrierState::Idle
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Workers taking part in the current iteration.
    pub fn expected(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.expected.iter().copied()
    }

    /// Open a new iteration for `workers`.
    pub fn dispatch<I>(&mut self, workers: I) -> Result<(), BarrierError>
    where
        I: IntoIterator<Item = WorkerId>,
    {
        if self.state != BarrierState::Idle {
            return Err(BarrierError::BadTransition {
                action: "dispatch",
                state: self.state,
            });
        }
        let expected: BTreeSet<WorkerId> = workers.into_iter().collect();
        if expected.is_empty() {
            return Err(BarrierError::EmptyDispatch);
        }
        self.expected = expected;
        self.acked.clear();
        self.done.clear();
        self.iteration += 1;
        self.state = BarrierState::Dispatched;
        Ok(())
    }

    /// Count an ACK. Returns `true` once every dispatched worker has acked.
    pub fn ack(&mut self, worker: WorkerId) -> Result<bool, BarrierError> {
        self.record(Signal::Ack, worker, BarrierState::Dispatched)?;
        if self.acked.len() == self.expected.len() {
            self.state = BarrierState::SendingInput;
            return Ok(true);
        }
        Ok(false)
    }

    /// Start data has been sent and every worker released.
    pub fn begin_execution(&mut self) -> Result<(), BarrierError> {
        if self.state != BarrierState::SendingInput {
            return Err(BarrierError::BadTransition {
                action: "begin execution",
                state: self.state,
            });
        }
        self.state = BarrierState::Executing;
        Ok(())
    }

    /// Count a DONE. Returns `true` once the iteration is complete and the
    /// barrier is idle again.
    pub fn done(&mut self, worker: WorkerId) -> Result<bool, BarrierError> {
        self.record(Signal::Done, worker, BarrierState::Executing)?;
        if self.done.len() == self.expected.len() {
            self.state = BarrierState::Idle;
            return Ok(true);
        }
        Ok(false)
    }

    fn record(
        &mut self,
        signal: Signal,
        worker: WorkerId,
        required: BarrierState,
    ) -> Result<(), BarrierError> {
        if self.state != required {
            return Err(BarrierError::WrongState {
                signal,
                worker,
                state: self.state,
            });
        }
        if !self.expected.contains(&worker) {
            return Err(BarrierError::UnexpectedWorker {
                signal,
                worker,
                iteration: self.iteration,
            });
        }
        let seen = match signal {
            Signal::Ack => &mut self.acked,
            Signal::Done => &mut self.done,
        };
        if !seen.insert(worker) {
            return Err(BarrierError::Duplicate {
                signal,
                worker,
                iteration: self.iteration,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executing(workers: &[WorkerId]) -> IterationBarrier {
        let mut b = IterationBarrier::new();
        b.dispatch(workers.iter().copied()).unwrap();
        for &w in workers {
            b.ack(w).unwrap();
        }
        b.begin_execution().unwrap();
        b
    }

    #[test]
    fn test_full_cycle() {
        let mut b = IterationBarrier::new();
        assert!(b.is_idle());
        b.dispatch([1, 2]).unwrap();
        assert_eq!(b.state(), BarrierState::Dispatched);
        assert!(!b.ack(2).unwrap());
        assert!(b.ack(1).unwrap());
        assert_eq!(b.state(), BarrierState::SendingInput);
        b.begin_execution().unwrap();
        assert!(!b.done(1).unwrap());
        assert!(b.done(2).unwrap());
        assert!(b.is_idle());
        assert_eq!(b.iteration(), 1);
    }

    #[test]
    fn test_duplicate_ack() {
        let mut b = IterationBarrier::new();
        b.dispatch([0, 1]).unwrap();
        b.ack(0).unwrap();
        assert!(matches!(
            b.ack(0),
            Err(BarrierError::Duplicate {
                signal: Signal::Ack,
                worker: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_unexpected_done() {
        let mut b = executing(&[0]);
        assert!(matches!(
            b.done(5),
            Err(BarrierError::UnexpectedWorker { worker: 5, .. })
        ));
    }

    #[test]
    fn test_duplicate_done() {
        let mut b = executing(&[0, 1]);
        b.done(0).unwrap();
        assert!(matches!(b.done(0), Err(BarrierError::Duplicate { .. })));
    }

    #[test]
    fn test_done_before_release() {
        let mut b = IterationBarrier::new();
        b.dispatch([0]).unwrap();
        assert!(matches!(
            b.done(0),
            Err(BarrierError::WrongState {
                state: BarrierState::Dispatched,
                ..
            })
        ));
    }

    #[test]
    fn test_ack_while_idle() {
        let mut b = IterationBarrier::new();
        assert!(matches!(b.ack(0), Err(BarrierError::WrongState { .. })));
    }

    #[test]
    fn test_dispatch_while_busy() {
        let mut b = IterationBarrier::new();
        b.dispatch([0]).unwrap();
        assert!(matches!(
            b.dispatch([1]),
            Err(BarrierError::BadTransition { .. })
        ));
    }

    #[test]
    fn test_empty_dispatch() {
        let mut b = IterationBarrier::new();
        assert_eq!(b.dispatch([]), Err(BarrierError::EmptyDispatch));
    }

    #[test]
    fn test_error_names_worker() {
        let mut b = executing(&[3]);
        b.done(3).unwrap();
        let msg = b.done(3).unwrap_err().to_string();
        assert!(msg.contains("DONE"));
        assert!(msg.contains("worker 3"));
    }
}
