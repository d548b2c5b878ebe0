//! Macro-tasks ("mtasks"), spec.md §3, §4.7, §4.8, §4.9.
//!
//! An mtask is the unit a spawn primitive produces. A worker *claims* an
//! mtask off a queue, fans it out into per-iteration uthread executions
//! (`for_loop`/`for_each`) or a single uthread execution (`execute_*`), and
//! the mtask is *retired* once every iteration has run (and, for `execute`,
//! its reply has gone out).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::handle::GlobalHandle;
use crate::spawn_handle::SpawnHandleId;

pub type TaskId = u64;

pub const UTHREAD_MAX_RET_SIZE: usize = 4096;

/// A `for_loop`/`for_each` iteration body. Receives the claimed sub-range
/// `[start_it, start_it + num_it)` and the copied-in argument buffer; the
/// body is responsible for looping over every index in that range itself
/// (mirrors `gmt_for_loop_func_t` in the C API this runtime descends from).
pub type ForFn = fn(start_it: u64, num_it: u64, args: &[u8]);

/// An `execute_*` body. Receives its argument buffer and a scratch output
/// buffer; returns the number of bytes written (must be `<=
/// UTHREAD_MAX_RET_SIZE`, enforced by the caller before the mtask is even
/// built — see `GmtError::ReturnBufferTooLarge`).
pub type ExecFn = fn(args: &[u8], ret: &mut [u8]) -> usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preemption {
    Preemptable,
    NonPreemptable,
}

pub enum MacroTaskKind {
    ForLoop(ForFn),
    ForEach(ForFn),
    Execute(ExecFn, Preemption),
}

/// Where a finished mtask's completion notification is delivered.
#[derive(Debug, Clone, Copy)]
pub enum CompletionTarget {
    /// Bump the parent uthread's local counter directly (parent is on this node).
    LocalParent { parent_task: TaskId, nesting_level: u32 },
    /// Send a for-completion/execute-completion command back to the parent's node.
    RemoteParent { node: u32, parent_task: TaskId, nesting_level: u32 },
    /// Bump a spawn handle's `terminated` counter (for `_with_handle` spawns).
    SpawnHandle { node: u32, handle: SpawnHandleId },
    /// No one is watching (fire-and-forget `_nb` call that nobody waited on
    /// — still must run, just has nowhere to report to).
    None,
}

pub struct MacroTask {
    pub kind: MacroTaskKind,
    pub args: Vec<u8>,
    pub nesting_level: u32,
    /// Inclusive/exclusive iteration range and step; for `Execute` this is
    /// always `(0, 1, 1)` (exactly one iteration).
    pub start_it: AtomicU64,
    pub end_it: u64,
    pub step: u64,
    pub executed_it: AtomicU64,
    pub bound_array: Option<GlobalHandle>,
    pub ret_size: usize,
    pub completion: CompletionTarget,
}

impl MacroTask {
    pub fn for_loop(fn_: ForFn, args: Vec<u8>, start: u64, end: u64, step: u64, nesting_level: u32, completion: CompletionTarget) -> Self {
        MacroTask {
            kind: MacroTaskKind::ForLoop(fn_),
            args,
            nesting_level,
            start_it: AtomicU64::new(start),
            end_it: end,
            step: step.max(1),
            executed_it: AtomicU64::new(0),
            bound_array: None,
            ret_size: 0,
            completion,
        }
    }

    pub fn for_each(fn_: ForFn, args: Vec<u8>, array: GlobalHandle, start: u64, end: u64, step: u64, nesting_level: u32, completion: CompletionTarget) -> Self {
        MacroTask {
            kind: MacroTaskKind::ForEach(fn_),
            args,
            nesting_level,
            start_it: AtomicU64::new(start),
            end_it: end,
            step: step.max(1),
            executed_it: AtomicU64::new(0),
            bound_array: Some(array),
            ret_size: 0,
            completion,
        }
    }

    pub fn execute(fn_: ExecFn, args: Vec<u8>, preempt: Preemption, nesting_level: u32, completion: CompletionTarget) -> Self {
        MacroTask {
            kind: MacroTaskKind::Execute(fn_, preempt),
            args,
            nesting_level,
            start_it: AtomicU64::new(0),
            end_it: 1,
            step: 1,
            executed_it: AtomicU64::new(0),
            bound_array: None,
            ret_size: 0,
            completion,
        }
    }

    /// Total number of iterations this mtask was created to run.
    pub fn total_iters(&self) -> u64 {
        if self.end_it == 0 {
            0
        } else {
            (self.end_it + self.step - 1) / self.step
        }
    }

    /// How many iterations this mtask still has to hand out, computed from
    /// the *current* `start_it` (which other workers may be advancing
    /// concurrently via [`claim_iterations`]).
    pub fn remaining_iters(&self) -> u64 {
        let start = self.start_it.load(Ordering::Acquire);
        if start >= self.end_it {
            0
        } else {
            (self.end_it - start + self.step - 1) / self.step
        }
    }

    /// Atomically claim up to `want` iterations starting at the current
    /// cursor. Returns `(first_it, count)`; `count` may be less than `want`
    /// (or zero) if the range was already exhausted by a concurrent claim.
    pub fn claim_iterations(&self, want: u64) -> (u64, u64) {
        let step = self.step;
        let mut cur = self.start_it.load(Ordering::Acquire);
        loop {
            if cur >= self.end_it {
                return (cur, 0);
            }
            let available = (self.end_it - cur + step - 1) / step;
            let take = available.min(want.max(1));
            let advance = take * step;
            match self
                .start_it
                .compare_exchange_weak(cur, cur + advance, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return (cur, take),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Record that `count` iterations finished executing; returns `true` if
    /// this call observed the mtask's final iteration completing (i.e. the
    /// mtask is now retired and its completion should fire exactly once).
    pub fn record_executed(&self, count: u64) -> bool {
        let prev = self.executed_it.fetch_add(count, Ordering::AcqRel);
        prev + count >= self.total_iters()
    }
}

/// Fixed-size, per-node pool of mtask slots (spec.md §4.9: "allocator pool
/// of at most pool_size mtasks"). Slots are reused; a freed index goes back
/// onto `free`.
pub struct MtaskPool {
    slots: Vec<spin::Mutex<Option<MacroTask>>>,
    free: crate::queue::MpmcQueue,
}

impl MtaskPool {
    pub fn new(pool_size: usize) -> Self {
        let free = crate::queue::MpmcQueue::new(pool_size.next_power_of_two());
        for i in 0..pool_size as u64 {
            free.try_push(i).expect("fresh pool must accept all indices");
        }
        MtaskPool {
            slots: (0..pool_size).map(|_| spin::Mutex::new(None)).collect(),
            free,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn try_alloc(&self, task: MacroTask) -> Result<u32, MacroTask> {
        match self.free.try_pop() {
            Some(idx) => {
                *self.slots[idx as usize].lock() = Some(task);
                Ok(idx as u32)
            }
            None => Err(task),
        }
    }

    pub fn with<R>(&self, idx: u32, f: impl FnOnce(&MacroTask) -> R) -> R {
        let guard = self.slots[idx as usize].lock();
        f(guard.as_ref().expect("with() on freed mtask slot"))
    }

    pub fn free(&self, idx: u32) {
        *self.slots[idx as usize].lock() = None;
        let _ = self.free.try_push(idx as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_start_it: u64, _num_it: u64, _args: &[u8]) {}

    #[test]
    fn claim_iterations_partitions_the_range_exactly() {
        let t = MacroTask::for_loop(noop, vec![], 0, 100, 1, 0, CompletionTarget::None);
        let mut claimed = Vec::new();
        loop {
            let (first, count) = t.claim_iterations(7);
            if count == 0 {
                break;
            }
            for i in 0..count {
                claimed.push(first + i);
            }
        }
        claimed.sort();
        assert_eq!(claimed, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn record_executed_signals_completion_exactly_once() {
        let t = MacroTask::for_loop(noop, vec![], 0, 10, 1, 0, CompletionTarget::None);
        assert!(!t.record_executed(9));
        assert!(t.record_executed(1));
    }

    #[test]
    fn pool_alloc_free_cycle() {
        let pool = MtaskPool::new(4);
        let mut idxs = Vec::new();
        for _ in 0..4 {
            idxs.push(
                pool.try_alloc(MacroTask::for_loop(noop, vec![], 0, 1, 1, 0, CompletionTarget::None))
                    .unwrap(),
            );
        }
        assert!(pool
            .try_alloc(MacroTask::for_loop(noop, vec![], 0, 1, 1, 0, CompletionTarget::None))
            .is_err());
        pool.free(idxs[0]);
        assert!(pool
            .try_alloc(MacroTask::for_loop(noop, vec![], 0, 1, 1, 0, CompletionTarget::None))
            .is_ok());
    }
}
