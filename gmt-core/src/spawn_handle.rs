//! Spawn handles and the two-phase termination ring (spec.md §3 "Handle",
//! §4.10).
//!
//! Not to be confused with [`crate::handle::GlobalHandle`] (a global array).
//! A spawn handle groups an arbitrary tree of `_with_handle` spawns so the
//! caller can `wait_handle` for all of them, cluster-wide, to finish.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::mtask::TaskId;

/// `(node, local id)` packed the way spec.md describes: "a globally unique
/// id (per-node pool of ids, 0 … maxHandles−1, offset by node)".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpawnHandleId(pub u64);

impl SpawnHandleId {
    pub fn encode(owning_node: u32, local_id: u32) -> Self {
        SpawnHandleId(((owning_node as u64) << 32) | local_id as u64)
    }

    pub fn owning_node(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn local_id(self) -> u32 {
        self.0 as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleStatus {
    Unused = 0,
    Used = 1,
    CheckPending = 2,
    Reset = 3,
    Completed = 4,
}

impl HandleStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleStatus::Unused,
            1 => HandleStatus::Used,
            2 => HandleStatus::CheckPending,
            4 => HandleStatus::Completed,
            _ => HandleStatus::Reset,
        }
    }
}

pub struct SpawnHandleEntry {
    pub owning_task: AtomicU64,
    pub created: AtomicU64,
    pub terminated: AtomicU64,
    status: AtomicU32,
    /// Set the first time a handle-tagged task is sent to another node;
    /// once true, `wait_handle` must run the ring protocol instead of a
    /// local counter compare (spec.md §4.10).
    has_left_node: std::sync::atomic::AtomicBool,
    /// Phase-1/phase-2 partial sums accumulated while a ring circulation for
    /// this handle is in flight on its owning node.
    ring_sum_terminated: AtomicU64,
    ring_sum_created: AtomicU64,
}

impl SpawnHandleEntry {
    fn fresh() -> Self {
        SpawnHandleEntry {
            owning_task: AtomicU64::new(0),
            created: AtomicU64::new(0),
            terminated: AtomicU64::new(0),
            status: AtomicU32::new(HandleStatus::Unused as u32),
            has_left_node: std::sync::atomic::AtomicBool::new(false),
            ring_sum_terminated: AtomicU64::new(0),
            ring_sum_created: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> HandleStatus {
        HandleStatus::from_u8(self.status.load(Ordering::Acquire) as u8)
    }

    fn cas_status(&self, from: HandleStatus, to: HandleStatus) -> bool {
        self.status
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_left_node(&self) {
        self.has_left_node.store(true, Ordering::Release);
    }

    pub fn has_left_node(&self) -> bool {
        self.has_left_node.load(Ordering::Acquire)
    }

    /// Fast path: handle never left this node, so a plain counter compare
    /// tells us everything is done.
    pub fn locally_complete(&self) -> bool {
        !self.has_left_node() && self.terminated.load(Ordering::Acquire) >= self.created.load(Ordering::Acquire)
    }
}

/// Per-node fixed pool of spawn-handle slots, ids `0..max_handles_per_node`.
/// Entries are never reused while `Used`/`CheckPending`/`Reset`; `free`
/// (called from `wait_handle`'s implicit free, spec.md §6) returns the slot
/// to `Unused`.
pub struct SpawnHandleTable {
    entries: Vec<SpawnHandleEntry>,
    free: crate::queue::MpmcQueue,
    node_id: u32,
}

impl SpawnHandleTable {
    pub fn new(node_id: u32, max_handles_per_node: u32) -> Self {
        let n = max_handles_per_node as usize;
        let free = crate::queue::MpmcQueue::new(n.next_power_of_two().max(1));
        for i in 0..n as u64 {
            free.try_push(i).expect("fresh handle pool accepts all ids");
        }
        SpawnHandleTable {
            entries: (0..n).map(|_| SpawnHandleEntry::fresh()).collect(),
            free,
            node_id,
        }
    }

    pub fn alloc(&self, owning_task: TaskId) -> Option<SpawnHandleId> {
        let local_id = self.free.try_pop()? as u32;
        let e = &self.entries[local_id as usize];
        e.owning_task.store(owning_task, Ordering::Relaxed);
        e.created.store(0, Ordering::Relaxed);
        e.terminated.store(0, Ordering::Relaxed);
        e.has_left_node.store(false, Ordering::Relaxed);
        e.status.store(HandleStatus::Used as u32, Ordering::Release);
        Some(SpawnHandleId::encode(self.node_id, local_id))
    }

    pub fn get(&self, id: SpawnHandleId) -> &SpawnHandleEntry {
        assert_eq!(id.owning_node(), self.node_id, "spawn handle belongs to a different node");
        &self.entries[id.local_id() as usize]
    }

    pub fn free(&self, id: SpawnHandleId) {
        let e = self.get(id);
        e.status.store(HandleStatus::Unused as u32, Ordering::Release);
        let _ = self.free.try_push(id.local_id() as u64);
    }

    /// Begin a phase-1 ("terminated") ring circulation; fails (returns
    /// `false`) if a circulation is already in flight, per "a single CAS on
    /// status guards each transition, so only one circulation is in flight
    /// per handle".
    pub fn begin_check(&self, id: SpawnHandleId) -> bool {
        let e = self.get(id);
        e.ring_sum_terminated.store(e.terminated.load(Ordering::Acquire), Ordering::Relaxed);
        e.ring_sum_created.store(0, Ordering::Relaxed);
        e.cas_status(HandleStatus::Used, HandleStatus::CheckPending)
    }

    /// Called when the phase-1 ring completes and returns to the owner with
    /// the cluster-wide sum of `terminated`.
    pub fn record_phase1_sum(&self, id: SpawnHandleId, sum: u64) {
        self.get(id).ring_sum_terminated.store(sum, Ordering::Relaxed);
    }

    pub fn record_phase2_sum(&self, id: SpawnHandleId, sum: u64) {
        self.get(id).ring_sum_created.store(sum, Ordering::Relaxed);
    }

    /// Compare the two cluster-wide sums gathered by the two ring phases.
    /// `Some(true)` means the handle is globally quiescent and the caller
    /// should launch a reset circulation; `Some(false)` means it should
    /// fall back to `Used` and retry later; `None` means the status wasn't
    /// `CheckPending` (a concurrent circulation raced us — should not
    /// happen given the CAS discipline, but checked defensively).
    pub fn compare_sums(&self, id: SpawnHandleId) -> Option<bool> {
        let e = self.get(id);
        if e.status() != HandleStatus::CheckPending {
            return None;
        }
        let done = e.ring_sum_terminated.load(Ordering::Relaxed) == e.ring_sum_created.load(Ordering::Relaxed);
        Some(done)
    }

    pub fn begin_reset(&self, id: SpawnHandleId) -> bool {
        self.get(id).cas_status(HandleStatus::CheckPending, HandleStatus::Reset)
    }

    pub fn retry_used(&self, id: SpawnHandleId) {
        let _ = self.get(id).cas_status(HandleStatus::CheckPending, HandleStatus::Used);
    }

    /// Zero both counters cluster-wide (called once the reset ring
    /// finishes) and mark the handle `Completed`.
    pub fn finish_reset(&self, id: SpawnHandleId) {
        let e = self.get(id);
        e.created.store(0, Ordering::Relaxed);
        e.terminated.store(0, Ordering::Relaxed);
        let _ = e.cas_status(HandleStatus::Reset, HandleStatus::Completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuses_ids() {
        let t = SpawnHandleTable::new(0, 4);
        let h1 = t.alloc(1).unwrap();
        t.free(h1);
        let h2 = t.alloc(1).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn local_fast_path_when_never_left_node() {
        let t = SpawnHandleTable::new(0, 4);
        let h = t.alloc(1).unwrap();
        t.get(h).created.fetch_add(4, Ordering::Relaxed);
        assert!(!t.get(h).locally_complete());
        t.get(h).terminated.fetch_add(4, Ordering::Relaxed);
        assert!(t.get(h).locally_complete());
    }

    #[test]
    fn ring_protocol_transitions() {
        let t = SpawnHandleTable::new(0, 4);
        let h = t.alloc(1).unwrap();
        t.get(h).mark_left_node();
        t.get(h).created.store(10, Ordering::Relaxed);
        t.get(h).terminated.store(10, Ordering::Relaxed);
        assert!(t.begin_check(h));
        t.record_phase1_sum(h, 10);
        t.record_phase2_sum(h, 10);
        assert_eq!(t.compare_sums(h), Some(true));
        assert!(t.begin_reset(h));
        t.finish_reset(h);
        assert_eq!(t.get(h).status(), HandleStatus::Completed);
    }

    #[test]
    fn mismatched_sums_retry() {
        let t = SpawnHandleTable::new(0, 4);
        let h = t.alloc(1).unwrap();
        t.get(h).mark_left_node();
        assert!(t.begin_check(h));
        t.record_phase1_sum(h, 10);
        t.record_phase2_sum(h, 12);
        assert_eq!(t.compare_sums(h), Some(false));
        t.retry_used(h);
        assert_eq!(t.get(h).status(), HandleStatus::Used);
    }
}
