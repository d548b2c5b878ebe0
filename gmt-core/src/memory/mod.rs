//! Global memory: array metadata table and distribution math (spec.md §3,
//! §4.6).
//!
//! The table itself is guarded by a `spin::Mutex` over a fixed-size slot
//! array plus an `AtomicUsize` live count, rather than one lock per entry —
//! allocations are rare relative to `put`/`get`, so a single short critical
//! section for slot bookkeeping is preferable to per-entry lock overhead on
//! the hot path (the hot path never takes this lock; it reads the
//! already-published `ArrayEntry` by shared reference).

pub mod ops;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{GmtError, Media, Result};
use crate::handle::{Distribution, GlobalHandle, MAX_ALLOC_ID};

/// Per-entry metadata, held identically on every node (spec.md §3).
#[derive(Debug, Clone)]
pub struct ArrayEntry {
    pub handle: GlobalHandle,
    pub elem_bytes: usize,
    pub total_bytes: u64,
    pub local_bytes: u64,
    pub block_bytes: u64,
    pub local_offset: u64,
    pub name: Option<String>,
    pub transient: bool,
}

impl ArrayEntry {
    fn is_free(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn num_elems(&self) -> u64 {
        if self.elem_bytes == 0 {
            0
        } else {
            self.total_bytes / self.elem_bytes as u64
        }
    }
}

fn free_entry() -> ArrayEntry {
    ArrayEntry {
        handle: GlobalHandle(0),
        elem_bytes: 0,
        total_bytes: 0,
        local_bytes: 0,
        block_bytes: 0,
        local_offset: 0,
        name: None,
        transient: false,
    }
}

/// Which node(s) a byte range touches, and the local byte range on each.
#[derive(Debug, Clone, Copy)]
pub struct LocalRange {
    pub node: u32,
    /// Local byte offset on `node`.
    pub local_offset: u64,
    /// Global byte offset this local range starts at.
    pub global_offset: u64,
    pub len: u64,
}

pub struct ArrayTable {
    slots: spin::Mutex<Vec<ArrayEntry>>,
    live: AtomicUsize,
    node_id: u32,
    num_nodes: u32,
}

impl ArrayTable {
    pub fn new(node_id: u32, num_nodes: u32, max_handles_per_node: u32) -> Self {
        let slots = (0..max_handles_per_node).map(|_| free_entry()).collect();
        ArrayTable {
            slots: spin::Mutex::new(slots),
            live: AtomicUsize::new(0),
            node_id,
            num_nodes,
        }
    }

    /// Compute this node's local slab size and local byte offset for a
    /// freshly-allocated array, per spec.md §3 invariants (a)/(b): an
    /// element is never split across nodes, and for partitioned arrays a
    /// contiguous global range maps to a contiguous local range on exactly
    /// one node.
    fn layout_for(&self, num_elems: u64, elem_bytes: usize, policy: Distribution, start_node: u32) -> (u64, u64, u64) {
        let total_bytes = num_elems * elem_bytes as u64;
        match policy {
            Distribution::Local => {
                if self.node_id == start_node {
                    (total_bytes, 0, total_bytes)
                } else {
                    (0, 0, total_bytes)
                }
            }
            Distribution::Replicate => (total_bytes, 0, total_bytes),
            Distribution::PartitionFromZero | Distribution::PartitionFromRandom | Distribution::PartitionFromHere => {
                block_layout(self.node_id, self.num_nodes, start_node, num_elems, elem_bytes, total_bytes)
            }
            Distribution::Remote => {
                // Evenly sliced across every node except the allocator.
                let participants = self.num_nodes.saturating_sub(1).max(1);
                if self.node_id == start_node {
                    let block_bytes = ceil_div(total_bytes, participants as u64);
                    (0, 0, block_bytes)
                } else {
                    // Re-rank excluding the allocator, then reuse the same math.
                    let rank = if self.node_id < start_node { self.node_id } else { self.node_id - 1 };
                    block_layout_for_rank(rank, participants, num_elems, elem_bytes, total_bytes)
                }
            }
        }
    }

    pub fn alloc(&self, num_elems: u64, elem_bytes: usize, policy: Distribution, start_node: u32, name: Option<String>, zero_init: bool) -> Result<GlobalHandle> {
        if elem_bytes == 0 {
            return Err(GmtError::InvalidConfig("elem_bytes must be > 0".into()));
        }
        let (local_bytes, local_offset, block_bytes) = self.layout_for(num_elems, elem_bytes, policy, start_node);
        let mut slots = self.slots.lock();
        let idx = slots
            .iter()
            .position(ArrayEntry::is_free)
            .ok_or(GmtError::AllocationPoolExhausted)?;
        if idx as u32 > MAX_ALLOC_ID {
            return Err(GmtError::AllocationPoolExhausted);
        }
        let handle = GlobalHandle::encode(idx as u32, start_node, policy, Media::Ram, zero_init);
        slots[idx] = ArrayEntry {
            handle,
            elem_bytes,
            total_bytes: num_elems * elem_bytes as u64,
            local_bytes,
            block_bytes,
            local_offset,
            name,
            transient: true,
        };
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    pub fn free(&self, handle: GlobalHandle) -> Result<()> {
        let mut slots = self.slots.lock();
        let idx = handle.alloc_id() as usize;
        let entry = slots.get_mut(idx).ok_or(GmtError::UseAfterFree(handle.0))?;
        if entry.is_free() {
            return Err(GmtError::DoubleFree(handle.0));
        }
        *entry = free_entry();
        self.live.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn entry(&self, handle: GlobalHandle) -> Result<ArrayEntry> {
        let slots = self.slots.lock();
        let idx = handle.alloc_id() as usize;
        match slots.get(idx) {
            Some(e) if !e.is_free() => Ok(e.clone()),
            Some(_) => Err(GmtError::UseAfterFree(handle.0)),
            None => Err(GmtError::UseAfterFree(handle.0)),
        }
    }

    pub fn attach(&self, name: &str) -> Option<GlobalHandle> {
        let slots = self.slots.lock();
        slots.iter().find(|e| !e.is_free() && e.name.as_deref() == Some(name)).map(|e| e.handle)
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

fn ceil_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// spec.md §4.6: "element-never-split is enforced by computing a block size
/// of `ceil(num_elems / num_nodes) * elem_bytes`".
pub fn block_bytes_for(num_elems: u64, num_nodes: u32, elem_bytes: usize) -> u64 {
    ceil_div(num_elems, num_nodes.max(1) as u64) * elem_bytes as u64
}

fn block_layout(node_id: u32, num_nodes: u32, start_node: u32, num_elems: u64, elem_bytes: usize, total_bytes: u64) -> (u64, u64, u64) {
    let rank = (node_id + num_nodes - start_node) % num_nodes;
    block_layout_for_rank(rank, num_nodes, num_elems, elem_bytes, total_bytes)
}

fn block_layout_for_rank(rank: u32, participants: u32, num_elems: u64, elem_bytes: usize, total_bytes: u64) -> (u64, u64, u64) {
    let block_bytes = block_bytes_for(num_elems, participants, elem_bytes);
    let local_offset = block_bytes * rank as u64;
    let local_bytes = if local_offset >= total_bytes {
        0
    } else {
        block_bytes.min(total_bytes - local_offset)
    };
    (local_bytes, local_offset, block_bytes)
}

/// Owning node and contiguous local ranges touched by a global byte range
/// `[global_offset, global_offset + len)` on a partitioned array. For
/// `REPLICATE` arrays callers should special-case locally (every node owns
/// the whole range) rather than calling this.
pub fn ranges_for(entry: &ArrayEntry, num_nodes: u32, global_offset: u64, len: u64) -> Vec<LocalRange> {
    if entry.handle.distribution().is_replicated() {
        return vec![LocalRange {
            node: u32::MAX, // caller must special-case REPLICATE
            local_offset: global_offset,
            global_offset,
            len,
        }];
    }
    let block_bytes = entry.block_bytes.max(1);
    let start_node = entry.handle.start_node();
    let participants = match entry.handle.distribution() {
        Distribution::Remote => num_nodes.saturating_sub(1).max(1),
        _ => num_nodes,
    };
    let mut out = Vec::new();
    let mut off = global_offset;
    let end = global_offset + len;
    while off < end {
        let rank = off / block_bytes;
        let rank = rank.min(participants as u64 - 1) as u32;
        let block_start = rank as u64 * block_bytes;
        let block_end = (block_start + block_bytes).min(entry.total_bytes);
        let seg_end = block_end.min(end);
        let node = match entry.handle.distribution() {
            Distribution::Remote => {
                if rank >= start_node { rank + 1 } else { rank }
            }
            _ => (start_node + rank) % num_nodes,
        };
        out.push(LocalRange {
            node,
            local_offset: off - block_start,
            global_offset: off,
            len: seg_end - off,
        });
        off = seg_end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_never_split_across_block_boundary() {
        // 10 elements of 8 bytes over 3 nodes: block = ceil(10/3)*8 = 32
        let bb = block_bytes_for(10, 3, 8);
        assert_eq!(bb, 32);
        assert_eq!(bb % 8, 0, "block size must be a whole number of elements");
    }

    #[test]
    fn replicate_local_slab_equals_total() {
        let table = ArrayTable::new(0, 4, 16);
        let h = table.alloc(4, 8, Distribution::Replicate, 0, None, false).unwrap();
        let e = table.entry(h).unwrap();
        assert_eq!(e.local_bytes, e.total_bytes);
    }

    #[test]
    fn partition_from_zero_covers_whole_array_with_no_overlap() {
        let num_nodes = 4u32;
        let tables: Vec<_> = (0..num_nodes).map(|n| ArrayTable::new(n, num_nodes, 16)).collect();
        let mut handle = None;
        for t in &tables {
            let h = t.alloc(1_000_000, 8, Distribution::PartitionFromZero, 0, None, false).unwrap();
            handle = Some(h);
        }
        let h = handle.unwrap();
        let mut total_local = 0u64;
        for t in &tables {
            total_local += t.entry(h).unwrap().local_bytes;
        }
        assert_eq!(total_local, 1_000_000 * 8);
    }

    #[test]
    fn total_bytes_zero_iff_free() {
        let table = ArrayTable::new(0, 1, 4);
        let h = table.alloc(10, 8, Distribution::Local, 0, None, false).unwrap();
        assert!(table.entry(h).is_ok());
        table.free(h).unwrap();
        assert!(table.entry(h).is_err());
    }

    #[test]
    fn double_free_is_an_error() {
        let table = ArrayTable::new(0, 1, 4);
        let h = table.alloc(10, 8, Distribution::Local, 0, None, false).unwrap();
        table.free(h).unwrap();
        assert!(matches!(table.free(h), Err(GmtError::DoubleFree(_))));
    }

    #[test]
    fn ranges_for_partitioned_array_never_split_an_element() {
        let num_nodes = 3u32;
        let table = ArrayTable::new(0, num_nodes, 16);
        let h = table.alloc(10, 8, Distribution::PartitionFromZero, 0, None, false).unwrap();
        let entry = table.entry(h).unwrap();
        let ranges = ranges_for(&entry, num_nodes, 0, 80);
        let total: u64 = ranges.iter().map(|r| r.len).sum();
        assert_eq!(total, 80);
        for r in &ranges {
            assert_eq!(r.len % 8, 0);
        }
    }
}
