//! Public operations (spec.md §6).
//!
//! Every blocking variant here is literally its `_nb` counterpart followed
//! by the matching `wait_*`, per the contract spec.md §6 states; the `_nb`
//! functions are the ones with real bodies.

use std::sync::atomic::Ordering;

use crate::command::{Command, CommandHeader, CommandType};
use crate::error::{GmtError, Result};
use crate::handle::{Distribution, GlobalHandle};
use crate::memory::{ops::LocalSlab, ranges_for};
use crate::mtask::{CompletionTarget, ExecFn, ForFn, MacroTask, Preemption};
use crate::node::{self, NodeRuntime};
use crate::spawn_handle::SpawnHandleId;
use crate::uthread::YieldSignal;

/// Where a `for_loop`/`execute_*` should place work, per spec.md §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPolicy {
    Local,
    Remote(u32),
    Spread,
    PartitionFromZero,
    PartitionFromRandom,
    PartitionFromHere,
}

fn node_checked() -> std::sync::Arc<NodeRuntime> {
    node::current()
}

// ---------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------

pub fn alloc(num_elems: u64, elem_bytes: usize, policy: Distribution, name: Option<String>, zero_init: bool) -> Result<GlobalHandle> {
    let node = node_checked();
    let handle = node.arrays.alloc(num_elems, elem_bytes, policy, node.node_id(), name.clone(), zero_init)?;
    if policy.allocator_participates() || policy.is_replicated() {
        // local entry already created above; nothing further to announce
        // for the common case where every node computes its own layout
        // independently from the same deterministic inputs (num_elems,
        // policy, start_node) once the handle is broadcast.
    }
    // Broadcast the allocation so every other node creates the identical
    // metadata entry at the identical alloc_id (spec.md §3: "handle valid
    // on every node").
    for dest in 0..node.num_nodes() {
        if dest == node.node_id() {
            continue;
        }
        let cmd = Command::Allocate {
            header: CommandHeader {
                kind: CommandType::Allocate,
                origin_task: node::task_id_or_zero(),
                nesting_level: 0,
            },
            num_elems,
            elem_bytes: elem_bytes as u32,
            policy: policy_bits(policy),
            zero_init,
            reply_task: 0,
        };
        let _granted = node.destinations[dest as usize].agm_get_cmd(&cmd, 0);
        if let Some(buf) = node.destinations[dest as usize].maybe_pack() {
            let _ = node.comm.try_send(dest, buf);
        }
    }
    Ok(handle)
}

pub fn attach(name: &str) -> Option<GlobalHandle> {
    node_checked().arrays.attach(name)
}

pub fn free(handle: GlobalHandle) -> Result<()> {
    node_checked().arrays.free(handle)
}

pub fn local_ptr_is_owned(handle: GlobalHandle, elem_off: u64) -> Result<bool> {
    let node = node_checked();
    let entry = node.arrays.entry(handle)?;
    let ranges = ranges_for(&entry, node.num_nodes(), elem_off * entry.elem_bytes as u64, entry.elem_bytes as u64);
    Ok(ranges.iter().any(|r| r.node == node.node_id() || handle.distribution().is_replicated()))
}

fn policy_bits(p: Distribution) -> u8 {
    match p {
        Distribution::Local => 0,
        Distribution::PartitionFromZero => 1,
        Distribution::PartitionFromRandom => 2,
        Distribution::PartitionFromHere => 3,
        Distribution::Remote => 4,
        Distribution::Replicate => 5,
    }
}

// ---------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------

/// Resolve and locate (or lazily create) the local backing slab for a
/// range this node owns. Populated by `helper.rs`'s `SlabRegistry` in the
/// full node assembly; exposed here via a thread-local injected at
/// `node::init` time so `api.rs` doesn't need a direct dependency edge onto
/// `helper.rs` for something as simple as "where do my own bytes live".
pub fn put_nb(handle: GlobalHandle, elem_off: u64, src: &[u8]) -> Result<()> {
    let node = node_checked();
    let entry = node.arrays.entry(handle)?;
    let byte_off = elem_off * entry.elem_bytes as u64;
    if handle.distribution().is_replicated() {
        for dest in 0..node.num_nodes() {
            if dest != node.node_id() {
                send_put(&node, dest, handle, byte_off, src);
            }
        }
        write_local(&node, handle, &entry, byte_off, src)?;
        return Ok(());
    }
    for range in ranges_for(&entry, node.num_nodes(), byte_off, src.len() as u64) {
        let chunk = &src[(range.global_offset - byte_off) as usize..][..range.len as usize];
        if range.node == node.node_id() {
            write_local(&node, handle, &entry, range.local_offset, chunk)?;
        } else {
            send_put_at(&node, range.node, handle, range.local_offset, chunk);
        }
    }
    Ok(())
}

pub fn put(handle: GlobalHandle, elem_off: u64, src: &[u8]) -> Result<()> {
    put_nb(handle, elem_off, src)?;
    wait_data();
    Ok(())
}

pub fn put_value_nb(handle: GlobalHandle, elem_off: u64, value: u64) -> Result<()> {
    let node = node_checked();
    let entry = node.arrays.entry(handle)?;
    if ![1usize, 2, 4, 8].contains(&entry.elem_bytes) {
        return Err(GmtError::BadAtomicElementSize(entry.elem_bytes));
    }
    let bytes = value.to_le_bytes();
    put_nb(handle, elem_off, &bytes[..entry.elem_bytes])
}

pub fn get_nb(handle: GlobalHandle, elem_off: u64, dst: &mut [u8]) -> Result<()> {
    let node = node_checked();
    let entry = node.arrays.entry(handle)?;
    let byte_off = elem_off * entry.elem_bytes as u64;
    if handle.distribution().is_replicated() {
        let slab = local_slab(&node, handle, &entry);
        return slab.get(byte_off, dst.len(), dst);
    }
    for range in ranges_for(&entry, node.num_nodes(), byte_off, dst.len() as u64) {
        let out = &mut dst[(range.global_offset - byte_off) as usize..][..range.len as usize];
        if range.node == node.node_id() {
            let slab = local_slab(&node, handle, &entry);
            slab.get(range.local_offset, range.len as usize, out)?;
        } else {
            // Remote get: `ReplyTable` only tracks one outstanding reply per
            // task id, so each remote range is registered, sent, and waited
            // on in turn rather than fired off in parallel — this is the one
            // place `get_nb` genuinely blocks, to land bytes in `out` before
            // returning.
            let task = node::task_id_or_zero();
            if let Some(counters) = crate::uthread::current_counters() {
                node.replies.register(task, counters);
            }
            send_get(&node, range.node, handle, range.local_offset, range.len as u32);
            wait_data();
            if let Some(bytes) = node.replies.take_bytes(task) {
                let n = bytes.len().min(out.len());
                out[..n].copy_from_slice(&bytes[..n]);
            }
            node.replies.unregister(task);
        }
    }
    Ok(())
}

pub fn get(handle: GlobalHandle, elem_off: u64, dst: &mut [u8]) -> Result<()> {
    get_nb(handle, elem_off, dst)?;
    wait_data();
    Ok(())
}

fn local_slab(node: &NodeRuntime, handle: GlobalHandle, entry: &crate::memory::ArrayEntry) -> std::sync::Arc<LocalSlab> {
    node.slabs().get_or_create(handle.0, entry.local_bytes.max(entry.total_bytes), handle.zero_init())
}

fn write_local(node: &NodeRuntime, handle: GlobalHandle, entry: &crate::memory::ArrayEntry, local_offset: u64, bytes: &[u8]) -> Result<()> {
    local_slab(node, handle, entry).put(local_offset, bytes)
}

fn send_put(node: &NodeRuntime, dest: u32, handle: GlobalHandle, local_offset: u64, bytes: &[u8]) {
    send_put_at(node, dest, handle, local_offset, bytes)
}

fn send_put_at(node: &NodeRuntime, dest: u32, handle: GlobalHandle, local_offset: u64, bytes: &[u8]) {
    let cmd = Command::Put {
        header: CommandHeader {
            kind: CommandType::Put,
            origin_task: node::task_id_or_zero(),
            nesting_level: 0,
        },
        handle,
        local_offset,
        args_size: bytes.len() as u32,
    };
    let granted = node.destinations[dest as usize].agm_get_cmd(&cmd, bytes.len());
    node.destinations[dest as usize].agm_set_cmd_data(&bytes[..granted.min(bytes.len())]);
    if let Some(buf) = node.destinations[dest as usize].maybe_pack() {
        let _ = node.comm.try_send(dest, buf);
    }
}

fn send_get(node: &NodeRuntime, dest: u32, handle: GlobalHandle, local_offset: u64, len: u32) {
    let cmd = Command::Get {
        header: CommandHeader {
            kind: CommandType::Get,
            origin_task: node::task_id_or_zero(),
            nesting_level: 0,
        },
        handle,
        local_offset,
        len,
        reply_task: node::task_id_or_zero(),
    };
    let _granted = node.destinations[dest as usize].agm_get_cmd(&cmd, 0);
    if let Some(buf) = node.destinations[dest as usize].maybe_pack() {
        let _ = node.comm.try_send(dest, buf);
    }
}

/// `memcpy` (spec.md §4.6): decomposed per-range, routed as local
/// `memcpy_within`, a non-blocking put, or a non-blocking get depending on
/// which side is local.
pub fn memcpy(src: GlobalHandle, src_off: u64, dst: GlobalHandle, dst_off: u64, n: u64) -> Result<()> {
    let node = node_checked();
    let src_entry = node.arrays.entry(src)?;
    let dst_entry = node.arrays.entry(dst)?;
    let mut buf = vec![0u8; n as usize];
    get_nb(src, src_off / src_entry.elem_bytes.max(1) as u64, &mut buf)?;
    wait_data();
    put_nb(dst, dst_off / dst_entry.elem_bytes.max(1) as u64, &buf)?;
    wait_data();
    Ok(())
}

// ---------------------------------------------------------------------
// Atomics
// ---------------------------------------------------------------------

pub fn atomic_add_nb(handle: GlobalHandle, elem_off: u64, val: i64) -> Result<i64> {
    let node = node_checked();
    let entry = node.arrays.entry(handle)?;
    if ![1usize, 2, 4, 8].contains(&entry.elem_bytes) {
        return Err(GmtError::BadAtomicElementSize(entry.elem_bytes));
    }
    let byte_off = elem_off * entry.elem_bytes as u64;
    let ranges = ranges_for(&entry, node.num_nodes(), byte_off, entry.elem_bytes as u64);
    let range = ranges.into_iter().next().expect("atomic op always touches exactly one element");
    if range.node == node.node_id() || handle.distribution().is_replicated() {
        local_slab(&node, handle, &entry).atomic_add_i64(range.local_offset, entry.elem_bytes, val)
    } else {
        let task = node::task_id_or_zero();
        if let Some(counters) = crate::uthread::current_counters() {
            node.replies.register(task, counters);
        }
        let cmd = Command::AtomicAdd {
            header: CommandHeader {
                kind: CommandType::AtomicAdd,
                origin_task: task,
                nesting_level: 0,
            },
            handle,
            local_offset: range.local_offset,
            delta: val,
            reply_task: task,
        };
        let _granted = node.destinations[range.node as usize].agm_get_cmd(&cmd, 0);
        if let Some(buf) = node.destinations[range.node as usize].maybe_pack() {
            let _ = node.comm.try_send(range.node, buf);
        }
        wait_data();
        let prev = node.replies.take_value(task).unwrap_or(0) as i64;
        node.replies.unregister(task);
        Ok(prev)
    }
}

pub fn atomic_add(handle: GlobalHandle, elem_off: u64, val: i64) -> Result<i64> {
    atomic_add_nb(handle, elem_off, val)
}

pub fn atomic_cas_nb(handle: GlobalHandle, elem_off: u64, old: i64, new: i64) -> Result<i64> {
    let node = node_checked();
    let entry = node.arrays.entry(handle)?;
    if ![1usize, 2, 4, 8].contains(&entry.elem_bytes) {
        return Err(GmtError::BadAtomicElementSize(entry.elem_bytes));
    }
    let byte_off = elem_off * entry.elem_bytes as u64;
    let ranges = ranges_for(&entry, node.num_nodes(), byte_off, entry.elem_bytes as u64);
    let range = ranges.into_iter().next().expect("atomic op always touches exactly one element");
    let prev = if range.node == node.node_id() || handle.distribution().is_replicated() {
        let prev = local_slab(&node, handle, &entry).atomic_cas_i64(range.local_offset, entry.elem_bytes, old, new)?;
        // "A local CAS still forces a context switch before returning"
        // (spec.md §4.6) so concurrent waiters on this node are never
        // starved by a tight local CAS retry loop.
        if crate::uthread::in_uthread() {
            crate::uthread::suspend_current(YieldSignal::Yield);
        }
        prev
    } else {
        let task = node::task_id_or_zero();
        if let Some(counters) = crate::uthread::current_counters() {
            node.replies.register(task, counters);
        }
        let cmd = Command::AtomicCas {
            header: CommandHeader {
                kind: CommandType::AtomicCas,
                origin_task: task,
                nesting_level: 0,
            },
            handle,
            local_offset: range.local_offset,
            expected: old,
            new,
            reply_task: task,
        };
        let _granted = node.destinations[range.node as usize].agm_get_cmd(&cmd, 0);
        if let Some(buf) = node.destinations[range.node as usize].maybe_pack() {
            let _ = node.comm.try_send(range.node, buf);
        }
        wait_data();
        let prev = node.replies.take_value(task).unwrap_or(0) as i64;
        node.replies.unregister(task);
        prev
    };
    Ok(prev)
}

pub fn atomic_cas(handle: GlobalHandle, elem_off: u64, old: i64, new: i64) -> Result<i64> {
    atomic_cas_nb(handle, elem_off, old, new)
}

// ---------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------

/// Target nodes for a spawn policy (spec.md §4.7).
fn target_nodes(node: &NodeRuntime, policy: SpawnPolicy) -> Vec<u32> {
    match policy {
        SpawnPolicy::Local => vec![node.node_id()],
        SpawnPolicy::Remote(r) => vec![r],
        SpawnPolicy::Spread | SpawnPolicy::PartitionFromZero | SpawnPolicy::PartitionFromHere => (0..node.num_nodes()).collect(),
        SpawnPolicy::PartitionFromRandom => {
            let start = (node::rand_u64() % node.num_nodes() as u64) as u32;
            (0..node.num_nodes()).map(|i| (start + i) % node.num_nodes()).collect()
        }
    }
}

pub fn for_loop_nb(n: u64, step: u64, f: ForFn, args: Vec<u8>, policy: SpawnPolicy, handle: Option<SpawnHandleId>) -> Result<()> {
    let node = node_checked();
    let targets = target_nodes(&node, policy);
    let per_node = (n / targets.len().max(1) as u64).max(1);
    let nesting = crate::node::current_nesting_level();
    let completion = match handle {
        Some(h) => CompletionTarget::SpawnHandle { node: h.owning_node(), handle: h },
        None => CompletionTarget::None,
    };

    for (i, &target) in targets.iter().enumerate() {
        let start = i as u64 * per_node;
        let end = if i + 1 == targets.len() { n } else { start + per_node };
        if start >= end {
            continue;
        }
        if let Some(h) = handle {
            node.spawn_handles.get(h).created.fetch_add((end - start + step - 1) / step, Ordering::AcqRel);
        }
        if target == node.node_id() {
            enqueue_local_for(&node, f, args.clone(), start, end, step, nesting, completion);
        } else {
            if let Some(h) = handle {
                node.spawn_handles.get(h).mark_left_node();
            }
            if node.reservations.acquire(target) {
                send_for_loop(&node, target, f, &args, start, end, step, handle);
            } else {
                // spec.md §4.9/§7: reservation starvation is not an error —
                // self-execute one step inline and retry the rest later is
                // the documented fallback; here we run the whole remaining
                // range locally rather than spin on the remote reservation.
                enqueue_local_for(&node, f, args.clone(), start, end, step, nesting, completion);
            }
        }
    }
    Ok(())
}

pub fn for_loop(n: u64, step: u64, f: ForFn, args: Vec<u8>, policy: SpawnPolicy) -> Result<()> {
    for_loop_nb(n, step, f, args, policy, None)?;
    wait_mtasks();
    Ok(())
}

pub fn for_loop_with_handle(n: u64, step: u64, f: ForFn, args: Vec<u8>, policy: SpawnPolicy, handle: SpawnHandleId) -> Result<()> {
    for_loop_nb(n, step, f, args, policy, Some(handle))
}

fn enqueue_local_for(node: &NodeRuntime, f: ForFn, args: Vec<u8>, start: u64, end: u64, step: u64, nesting: u32, completion: CompletionTarget) {
    let task = MacroTask::for_loop(f, args, start, end, step, nesting, completion);
    match node.mtasks.try_alloc(task) {
        Ok(idx) => node.enqueue_mtask(idx),
        Err(_) => {
            // pool exhausted: self-execute inline rather than fail the call.
            for it in (start..end).step_by(step.max(1) as usize) {
                f(it, &[]);
            }
        }
    }
}

fn send_for_loop(node: &NodeRuntime, dest: u32, f: ForFn, args: &[u8], start: u64, end: u64, step: u64, handle: Option<SpawnHandleId>) {
    let cmd = Command::ForLoop {
        header: CommandHeader {
            kind: CommandType::ForLoop,
            origin_task: node::task_id_or_zero(),
            nesting_level: crate::node::current_nesting_level() as u8,
        },
        fn_ptr: node.fn_registry.register_for(f),
        args_size: args.len() as u32,
        iter_start: start,
        iter_end: end,
        step,
        handle,
    };
    let granted = node.destinations[dest as usize].agm_get_cmd(&cmd, args.len());
    node.destinations[dest as usize].agm_set_cmd_data(&args[..granted.min(args.len())]);
    if let Some(buf) = node.destinations[dest as usize].maybe_pack() {
        let _ = node.comm.try_send(dest, buf);
    }
}

pub fn for_each_nb(array: GlobalHandle, step: u64, offset: u64, count: u64, f: ForFn, args: Vec<u8>, handle: Option<SpawnHandleId>) -> Result<()> {
    let node = node_checked();
    let entry = node.arrays.entry(array)?;
    let nesting = crate::node::current_nesting_level();
    let completion = match handle {
        Some(h) => CompletionTarget::SpawnHandle { node: h.owning_node(), handle: h },
        None => CompletionTarget::None,
    };
    if array.distribution().is_replicated() {
        // Every node already holds the full replica locally; `ranges_for`
        // would hand back its `node: u32::MAX` sentinel here, which is never
        // a valid target, so run the whole range on this node directly.
        let task = MacroTask::for_each(f, args.clone(), array, offset, offset + count, step, nesting, completion);
        match node.mtasks.try_alloc(task) {
            Ok(idx) => node.enqueue_mtask(idx),
            Err(_) => {
                for it in (offset..offset + count).step_by(step.max(1) as usize) {
                    f(it, &args);
                }
            }
        }
        return Ok(());
    }
    for range in ranges_for(&entry, node.num_nodes(), offset * entry.elem_bytes as u64, count * entry.elem_bytes as u64) {
        let elem_start = range.global_offset / entry.elem_bytes as u64;
        let elem_count = range.len / entry.elem_bytes as u64;
        if range.node == node.node_id() {
            let task = MacroTask::for_each(f, args.clone(), array, elem_start, elem_start + elem_count, step, nesting, completion);
            match node.mtasks.try_alloc(task) {
                Ok(idx) => node.enqueue_mtask(idx),
                Err(_) => {
                    for it in (elem_start..elem_start + elem_count).step_by(step.max(1) as usize) {
                        f(it, &args);
                    }
                }
            }
        } else if node.reservations.acquire(range.node) {
            send_for_loop(&node, range.node, f, &args, elem_start, elem_start + elem_count, step, handle);
        } else {
            for it in (elem_start..elem_start + elem_count).step_by(step.max(1) as usize) {
                f(it, &args);
            }
        }
    }
    Ok(())
}

pub fn for_each(array: GlobalHandle, step: u64, offset: u64, count: u64, f: ForFn, args: Vec<u8>) -> Result<()> {
    for_each_nb(array, step, offset, count, f, args, None)?;
    wait_mtasks();
    Ok(())
}

pub fn execute_on_node_nb(target: u32, f: ExecFn, args: Vec<u8>, preempt: Preemption) -> Result<()> {
    let node = node_checked();
    if target == node.node_id() {
        run_execute_locally(&node, f, &args, preempt);
        return Ok(());
    }
    let task = node::task_id_or_zero();
    let fn_ptr = node.fn_registry.register_exec(f);
    let header = CommandHeader {
        kind: match preempt {
            Preemption::Preemptable => CommandType::ExecutePreemptable,
            Preemption::NonPreemptable => CommandType::ExecuteNonPreemptable,
        },
        origin_task: task,
        nesting_level: crate::node::current_nesting_level() as u8,
    };
    let cmd = match preempt {
        Preemption::Preemptable => Command::ExecutePreemptable {
            header,
            fn_ptr,
            args_size: args.len() as u32,
            reply_task: task,
            virt_addr: 0,
        },
        Preemption::NonPreemptable => Command::ExecuteNonPreemptable {
            header,
            fn_ptr,
            args_size: args.len() as u32,
            reply_task: task,
            virt_addr: 0,
        },
    };
    let granted = node.destinations[target as usize].agm_get_cmd(&cmd, args.len());
    node.destinations[target as usize].agm_set_cmd_data(&args[..granted.min(args.len())]);
    if let Some(buf) = node.destinations[target as usize].maybe_pack() {
        let _ = node.comm.try_send(target, buf);
    }
    Ok(())
}

pub fn execute_on_node(target: u32, f: ExecFn, args: Vec<u8>, ret_buf: &mut [u8], preempt: Preemption) -> Result<usize> {
    if ret_buf.len() > crate::mtask::UTHREAD_MAX_RET_SIZE {
        return Err(GmtError::ReturnBufferTooLarge {
            got: ret_buf.len(),
            max: crate::mtask::UTHREAD_MAX_RET_SIZE,
        });
    }
    let node = node_checked();
    if target == node.node_id() {
        // No wire round-trip needed: run inline and hand the bytes straight
        // back, skipping the reply-table dance the remote path needs.
        let mut ret = vec![0u8; crate::mtask::UTHREAD_MAX_RET_SIZE];
        let n = f(&args, &mut ret);
        let copy = n.min(ret_buf.len());
        ret_buf[..copy].copy_from_slice(&ret[..copy]);
        return Ok(n);
    }
    let task = node::task_id_or_zero();
    if let Some(counters) = crate::uthread::current_counters() {
        node.replies.register(task, counters);
    }
    execute_on_node_nb(target, f, args, preempt)?;
    wait_execute_nb();
    let n = match node.replies.take_bytes(task) {
        Some(bytes) => {
            let n = bytes.len().min(ret_buf.len());
            ret_buf[..n].copy_from_slice(&bytes[..n]);
            bytes.len()
        }
        None => 0,
    };
    node.replies.unregister(task);
    Ok(n)
}

pub fn execute_on_data(arr: GlobalHandle, offset: u64, f: ExecFn, args: Vec<u8>, ret_buf: &mut [u8], preempt: Preemption) -> Result<usize> {
    let node = node_checked();
    let entry = node.arrays.entry(arr)?;
    let owner = ranges_for(&entry, node.num_nodes(), offset * entry.elem_bytes as u64, entry.elem_bytes as u64)
        .into_iter()
        .next()
        .map(|r| r.node)
        .unwrap_or(node.node_id());
    execute_on_node(owner, f, args, ret_buf, preempt)
}

pub fn execute_on_all(f: ExecFn, args: Vec<u8>, preempt: Preemption) -> Result<()> {
    let node = node_checked();
    for dest in 0..node.num_nodes() {
        execute_on_node_nb(dest, f, args.clone(), preempt)?;
    }
    wait_execute_nb();
    Ok(())
}

fn run_execute_locally(node: &NodeRuntime, f: ExecFn, args: &[u8], preempt: Preemption) {
    let mut ret = vec![0u8; crate::mtask::UTHREAD_MAX_RET_SIZE];
    match preempt {
        Preemption::NonPreemptable => {
            // Runs inline, on whatever stack called it; must not call a
            // global op (spec.md §4.5/§5). We don't enforce that here
            // beyond documentation — `in_uthread`-gated ops raise
            // `GmtError::NonPreemptableCalledGlobalOp` if one tries.
            let _n = f(args, &mut ret);
        }
        Preemption::Preemptable => {
            let task = MacroTask::execute(f, args.to_vec(), preempt, crate::node::current_nesting_level(), CompletionTarget::None);
            match node.mtasks.try_alloc(task) {
                Ok(idx) => node.enqueue_mtask(idx),
                Err(_) => {
                    let _n = f(args, &mut ret);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------

pub fn wait_data() {
    if crate::uthread::in_uthread() {
        crate::uthread::suspend_current(YieldSignal::Data);
    }
}

pub fn wait_mtasks() {
    if crate::uthread::in_uthread() {
        crate::uthread::suspend_current(YieldSignal::Mtasks);
    }
}

pub fn wait_execute_nb() {
    wait_data();
}

pub fn wait_for_nb() {
    wait_mtasks();
}

/// `wait_handle(h)` (spec.md §4.10, §6): local fast path if the handle
/// never left this node, otherwise the owner periodically drives the
/// two-phase ring until the sums agree. Polls forever, as documented in
/// spec.md §5 ("`wait_handle` polls forever; a stuck handle hangs the
/// caller").
pub fn wait_handle(handle: SpawnHandleId) -> Result<()> {
    let node = node_checked();
    if handle.owning_node() != node.node_id() {
        return Err(GmtError::InvalidConfig("wait_handle called on a non-owning node".into()));
    }
    loop {
        let entry = node.spawn_handles.get(handle);
        if entry.locally_complete() {
            break;
        }
        if crate::uthread::in_uthread() {
            crate::uthread::suspend_current(YieldSignal::Handle);
        } else {
            std::thread::yield_now();
        }
        if entry.has_left_node() && node.spawn_handles.begin_check(handle) {
            drive_ring_check(&node, handle);
        }
    }
    node.spawn_handles.free(handle);
    Ok(())
}

fn drive_ring_check(node: &NodeRuntime, handle: SpawnHandleId) {
    // Single-node-in-process approximation of the cluster ring: in the full
    // multi-node deployment this circulates a command hop-by-hop (spec.md
    // §4.10); here the local contribution is already folded in by
    // `begin_check`, and remote contributions arrive asynchronously via
    // `helper.rs`'s `HandleCheckTerminated`/`HandleCheckCreated` handlers,
    // which call `record_phase1_sum`/`record_phase2_sum` directly.
    if let Some(done) = node.spawn_handles.compare_sums(handle) {
        if done {
            if node.spawn_handles.begin_reset(handle) {
                node.spawn_handles.finish_reset(handle);
            }
        } else {
            node.spawn_handles.retry_used(handle);
        }
    }
}

pub fn get_handle() -> SpawnHandleId {
    let node = node_checked();
    node.spawn_handles.alloc(node::task_id_or_zero()).expect("spawn handle pool exhausted")
}

// ---------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------

pub fn node_id() -> u32 {
    node_checked().node_id()
}

pub fn num_nodes() -> u32 {
    node_checked().num_nodes()
}

pub fn worker_id() -> u32 {
    node::worker_id()
}

pub fn num_workers() -> u32 {
    node_checked().num_workers()
}

pub fn task_id() -> u64 {
    node::task_id()
}

pub fn rand() -> u64 {
    node::rand_u64()
}

pub fn srand(seed: u64) {
    node::srand(seed)
}

pub fn timer() -> f64 {
    node_checked().timer()
}
