//! Helper threads (spec.md §4.5): drain one receive channel's buffers,
//! walk their `block_info` segments, and dispatch each command record by
//! its type tag.
//!
//! Supervised restart on panic: the spawning side wraps the worker closure
//! in `catch_unwind` and restarts it rather than letting one bad command
//! record bring the whole node down over a single malformed/unexpected
//! buffer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::command::{BlockInfo, Command};
use crate::memory::ops::LocalSlab;
use crate::node::NodeRuntime;

/// Registry of per-array local storage, separate from [`crate::memory::ArrayTable`]
/// (which holds only metadata) so the metadata lock is never held while a
/// helper is copying potentially-large payloads.
pub struct SlabRegistry {
    slabs: spin::Mutex<std::collections::HashMap<u64, Arc<LocalSlab>>>,
}

impl SlabRegistry {
    pub fn new() -> Self {
        SlabRegistry {
            slabs: spin::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn get_or_create(&self, handle_bits: u64, len: u64, zero_init: bool) -> Arc<LocalSlab> {
        let mut map = self.slabs.lock();
        map.entry(handle_bits).or_insert_with(|| Arc::new(LocalSlab::new(len, zero_init))).clone()
    }

    pub fn remove(&self, handle_bits: u64) {
        self.slabs.lock().remove(&handle_bits);
    }
}

/// Run a helper loop with automatic restart on panic, up to `max_restarts`
/// times before giving up and letting the node continue in a degraded
/// state (the comm server keeps queueing; a permanently-dead helper simply
/// stops draining its channel, which backs up rather than corrupting
/// state).
pub fn run_supervised(node: Arc<NodeRuntime>, slabs: Arc<SlabRegistry>, helper_id: u32, max_restarts: u32, running: &std::sync::atomic::AtomicBool) {
    let mut restarts = 0;
    while running.load(Ordering::Relaxed) && restarts <= max_restarts {
        let node = Arc::clone(&node);
        let slabs = Arc::clone(&slabs);
        let result = catch_unwind(AssertUnwindSafe(|| run_once(&node, &slabs, helper_id, running)));
        if result.is_err() {
            tracing::warn!(helper_id, restarts, "helper loop panicked, restarting");
            restarts += 1;
        } else {
            break;
        }
    }
}

fn run_once(node: &NodeRuntime, slabs: &SlabRegistry, helper_id: u32, running: &std::sync::atomic::AtomicBool) {
    while running.load(Ordering::Relaxed) {
        let Some(inbound) = node.comm.try_recv() else {
            std::thread::yield_now();
            continue;
        };
        dispatch_buffer(node, slabs, inbound.source, &inbound.bytes);
        let _ = helper_id;
    }
}

fn dispatch_buffer(node: &NodeRuntime, slabs: &SlabRegistry, source: u32, buf: &[u8]) {
    let Some((info, rest)) = BlockInfo::read(buf) else { return };
    let cmds_end = (info.cmds_bytes as usize).min(rest.len());
    let mut cmd_region = &rest[..cmds_end];
    let data_region = &rest[cmds_end..];
    let mut data_off = 0usize;

    while let Some((cmd, tail)) = Command::decode(cmd_region) {
        dispatch_command(node, slabs, source, &cmd, data_region, &mut data_off);
        cmd_region = tail;
        if cmd_region.is_empty() {
            break;
        }
    }
}

fn dispatch_command(node: &NodeRuntime, slabs: &SlabRegistry, source: u32, cmd: &Command, data_region: &[u8], data_off: &mut usize) {
    match cmd {
        Command::Allocate {
            num_elems,
            elem_bytes,
            policy,
            zero_init,
            reply_task,
            ..
        } => {
            let policy = decode_policy(*policy);
            match node.arrays.alloc(*num_elems, *elem_bytes as usize, policy, source, None, *zero_init) {
                Ok(handle) => reply_value(node, source, *reply_task, handle.0),
                Err(_) => reply_value(node, source, *reply_task, u64::MAX),
            }
        }
        Command::Free { handle, .. } => {
            let _ = node.arrays.free(*handle);
            slabs.remove(handle.0);
        }
        Command::Put {
            handle, local_offset, args_size, ..
        } => {
            if let Ok(entry) = node.arrays.entry(*handle) {
                let slab = slabs.get_or_create(handle.0, entry.local_bytes, handle.zero_init());
                let len = *args_size as usize;
                if data_region.len() >= *data_off + len {
                    let _ = slab.put(*local_offset, &data_region[*data_off..*data_off + len]);
                }
                *data_off += len;
            }
        }
        Command::PutValue {
            handle,
            local_offset,
            value,
            value_bytes,
            ..
        } => {
            if let Ok(entry) = node.arrays.entry(*handle) {
                let slab = slabs.get_or_create(handle.0, entry.local_bytes, handle.zero_init());
                let bytes = value.to_le_bytes();
                let _ = slab.put(*local_offset, &bytes[..*value_bytes as usize]);
            }
        }
        Command::Get {
            handle,
            local_offset,
            len,
            reply_task,
            ..
        } => {
            if let Ok(entry) = node.arrays.entry(*handle) {
                let slab = slabs.get_or_create(handle.0, entry.local_bytes, handle.zero_init());
                let mut out = vec![0u8; *len as usize];
                if slab.get(*local_offset, *len as usize, &mut out).is_ok() {
                    reply_bytes(node, source, *reply_task, &out);
                }
            }
        }
        Command::AtomicAdd {
            handle,
            local_offset,
            delta,
            reply_task,
            ..
        } => {
            if let Ok(entry) = node.arrays.entry(*handle) {
                let slab = slabs.get_or_create(handle.0, entry.local_bytes, handle.zero_init());
                if let Ok(prev) = slab.atomic_add_i64(*local_offset, entry.elem_bytes, *delta) {
                    reply_value(node, source, *reply_task, prev as u64);
                }
            }
        }
        Command::AtomicCas {
            handle,
            local_offset,
            expected,
            new,
            reply_task,
            ..
        } => {
            if let Ok(entry) = node.arrays.entry(*handle) {
                let slab = slabs.get_or_create(handle.0, entry.local_bytes, handle.zero_init());
                if let Ok(prev) = slab.atomic_cas_i64(*local_offset, entry.elem_bytes, *expected, *new) {
                    reply_value(node, source, *reply_task, prev as u64);
                }
            }
        }
        Command::ForCompletion { parent_task, count, .. } => {
            crate::worker::complete_iteration(node, task_to_mtask_idx(*parent_task), *count);
        }
        Command::ExecuteCompletion { .. } => {
            // Reply delivery for execute_* is modelled the same as
            // for-completion at the mtask layer; no extra work here beyond
            // what `ForCompletion`'s handler already does generically.
        }
        Command::HandleCheckTerminated { handle, running_sum, .. } => {
            node.spawn_handles.record_phase1_sum(*handle, *running_sum + local_terminated(node, *handle));
        }
        Command::HandleCheckCreated { handle, running_sum, .. } => {
            node.spawn_handles.record_phase2_sum(*handle, *running_sum + local_created(node, *handle));
        }
        Command::HandleCheckReset { handle, .. } => {
            node.spawn_handles.finish_reset(*handle);
        }
        Command::ReservationRequest { requested, header } => {
            let granted = node.reservations.reply_grant(*requested, node.mtasks.len() as u32);
            let reply = Command::ReservationReply {
                header: crate::command::CommandHeader {
                    kind: crate::command::CommandType::ReservationReply,
                    origin_task: header.origin_task,
                    nesting_level: 0,
                },
                granted,
            };
            send_one(node, source, &reply);
        }
        Command::ReservationReply { granted, .. } => {
            node.reservations.grant(source, *granted);
        }
        Command::ForLoop {
            header,
            fn_ptr,
            args_size,
            iter_start,
            iter_end,
            step,
            handle,
        } => {
            let Some(f) = node.fn_registry.for_fn(*fn_ptr) else {
                tracing::warn!(fn_ptr, "for_loop arrived for an unregistered fn id");
                return;
            };
            let len = *args_size as usize;
            let args = if data_region.len() >= *data_off + len {
                data_region[*data_off..*data_off + len].to_vec()
            } else {
                Vec::new()
            };
            *data_off += len;
            let completion = match handle {
                Some(h) => crate::mtask::CompletionTarget::SpawnHandle { node: h.owning_node(), handle: *h },
                None => crate::mtask::CompletionTarget::RemoteParent {
                    node: source,
                    parent_task: header.origin_task,
                    nesting_level: header.nesting_level as u32,
                },
            };
            let task = crate::mtask::MacroTask::for_loop(f, args, *iter_start, *iter_end, *step, header.nesting_level as u32, completion);
            match node.mtasks.try_alloc(task) {
                Ok(idx) => node.enqueue_mtask(idx),
                Err(_) => tracing::warn!("mtask pool exhausted, dropping incoming for_loop"),
            }
        }
        Command::ExecutePreemptable {
            header,
            fn_ptr,
            args_size,
            reply_task,
            ..
        }
        | Command::ExecuteNonPreemptable {
            header,
            fn_ptr,
            args_size,
            reply_task,
            ..
        } => {
            let Some(f) = node.fn_registry.exec_fn(*fn_ptr) else {
                tracing::warn!(fn_ptr, "execute arrived for an unregistered fn id");
                return;
            };
            let len = *args_size as usize;
            let args = if data_region.len() >= *data_off + len {
                data_region[*data_off..*data_off + len].to_vec()
            } else {
                Vec::new()
            };
            *data_off += len;
            let non_preemptable = matches!(cmd, Command::ExecuteNonPreemptable { .. });
            if non_preemptable {
                // Runs inline on this helper's own stack, per spec.md §4.5;
                // must not itself call a global op.
                let mut ret = vec![0u8; crate::mtask::UTHREAD_MAX_RET_SIZE];
                let n = f(&args, &mut ret);
                ret.truncate(n);
                reply_bytes(node, source, *reply_task, &ret);
            } else {
                let completion = crate::mtask::CompletionTarget::RemoteParent {
                    node: source,
                    parent_task: header.origin_task,
                    nesting_level: header.nesting_level as u32,
                };
                let task = crate::mtask::MacroTask::execute(f, args, crate::mtask::Preemption::Preemptable, header.nesting_level as u32, completion);
                match node.mtasks.try_alloc(task) {
                    Ok(idx) => node.enqueue_mtask(idx),
                    Err(_) => tracing::warn!("mtask pool exhausted, dropping incoming execute"),
                }
            }
        }
        Command::ReplyAck { header } => {
            node.replies.deliver_ack(header.origin_task);
        }
        Command::ReplyValue { header, value } => {
            node.replies.deliver_value(header.origin_task, *value);
        }
        Command::ReplyGetBytes { header, len } => {
            let n = *len as usize;
            if data_region.len() >= *data_off + n {
                let bytes = data_region[*data_off..*data_off + n].to_vec();
                node.replies.deliver_bytes(header.origin_task, bytes);
            }
            *data_off += n;
        }
    }
}

fn decode_policy(bits: u8) -> crate::handle::Distribution {
    match bits {
        0 => crate::handle::Distribution::Local,
        1 => crate::handle::Distribution::PartitionFromZero,
        2 => crate::handle::Distribution::PartitionFromRandom,
        3 => crate::handle::Distribution::PartitionFromHere,
        4 => crate::handle::Distribution::Remote,
        _ => crate::handle::Distribution::Replicate,
    }
}

fn task_to_mtask_idx(task: u64) -> u32 {
    task as u32
}

fn local_terminated(node: &NodeRuntime, handle: crate::spawn_handle::SpawnHandleId) -> u64 {
    node.spawn_handles.get(handle).terminated.load(Ordering::Acquire)
}

fn local_created(node: &NodeRuntime, handle: crate::spawn_handle::SpawnHandleId) -> u64 {
    node.spawn_handles.get(handle).created.load(Ordering::Acquire)
}

fn reply_value(node: &NodeRuntime, dest: u32, reply_task: u64, value: u64) {
    let cmd = Command::ReplyValue {
        header: crate::command::CommandHeader {
            kind: crate::command::CommandType::ReplyValue,
            origin_task: reply_task,
            nesting_level: 0,
        },
        value,
    };
    send_one(node, dest, &cmd);
}

fn reply_bytes(node: &NodeRuntime, dest: u32, reply_task: u64, bytes: &[u8]) {
    let cmd = Command::ReplyGetBytes {
        header: crate::command::CommandHeader {
            kind: crate::command::CommandType::ReplyGetBytes,
            origin_task: reply_task,
            nesting_level: 0,
        },
        len: bytes.len() as u32,
    };
    let granted = node.destinations[dest as usize].agm_get_cmd(&cmd, bytes.len());
    node.destinations[dest as usize].agm_set_cmd_data(&bytes[..granted.min(bytes.len())]);
    if let Some(buf) = node.destinations[dest as usize].maybe_pack() {
        let _ = node.comm.try_send(dest, buf);
    }
}

fn send_one(node: &NodeRuntime, dest: u32, cmd: &Command) {
    let _granted = node.destinations[dest as usize].agm_get_cmd(cmd, 0);
    if let Some(buf) = node.destinations[dest as usize].maybe_pack() {
        let _ = node.comm.try_send(dest, buf);
    }
}
