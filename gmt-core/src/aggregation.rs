//! Command aggregation (spec.md §4.3): `agm_get_cmd`/`agm_set_cmd_data`
//! and the pack-and-send path that turns queued command blocks into
//! network buffers.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::command::{BlockInfo, Command, BLOCK_INFO_LEN};

/// One command block: a destination-bound batch of command records plus
/// their out-of-band data fragments, built up by `agm_get_cmd`/
/// `agm_set_cmd_data` until full or timed out, then pushed whole.
pub struct CommandBlock {
    pub cmds: Vec<u8>,
    pub data: Vec<u8>,
    capacity: usize,
}

impl CommandBlock {
    pub fn new(capacity: usize) -> Self {
        CommandBlock {
            cmds: Vec::with_capacity(capacity / 2),
            data: Vec::with_capacity(capacity / 2),
            capacity,
        }
    }

    fn used(&self) -> usize {
        BLOCK_INFO_LEN + self.cmds.len() + self.data.len()
    }

    fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// spec.md §4.3: "guaranteeing that cmdSize + min(reqDataSize, granted)
    /// <= remaining capacity". Returns the data allowance actually granted;
    /// `None` if even `cmd_size` alone does not fit (caller must push this
    /// block and start a fresh one).
    pub fn try_reserve(&mut self, cmd: &Command, req_data_size: usize) -> Option<usize> {
        let cmd_bytes = cmd.encode();
        if cmd_bytes.len() > self.remaining() {
            return None;
        }
        let granted = req_data_size.min(self.remaining() - cmd_bytes.len());
        self.cmds.extend_from_slice(&cmd_bytes);
        Some(granted)
    }

    pub fn set_cmd_data(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.used());
        BlockInfo {
            cmds_bytes: self.cmds.len() as u32,
            data_bytes: self.data.len() as u32,
        }
        .write(&mut out);
        out.extend_from_slice(&self.cmds);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Per-destination aggregation state: the currently-open block (one per
/// issuing thread in the full design; simplified here to one open block per
/// destination guarded by a spinlock, since GMT's worker count per node is
/// small relative to network latency) plus queued, already-pushed blocks
/// awaiting packing into a buffer.
pub struct Destination {
    open: spin::Mutex<CommandBlock>,
    pushed_blocks: spin::Mutex<Vec<Vec<u8>>>,
    /// Estimated in-queue bytes, compared against `COMM_BUFFER_SIZE` to
    /// decide whether to attempt a pack (spec.md §4.3 "Aggregate-and-send").
    estimated_bytes: AtomicI64,
    block_capacity: usize,
    comm_buffer_size: usize,
}

impl Destination {
    pub fn new(block_capacity: usize, comm_buffer_size: usize) -> Self {
        Destination {
            open: spin::Mutex::new(CommandBlock::new(block_capacity)),
            pushed_blocks: spin::Mutex::new(Vec::new()),
            estimated_bytes: AtomicI64::new(0),
            block_capacity,
            comm_buffer_size,
        }
    }

    /// `agm_get_cmd`: append `cmd` to the open block, rotating to a fresh
    /// block first if it doesn't fit. Returns the data allowance granted
    /// for this record's out-of-band fragment.
    pub fn agm_get_cmd(&self, cmd: &Command, req_data_size: usize) -> usize {
        let mut open = self.open.lock();
        if let Some(granted) = open.try_reserve(cmd, req_data_size) {
            return granted;
        }
        self.push_locked(&mut open);
        *open = CommandBlock::new(self.block_capacity);
        open.try_reserve(cmd, req_data_size)
            .expect("a single command must always fit an empty block (invariant a)")
    }

    pub fn agm_set_cmd_data(&self, bytes: &[u8]) {
        self.open.lock().set_cmd_data(bytes);
    }

    fn push_locked(&self, open: &mut CommandBlock) {
        if open.is_empty() {
            return;
        }
        let bytes = std::mem::replace(open, CommandBlock::new(self.block_capacity)).into_bytes();
        self.estimated_bytes.fetch_add(bytes.len() as i64, Ordering::AcqRel);
        self.pushed_blocks.lock().push(bytes);
    }

    /// Push whatever is open (used by the periodic timeout flush) and
    /// attempt a pack afterwards, `is_timeout = true` so partial buffers are
    /// allowed through.
    pub fn flush_timeout(&self) -> Option<Vec<u8>> {
        {
            let mut open = self.open.lock();
            self.push_locked(&mut open);
        }
        self.try_pack(true)
    }

    /// Called right after a block is pushed; if the estimated backlog has
    /// reached `COMM_BUFFER_SIZE`, attempt to pack pushed blocks into one
    /// outgoing buffer (spec.md §4.3).
    pub fn maybe_pack(&self) -> Option<Vec<u8>> {
        if self.estimated_bytes.load(Ordering::Acquire) as usize >= self.comm_buffer_size {
            self.try_pack(false)
        } else {
            None
        }
    }

    fn try_pack(&self, is_timeout: bool) -> Option<Vec<u8>> {
        if !is_timeout {
            let prev = self.estimated_bytes.fetch_sub(self.comm_buffer_size as i64, Ordering::AcqRel);
            if prev < self.comm_buffer_size as i64 {
                // Raced with another packer; restore and bail (spec.md §4.3:
                // "if the estimate underflowed due to a race, restore it").
                self.estimated_bytes.fetch_add(self.comm_buffer_size as i64, Ordering::AcqRel);
                return None;
            }
        }
        let mut blocks = self.pushed_blocks.lock();
        if blocks.is_empty() {
            if !is_timeout {
                self.estimated_bytes.fetch_add(self.comm_buffer_size as i64, Ordering::AcqRel);
            }
            return None;
        }
        let mut buf = Vec::with_capacity(self.comm_buffer_size);
        let mut taken = 0;
        for block in blocks.iter() {
            if buf.len() + block.len() > self.comm_buffer_size {
                break;
            }
            buf.extend_from_slice(block);
            taken += 1;
        }
        if taken == 0 && is_timeout && !blocks.is_empty() {
            // Timeout packs are allowed to be partial, but a single block
            // must still fit an empty buffer (invariant a); if it somehow
            // doesn't, something upstream violated the block/buffer sizing
            // contract and there is nothing safe to do but drop nothing and
            // report no buffer this cycle.
            return None;
        }
        blocks.drain(0..taken);
        if buf.is_empty() {
            if !is_timeout {
                self.estimated_bytes.fetch_add(self.comm_buffer_size as i64, Ordering::AcqRel);
            }
            return None;
        }
        Some(buf)
    }

    pub fn estimated_bytes(&self) -> i64 {
        self.estimated_bytes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandHeader, CommandType};

    fn ack(origin_task: u64) -> Command {
        Command::ReplyAck {
            header: CommandHeader {
                kind: CommandType::ReplyAck,
                origin_task,
                nesting_level: 0,
            },
        }
    }

    #[test]
    fn single_command_always_fits_an_empty_block() {
        let dest = Destination::new(4096, 65536);
        let granted = dest.agm_get_cmd(&ack(1), 100);
        assert!(granted <= 100);
    }

    #[test]
    fn pushed_block_has_nonzero_cmds_bytes() {
        let dest = Destination::new(4096, 65536);
        dest.agm_get_cmd(&ack(1), 0);
        {
            let mut open = dest.open.lock();
            dest.push_locked(&mut open);
        }
        let blocks = dest.pushed_blocks.lock();
        assert_eq!(blocks.len(), 1);
        let (bi, _) = BlockInfo::read(&blocks[0]).unwrap();
        assert!(bi.cmds_bytes > 0, "invariant (b): cmds_bytes > 0 in any pushed block");
    }

    #[test]
    fn timeout_flush_packs_partial_backlog() {
        let dest = Destination::new(4096, 65536);
        dest.agm_get_cmd(&ack(1), 0);
        let buf = dest.flush_timeout();
        assert!(buf.is_some());
    }

    #[test]
    fn pack_restores_estimate_on_empty_backlog_race() {
        let dest = Destination::new(4096, 16);
        // Nothing pushed yet, but force the estimate over threshold to
        // simulate the race window between an estimate bump and the actual
        // push landing.
        dest.estimated_bytes.store(100, Ordering::Relaxed);
        let before = dest.estimated_bytes();
        let packed = dest.try_pack(false);
        assert!(packed.is_none());
        assert_eq!(dest.estimated_bytes(), before, "estimate must be restored when nothing to pack");
    }
}
