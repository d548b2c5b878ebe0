//! Fixed-size network buffers and their pool (spec.md §4.4, §6).
//!
//! Every buffer the comm server sends or receives into comes from this
//! pool; `comm_buffer_size` bounds both send and receive allocations so the
//! pool's total footprint is fixed at `init` time.

use crate::queue::MpmcQueue;

pub struct NetBuffer {
    pub bytes: Vec<u8>,
}

impl NetBuffer {
    fn fresh(capacity: usize) -> Self {
        NetBuffer { bytes: Vec::with_capacity(capacity) }
    }
}

/// A fixed pool of reusable buffers, sized `num_buffs_per_channel ×
/// num_channels` in the full deployment; exposed here as one flat pool
/// since send and receive buffers are interchangeable once drained.
pub struct BufferPool {
    slots: Vec<spin::Mutex<Option<NetBuffer>>>,
    free: MpmcQueue,
    capacity: usize,
}

impl BufferPool {
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Self {
        let free = MpmcQueue::new(pool_size.next_power_of_two().max(1));
        for i in 0..pool_size as u64 {
            free.try_push(i).expect("fresh buffer pool accepts all indices");
        }
        BufferPool {
            slots: (0..pool_size).map(|_| spin::Mutex::new(Some(NetBuffer::fresh(buffer_capacity)))).collect(),
            free,
            capacity: buffer_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn try_acquire(&self) -> Option<u32> {
        self.free.try_pop().map(|i| i as u32)
    }

    pub fn with_mut<R>(&self, idx: u32, f: impl FnOnce(&mut NetBuffer) -> R) -> R {
        let mut guard = self.slots[idx as usize].lock();
        f(guard.as_mut().expect("with_mut on empty buffer slot"))
    }

    pub fn release(&self, idx: u32) {
        self.slots[idx as usize].lock().as_mut().expect("release on empty slot").bytes.clear();
        let _ = self.free.try_push(idx as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycle() {
        let pool = BufferPool::new(4, 1024);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.try_acquire().unwrap());
        }
        assert!(pool.try_acquire().is_none());
        pool.release(held[0]);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn buffer_is_cleared_on_release() {
        let pool = BufferPool::new(1, 64);
        let idx = pool.try_acquire().unwrap();
        pool.with_mut(idx, |b| b.bytes.extend_from_slice(&[1, 2, 3]));
        pool.release(idx);
        let idx = pool.try_acquire().unwrap();
        pool.with_mut(idx, |b| assert!(b.bytes.is_empty()));
    }
}
